//! Backend version and edition detection.
//!
//! Three probes run in order, each under a bounded timeout: the
//! unauthenticated XML-RPC `version()` call, a JSON-RPC authenticate whose
//! session payload reports `server_version`, and finally a scrape of the
//! login page's generator meta tag. When everything fails the prober assumes
//! the oldest supported major (14) and the XML-RPC protocol, with a warning,
//! so startup still completes against unusual deployments.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::rpc::{Protocol, RpcResult, TlsOptions, WireAdapter, XmlRpcAdapter};
use crate::version::{Edition, OdooVersion};

/// Major version assumed when no probe succeeds.
const FALLBACK_MAJOR: u32 = 14;

/// Module whose presence marks an enterprise install.
const ENTERPRISE_MARKER_MODULE: &str = "web_enterprise";

pub struct VersionProber {
    url: String,
    db: String,
    username: String,
    credential: String,
    probe_timeout: Duration,
    tls: TlsOptions,
}

impl VersionProber {
    pub fn new(
        url: impl Into<String>,
        db: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            db: db.into(),
            username: username.into(),
            credential: credential.into(),
            probe_timeout: Duration::from_secs(10),
            tls: TlsOptions::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Run the probe sequence and return the detected version plus the
    /// protocol selected for it.
    pub async fn probe(&self) -> (OdooVersion, Protocol) {
        for (label, probe) in [
            ("xmlrpc-version", Probe::XmlRpc),
            ("jsonrpc-session", Probe::JsonRpcSession),
            ("login-page", Probe::LoginPage),
        ] {
            match tokio::time::timeout(self.probe_timeout, self.run(probe)).await {
                Ok(Ok(version)) => {
                    let protocol = Protocol::for_major(version.major);
                    debug!(probe = label, version = %version.full_string, %protocol, "version probe succeeded");
                    return (version, protocol);
                }
                Ok(Err(e)) => debug!(probe = label, error = %e, "version probe failed"),
                Err(_) => debug!(probe = label, "version probe timed out"),
            }
        }

        warn!(
            assumed_major = FALLBACK_MAJOR,
            "all version probes failed; assuming version {} with XML-RPC", FALLBACK_MAJOR
        );
        (OdooVersion::new(FALLBACK_MAJOR, 0), Protocol::LegacyXml)
    }

    async fn run(&self, probe: Probe) -> RpcResult<OdooVersion> {
        match probe {
            Probe::XmlRpc => self.probe_xmlrpc().await,
            Probe::JsonRpcSession => self.probe_jsonrpc_session().await,
            Probe::LoginPage => self.probe_login_page().await,
        }
    }

    async fn probe_xmlrpc(&self) -> RpcResult<OdooVersion> {
        let adapter = XmlRpcAdapter::new(&self.url, self.probe_timeout, self.tls.clone());
        let info = adapter.version_info().await;
        adapter.close().await;
        parse_version_payload(&info?)
            .ok_or_else(|| crate::rpc::RpcError::Protocol("unparseable version payload".into()))
    }

    async fn probe_jsonrpc_session(&self) -> RpcResult<OdooVersion> {
        let client = self.tls.client(self.probe_timeout, false)?;
        let response = client
            .post(format!("{}/web/session/authenticate", self.url))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "call",
                "params": {"db": self.db, "login": self.username, "password": self.credential},
            }))
            .send()
            .await?
            .error_for_status()?;
        let envelope: Value = response.json().await?;
        let result = envelope.get("result").cloned().unwrap_or(Value::Null);
        parse_version_payload(&result)
            .ok_or_else(|| crate::rpc::RpcError::Protocol("session carried no version".into()))
    }

    async fn probe_login_page(&self) -> RpcResult<OdooVersion> {
        static GENERATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"<meta\s+name="generator"\s+content="Odoo\s*([^"]*)""#)
                .unwrap_or_else(|e| panic!("invalid generator regex: {e}"))
        });
        static ASSET_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"/web/assets/[^\s\x22']*?(\d{2})\.(\d)[^\s\x22']*")
                .unwrap_or_else(|e| panic!("invalid asset regex: {e}"))
        });

        let client = self.tls.client(self.probe_timeout, false)?;
        let html = client
            .get(format!("{}/web/login", self.url))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if let Some(caps) = GENERATOR_RE.captures(&html) {
            let raw = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if let Some(version) = OdooVersion::parse(raw) {
                return Ok(version);
            }
            // Generator tags sometimes carry only the major.
            if let Ok(major) = raw.parse::<u32>() {
                return Ok(OdooVersion::new(major, 0));
            }
        }
        if let Some(caps) = ASSET_RE.captures(&html) {
            let major: u32 = caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let minor: u32 = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            if major >= 10 {
                return Ok(OdooVersion::new(major, minor));
            }
        }
        Err(crate::rpc::RpcError::Protocol(
            "login page carried no version marker".into(),
        ))
    }
}

enum Probe {
    XmlRpc,
    JsonRpcSession,
    LoginPage,
}

/// Parse a version out of a backend payload that may carry
/// `server_version_info` (tuple form) and/or `server_version` (string form).
/// The session-info enterprise flag, when present, decides the edition.
pub fn parse_version_payload(payload: &Value) -> Option<OdooVersion> {
    let mut version = payload
        .get("server_version_info")
        .and_then(Value::as_array)
        .and_then(|parts| OdooVersion::from_tuple(parts))
        .or_else(|| {
            payload
                .get("server_version")
                .and_then(Value::as_str)
                .and_then(OdooVersion::parse)
        })?;

    // Tuple form appends an edition marker as a sixth element.
    let tuple_marker = payload
        .get("server_version_info")
        .and_then(Value::as_array)
        .and_then(|parts| parts.get(5))
        .and_then(Value::as_str);
    match tuple_marker {
        Some("e") => version.edition = Edition::Enterprise,
        Some("") => version.edition = Edition::Community,
        _ => {
            if let Some(raw) = payload.get("server_version").and_then(Value::as_str) {
                if raw.contains("+e") || raw.ends_with('e') {
                    version.edition = Edition::Enterprise;
                }
            }
        }
    }
    if version.full_string.is_empty() {
        version.full_string = format!("{}.{}", version.major, version.minor);
    }
    Some(version)
}

/// Resolve an Unknown edition by probing for the enterprise marker module.
/// Requires an authenticated adapter; downgrades to Community with a warning
/// when the probe cannot decide.
pub async fn detect_edition(adapter: &dyn WireAdapter) -> Edition {
    let result = adapter
        .execute(
            "ir.module.module",
            "search_count",
            vec![json!([
                ["name", "=", ENTERPRISE_MARKER_MODULE],
                ["state", "=", "installed"]
            ])],
            Default::default(),
            None,
        )
        .await;

    match result {
        Ok(value) if value.as_i64().unwrap_or(0) > 0 => Edition::Enterprise,
        Ok(_) => Edition::Community,
        Err(e) => {
            warn!(error = %e, "edition probe failed; assuming community");
            Edition::Community
        }
    }
}
