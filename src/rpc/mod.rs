//! Wire adapters for the backend's three RPC protocols.
//!
//! Every adapter speaks one protocol and nothing else: XML-RPC for
//! versions 14-16, JSON-RPC for 17-18, and the bearer-token REST interface
//! for 19+. They share the [`WireAdapter`] contract and normalize nothing
//! beyond deserialization; relational tuples, date strings and base64
//! binaries pass through untouched for the tool layer to shape.

mod jsonrpc;
mod rest;
mod xml_codec;
mod xmlrpc;

pub use jsonrpc::JsonRpcAdapter;
pub use rest::RestAdapter;
pub use xmlrpc::XmlRpcAdapter;

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Which wire protocol an adapter speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    LegacyXml,
    LegacyJson,
    ModernRest,
}

impl Protocol {
    /// Protocol selection by backend major version.
    pub fn for_major(major: u32) -> Self {
        match major {
            0..=16 => Protocol::LegacyXml,
            17 | 18 => Protocol::LegacyJson,
            _ => Protocol::ModernRest,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::LegacyXml => write!(f, "legacy-xml"),
            Protocol::LegacyJson => write!(f, "legacy-json"),
            Protocol::ModernRest => write!(f, "modern-rest"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy-xml" | "xmlrpc" | "xml-rpc" => Ok(Protocol::LegacyXml),
            "legacy-json" | "jsonrpc" | "json-rpc" => Ok(Protocol::LegacyJson),
            "modern-rest" | "rest" | "json2" => Ok(Protocol::ModernRest),
            _ => Err(format!("unknown protocol: {}", s)),
        }
    }
}

/// TLS behavior shared by every adapter's HTTP client.
#[derive(Clone, Debug)]
pub struct TlsOptions {
    pub verify_ssl: bool,
    /// Extra trusted root in PEM form, for self-signed deployments.
    pub ca_pem: Option<Vec<u8>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_ssl: true,
            ca_pem: None,
        }
    }
}

impl TlsOptions {
    pub fn insecure() -> Self {
        Self {
            verify_ssl: false,
            ca_pem: None,
        }
    }

    pub(crate) fn client(
        &self,
        timeout: std::time::Duration,
        cookies: bool,
    ) -> RpcResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(cookies)
            .danger_accept_invalid_certs(!self.verify_ssl);
        if let Some(pem) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| RpcError::Protocol(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder.build()?)
    }

    pub(crate) fn blocking_client(
        &self,
        timeout: std::time::Duration,
    ) -> RpcResult<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!self.verify_ssl);
        if let Some(pem) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| RpcError::Protocol(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder.build()?)
    }
}

/// Unified backend fault carried across the adapter boundary.
///
/// Adapters parse the last line of any included traceback matching
/// `ClassName: message` into `error_class`; the classifier consumes the
/// structured fields and never re-parses raw payloads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcFault {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl RpcFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Build a fault from a raw message plus optional traceback, extracting
    /// `error_class` from the last `ClassName: message` line of the trace.
    pub fn from_backend(message: impl Into<String>, traceback: Option<String>) -> Self {
        static LAST_EXC_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?m)^([A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception|Warning)):\s*(.+)\s*$")
                .unwrap_or_else(|e| panic!("invalid exception regex: {e}"))
        });

        let mut fault = Self::new(message);
        if let Some(trace) = traceback {
            if let Some(caps) = LAST_EXC_RE.captures_iter(&trace).last() {
                fault.error_class = caps.get(1).map(|m| m.as_str().to_string());
                if let Some(msg) = caps.get(2) {
                    fault.message = msg.as_str().to_string();
                }
            }
            fault.traceback = Some(trace);
        }
        fault
    }

    pub fn with_call(mut self, model: &str, method: &str) -> Self {
        self.model = Some(model.to_string());
        self.method = Some(method.to_string());
        self
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_class {
            Some(class) => write!(f, "{}: {}", class, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Adapter-level errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The backend rejected the call with a structured fault
    #[error("backend fault: {0}")]
    Fault(RpcFault),

    /// Credentials rejected, or uid resolved to 0/false
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The session cookie or token is no longer valid
    #[error("session expired")]
    SessionExpired,

    /// Transport-level failure (connect, TLS, timeout at the socket)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response could not be decoded as the protocol requires
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The call exceeded its deadline
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled by shutdown or caller
    #[error("operation cancelled")]
    Cancelled,
}

impl RpcError {
    /// True when reconnecting and retrying may succeed.
    pub fn is_connection_shaped(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::SessionExpired | RpcError::Timeout(_)
        )
    }

    /// True when the failure indicates rejected credentials.
    pub fn is_auth_shaped(&self) -> bool {
        match self {
            RpcError::AuthenticationFailed(_) | RpcError::SessionExpired => true,
            RpcError::Fault(fault) => fault
                .error_class
                .as_deref()
                .is_some_and(|c| c.contains("AccessDenied")),
            _ => false,
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Execution context merged into every backend call.
pub type Context = HashMap<String, Value>;

/// Shallow overlay of `call` over `base`, leaving `base` untouched.
pub fn merge_context(base: &Context, call: Option<&Context>) -> Context {
    let mut merged = base.clone();
    if let Some(overlay) = call {
        for (key, value) in overlay {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// The contract every wire adapter implements.
///
/// `execute` merges the per-call context over the connection's base context
/// (never mutating it), invokes the backend, and surfaces failures as
/// [`RpcError`]. Adapters are protocol plumbing only.
#[async_trait]
pub trait WireAdapter: Send + Sync + fmt::Debug {
    /// Which protocol this adapter speaks.
    fn protocol(&self) -> Protocol;

    /// Authenticate and return the backend uid. A uid of 0 or `false` is a
    /// rejection and fails with [`RpcError::AuthenticationFailed`].
    async fn authenticate(&self, db: &str, login: &str, credential: &str) -> RpcResult<i64>;

    /// Invoke `model.method(args, kwargs)` with the merged context.
    async fn execute(
        &self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        context: Option<&Context>,
    ) -> RpcResult<Value>;

    /// The backend's self-description (`version` endpoint or equivalent).
    async fn version_info(&self) -> RpcResult<Value>;

    /// Release network resources. Safe to call more than once.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_selection_table() {
        assert_eq!(Protocol::for_major(14), Protocol::LegacyXml);
        assert_eq!(Protocol::for_major(16), Protocol::LegacyXml);
        assert_eq!(Protocol::for_major(17), Protocol::LegacyJson);
        assert_eq!(Protocol::for_major(18), Protocol::LegacyJson);
        assert_eq!(Protocol::for_major(19), Protocol::ModernRest);
        assert_eq!(Protocol::for_major(25), Protocol::ModernRest);
    }

    #[test]
    fn fault_extracts_last_traceback_line() {
        let trace = "Traceback (most recent call last):\n  File \"x.py\", line 1\n    raise ValidationError(msg)\nodoo.exceptions.ValidationError: partner_id is required\n";
        let fault = RpcFault::from_backend("Odoo Server Error", Some(trace.to_string()));
        assert_eq!(
            fault.error_class.as_deref(),
            Some("odoo.exceptions.ValidationError")
        );
        assert_eq!(fault.message, "partner_id is required");
        assert!(fault.traceback.is_some());
    }

    #[test]
    fn fault_without_traceback_keeps_message() {
        let fault = RpcFault::from_backend("database does not exist", None);
        assert_eq!(fault.error_class, None);
        assert_eq!(fault.message, "database does not exist");
    }

    #[test]
    fn context_merge_does_not_mutate_base() {
        let mut base = Context::new();
        base.insert("lang".into(), "en_US".into());
        base.insert("tz".into(), "UTC".into());

        let mut call = Context::new();
        call.insert("tz".into(), "Europe/Berlin".into());
        call.insert("active_test".into(), false.into());

        let merged = merge_context(&base, Some(&call));
        assert_eq!(merged["tz"], "Europe/Berlin");
        assert_eq!(merged["lang"], "en_US");
        assert_eq!(merged["active_test"], false);
        // base still pristine
        assert_eq!(base["tz"], "UTC");
        assert_eq!(base.len(), 2);
    }
}
