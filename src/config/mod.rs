//! Layered configuration.
//!
//! Priority: CLI flags over environment variables over the JSON config file
//! over built-in defaults. Each layer only overlays what it actually sets.
//! List options accept comma-separated strings; booleans accept
//! `true/1/yes` and `false/0/no`.

mod cli;
mod env;

pub use cli::Cli;
pub use env::apply_env;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Parse a flexible boolean. Unrecognized values are an error so typos in
/// env vars fail loudly at startup.
pub(crate) fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::Config(format!("not a boolean: '{}'", other))),
    }
}

/// Split a comma-separated list, dropping empty entries.
pub(crate) fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub api_key: Option<String>,
    /// auto, legacy-xml, legacy-json or modern-rest
    pub protocol: String,
    pub timeout_secs: u64,
    pub verify_ssl: bool,
    pub ca_cert: Option<PathBuf>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8069".to_string(),
            database: String::new(),
            username: String::new(),
            password: None,
            api_key: None,
            protocol: "auto".to_string(),
            timeout_secs: 30,
            verify_ssl: true,
            ca_cert: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    /// stdio, sse or http
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: "stdio".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8765,
            path: "/mcp".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetySettings {
    /// readonly, restricted or full
    pub mode: String,
    pub model_allow: Vec<String>,
    pub model_deny: Vec<String>,
    pub write_allow: Vec<String>,
    pub field_deny: Vec<String>,
    pub method_deny: Vec<String>,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            mode: "readonly".to_string(),
            model_allow: Vec::new(),
            model_deny: Vec::new(),
            write_allow: Vec::new(),
            field_deny: Vec::new(),
            method_deny: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsetSettings {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySettings {
    pub static_path: Option<PathBuf>,
    pub introspect_on_startup: bool,
    /// Replaces the default target list wholesale when non-empty.
    pub introspect_models: Vec<String>,
    pub introspect_budget_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            static_path: None,
            introspect_on_startup: true,
            introspect_models: Vec::new(),
            introspect_budget_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Total calls per minute across reads and writes; 0 disables.
    pub rpm: u32,
    /// Total calls per hour; 0 disables.
    pub rph: u32,
    pub read_rpm: u32,
    pub write_rpm: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rpm: 120,
            rph: 2000,
            read_rpm: 120,
            write_rpm: 30,
            burst: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSettings {
    pub enabled: bool,
    pub file: PathBuf,
    pub log_reads: bool,
    pub log_writes: bool,
    pub log_deletes: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            file: PathBuf::from("odoo-mcp-audit.jsonl"),
            log_reads: false,
            log_writes: true,
            log_deletes: true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextSettings {
    pub lang: Option<String>,
    pub tz: Option<String>,
    pub company_id: Option<i64>,
    pub company_ids: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchSettings {
    pub default_limit: usize,
    pub max_limit: usize,
    pub deep_search_depth: u8,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_limit: 80,
            max_limit: 500,
            deep_search_depth: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplaySettings {
    pub strip_html: bool,
    pub normalize_relational: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            strip_html: true,
            normalize_relational: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    pub check_interval_secs: u64,
    pub reconnect_max: u32,
    pub backoff_base_secs: u64,
    pub subscription_poll_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            reconnect_max: 3,
            backoff_base_secs: 1,
            subscription_poll_secs: 60,
        }
    }
}

/// The complete configuration tree.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub transport: TransportSettings,
    pub safety: SafetySettings,
    pub toolsets: ToolsetSettings,
    pub registry: RegistrySettings,
    pub rate_limit: RateLimitSettings,
    pub audit: AuditSettings,
    pub context: ContextSettings,
    pub search: SearchSettings,
    pub display: DisplaySettings,
    pub logging: LoggingSettings,
    pub health: HealthSettings,
}

impl Settings {
    /// Overlay a JSON config file onto the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Assemble the full priority chain: defaults, then the optional file,
    /// then the environment, then CLI flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut settings = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        apply_env(&mut settings)?;
        cli.apply(&mut settings)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Startup-fatal checks.
    pub fn validate(&self) -> Result<()> {
        if self.connection.url.is_empty() {
            return Err(Error::Config("connection.url is required".to_string()));
        }
        if self.connection.database.is_empty() {
            return Err(Error::Config("connection.database is required".to_string()));
        }
        if self.connection.username.is_empty() {
            return Err(Error::Config("connection.username is required".to_string()));
        }
        if self.connection.password.is_none() && self.connection.api_key.is_none() {
            return Err(Error::Config(
                "either connection.password or connection.api_key is required".to_string(),
            ));
        }
        self.safety_mode()?;
        match self.connection.protocol.as_str() {
            "auto" => {}
            other => {
                other
                    .parse::<crate::rpc::Protocol>()
                    .map_err(Error::Config)?;
            }
        }
        match self.transport.kind.as_str() {
            "stdio" | "sse" | "http" => {}
            other => {
                return Err(Error::Config(format!("unknown transport kind '{}'", other)));
            }
        }
        if self.search.max_limit == 0 || self.search.default_limit == 0 {
            return Err(Error::Config("search limits must be positive".to_string()));
        }
        Ok(())
    }

    pub fn safety_mode(&self) -> Result<crate::safety::SafetyMode> {
        self.safety.mode.parse().map_err(Error::Config)
    }

    pub fn forced_protocol(&self) -> Option<crate::rpc::Protocol> {
        match self.connection.protocol.as_str() {
            "auto" => None,
            other => other.parse().ok(),
        }
    }

    /// The immutable per-connection base context.
    pub fn base_context(&self) -> crate::rpc::Context {
        let mut context = crate::rpc::Context::new();
        if let Some(lang) = &self.context.lang {
            context.insert("lang".to_string(), serde_json::json!(lang));
        }
        if let Some(tz) = &self.context.tz {
            context.insert("tz".to_string(), serde_json::json!(tz));
        }
        if !self.context.company_ids.is_empty() {
            context.insert(
                "allowed_company_ids".to_string(),
                serde_json::json!(self.context.company_ids),
            );
        } else if let Some(company) = self.context.company_id {
            context.insert("allowed_company_ids".to_string(), serde_json::json!([company]));
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Settings {
        let mut settings = Settings::default();
        settings.connection.database = "prod".to_string();
        settings.connection.username = "svc-mcp".to_string();
        settings.connection.password = Some("secret".to_string());
        settings
    }

    #[test]
    fn defaults_are_safe() {
        let settings = Settings::default();
        assert_eq!(settings.safety.mode, "readonly");
        assert_eq!(settings.transport.kind, "stdio");
        assert!(settings.rate_limit.enabled);
        assert!(!settings.audit.enabled);
        assert_eq!(settings.health.check_interval_secs, 300);
    }

    #[test]
    fn validate_requires_credentials() {
        let mut settings = minimal();
        assert!(settings.validate().is_ok());
        settings.connection.password = None;
        assert!(settings.validate().is_err());
        settings.connection.api_key = Some("key".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_enums() {
        let mut settings = minimal();
        settings.safety.mode = "yolo".to_string();
        assert!(settings.validate().is_err());

        let mut settings = minimal();
        settings.connection.protocol = "soap".to_string();
        assert!(settings.validate().is_err());

        let mut settings = minimal();
        settings.transport.kind = "carrier-pigeon".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bool_and_list_parsing() {
        assert!(parse_bool("YES").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("no").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
        assert_eq!(parse_list("a, b,,c"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn base_context_prefers_company_ids() {
        let mut settings = minimal();
        settings.context.lang = Some("de_DE".to_string());
        settings.context.company_id = Some(1);
        settings.context.company_ids = vec![1, 2];
        let context = settings.base_context();
        assert_eq!(context["lang"], serde_json::json!("de_DE"));
        assert_eq!(context["allowed_company_ids"], serde_json::json!([1, 2]));
    }

    #[test]
    fn file_overlay_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"connection": {"database": "prod", "username": "svc", "api_key": "k"},
               "safety": {"mode": "restricted", "write_allow": ["sale.order"]}}"#,
        )
        .unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.safety.mode, "restricted");
        assert_eq!(settings.safety.write_allow, vec!["sale.order"]);
        // Untouched sections keep their defaults.
        assert_eq!(settings.search.default_limit, 80);
    }
}
