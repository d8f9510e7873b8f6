//! Read-only resources under the `odoo://` scheme.
//!
//! Grammar: `odoo://{category}/{path}` with categories `system`, `config`,
//! `model` and `record`. Record queries accept a URL-encoded JSON domain and
//! a capped limit. Every read consults the safety gate for model visibility
//! and field stripping before anything leaves the server.

mod subscriptions;

pub use subscriptions::{SUBSCRIPTION_LIMIT, SubscriptionManager};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use url::Url;

use crate::classifier::{ErrorCategory, ErrorResponse};
use crate::domain::validate_domain;
use crate::normalize::normalize_records;
use crate::state::AppState;

/// Maximum records a query resource returns.
const QUERY_LIMIT_CAP: usize = 100;
const QUERY_LIMIT_DEFAULT: usize = 20;

/// A parsed resource address.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceUri {
    SystemInfo,
    SystemModules,
    SystemToolsets,
    ConfigSafety,
    ModelFields(String),
    ModelMethods(String),
    ModelStates(String),
    Record { model: String, id: i64 },
    RecordQuery {
        model: String,
        domain: Option<Value>,
        limit: usize,
    },
}

impl ResourceUri {
    /// Only individual records and the system info support subscriptions.
    pub fn subscribable(&self) -> bool {
        matches!(self, ResourceUri::Record { .. } | ResourceUri::SystemInfo)
    }
}

fn bad_uri(uri: &str, reason: impl Into<String>) -> Box<ErrorResponse> {
    Box::new(
        ErrorResponse::new(
            ErrorCategory::Validation,
            "INVALID_RESOURCE_URI",
            reason,
            "Valid forms: odoo://system/info, odoo://model/{name}/fields, odoo://record/{model}/{id}, odoo://record/{model}?domain=...&limit=20.",
        )
        .with_details(json!({"uri": uri})),
    )
}

/// Parse an `odoo://` URI.
pub fn parse_uri(uri: &str) -> Result<ResourceUri, Box<ErrorResponse>> {
    let parsed = Url::parse(uri).map_err(|e| bad_uri(uri, format!("unparseable URI: {e}")))?;
    if parsed.scheme() != "odoo" {
        return Err(bad_uri(uri, format!("unknown scheme '{}'", parsed.scheme())));
    }
    let category = parsed.host_str().unwrap_or_default();
    let segments: Vec<&str> = parsed
        .path()
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (category, segments.as_slice()) {
        ("system", ["info"]) => Ok(ResourceUri::SystemInfo),
        ("system", ["modules"]) => Ok(ResourceUri::SystemModules),
        ("system", ["toolsets"]) => Ok(ResourceUri::SystemToolsets),
        ("config", ["safety"]) => Ok(ResourceUri::ConfigSafety),
        ("model", [model, "fields"]) => Ok(ResourceUri::ModelFields(model.to_string())),
        ("model", [model, "methods"]) => Ok(ResourceUri::ModelMethods(model.to_string())),
        ("model", [model, "states"]) => Ok(ResourceUri::ModelStates(model.to_string())),
        ("record", [model, id]) => {
            let id: i64 = id
                .parse()
                .map_err(|_| bad_uri(uri, format!("record id '{}' is not an integer", id)))?;
            Ok(ResourceUri::Record {
                model: model.to_string(),
                id,
            })
        }
        ("record", [model]) => {
            let mut domain = None;
            let mut limit = QUERY_LIMIT_DEFAULT;
            for (key, value) in parsed.query_pairs() {
                match key.as_ref() {
                    "domain" => {
                        let decoded: Value = serde_json::from_str(value.as_ref())
                            .map_err(|e| bad_uri(uri, format!("domain is not JSON: {e}")))?;
                        validate_domain(&decoded)?;
                        domain = Some(decoded);
                    }
                    "limit" => {
                        limit = value
                            .parse::<usize>()
                            .map_err(|_| bad_uri(uri, "limit is not an integer"))?
                            .clamp(1, QUERY_LIMIT_CAP);
                    }
                    _ => {}
                }
            }
            Ok(ResourceUri::RecordQuery {
                model: model.to_string(),
                domain,
                limit,
            })
        }
        _ => Err(bad_uri(uri, "unrecognized category or path")),
    }
}

/// Descriptor for listings: `(uri, name, description)`.
pub fn static_resources() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        (
            "odoo://system/info",
            "Backend information",
            "Connected backend version, edition, protocol and connection state",
        ),
        (
            "odoo://system/modules",
            "Installed modules",
            "Modules installed on the connected backend",
        ),
        (
            "odoo://system/toolsets",
            "Toolset registration report",
            "Which toolsets registered and which were skipped, with reasons",
        ),
        (
            "odoo://config/safety",
            "Safety policy",
            "Active mode and filter list sizes",
        ),
    ]
}

/// Templated descriptors: `(uri_template, name, description)`.
pub fn resource_templates() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        (
            "odoo://model/{model}/fields",
            "Model fields",
            "Field metadata for a model from the registry",
        ),
        (
            "odoo://model/{model}/methods",
            "Model methods",
            "Known method metadata for a model",
        ),
        (
            "odoo://model/{model}/states",
            "Model states",
            "Ordered state machine values for a model",
        ),
        (
            "odoo://record/{model}/{id}",
            "Single record",
            "One record by id, normalized and subscribable",
        ),
        (
            "odoo://record/{model}?domain={domain}&limit={limit}",
            "Record query",
            "Records matching a URL-encoded JSON domain (limit capped at 100)",
        ),
    ]
}

/// Resource read dispatch.
pub struct ResourceEngine {
    app: Arc<AppState>,
}

impl ResourceEngine {
    pub fn new(app: Arc<AppState>) -> Self {
        Self { app }
    }

    pub async fn read(&self, uri: &str) -> Result<Value, Box<ErrorResponse>> {
        let parsed = parse_uri(uri)?;
        self.read_parsed(&parsed).await
    }

    pub async fn read_parsed(&self, uri: &ResourceUri) -> Result<Value, Box<ErrorResponse>> {
        match uri {
            ResourceUri::SystemInfo => self.system_info().await,
            ResourceUri::SystemModules => self.system_modules().await,
            ResourceUri::SystemToolsets => Ok(self.toolset_report()),
            ResourceUri::ConfigSafety => Ok(self.safety_summary()),
            ResourceUri::ModelFields(model) => self.model_fields(model).await,
            ResourceUri::ModelMethods(model) => self.model_methods(model).await,
            ResourceUri::ModelStates(model) => self.model_states(model).await,
            ResourceUri::Record { model, id } => self.record(model, *id).await,
            ResourceUri::RecordQuery {
                model,
                domain,
                limit,
            } => self.record_query(model, domain.clone(), *limit).await,
        }
    }

    async fn system_info(&self) -> Result<Value, Box<ErrorResponse>> {
        let app = &self.app;
        let version = app.connection.version().await;
        Ok(json!({
            "url": app.connection.url(),
            "database": app.connection.database(),
            "uid": app.connection.uid().await,
            "state": format!("{:?}", app.connection.state().await),
            "version": version.as_ref().map(|v| v.full_string.clone()),
            "major": version.as_ref().map(|v| v.major),
            "edition": version.as_ref().map(|v| v.edition.to_string()),
        }))
    }

    async fn system_modules(&self) -> Result<Value, Box<ErrorResponse>> {
        let rows = self
            .app
            .backend_call(
                "ir.module.module",
                "search_read",
                vec![json!([["state", "=", "installed"]])],
                [("fields".to_string(), json!(["name", "shortdesc", "latest_version"]))]
                    .into_iter()
                    .collect::<HashMap<_, _>>(),
                None,
            )
            .await?;
        Ok(json!({"modules": rows}))
    }

    fn toolset_report(&self) -> Value {
        match self.app.toolset_report.get() {
            Some(report) => json!(report),
            None => json!({"registered": [], "skipped": []}),
        }
    }

    fn safety_summary(&self) -> Value {
        let policy = self.app.gate.policy();
        json!({
            "mode": policy.mode.to_string(),
            "model_allowlist": policy.model_allowlist.len(),
            "model_blocklist": policy.model_blocklist.len(),
            "write_allowlist": policy.write_allowlist.iter().collect::<Vec<_>>(),
            "field_blocklist": policy.field_blocklist.len(),
            "method_blocklist": policy.method_blocklist.len(),
        })
    }

    fn check_model(&self, model: &str) -> Result<(), Box<ErrorResponse>> {
        self.app
            .gate
            .check(crate::safety::Operation::Read, model, None, None)
    }

    async fn model_fields(&self, model: &str) -> Result<Value, Box<ErrorResponse>> {
        self.check_model(model)?;
        let registry = self.app.registry.snapshot().await;
        let Some(info) = registry.get_model(model) else {
            return Err(unknown_model(model));
        };
        let fields: Value = info
            .fields
            .values()
            .filter(|f| !self.app.gate.policy().is_field_blocked(&f.name))
            .map(|f| json!(f))
            .collect();
        Ok(json!({"model": model, "fields": fields}))
    }

    async fn model_methods(&self, model: &str) -> Result<Value, Box<ErrorResponse>> {
        self.check_model(model)?;
        let registry = self.app.registry.snapshot().await;
        let Some(info) = registry.get_model(model) else {
            return Err(unknown_model(model));
        };
        let methods: Value = info.methods.values().map(|m| json!(m)).collect();
        Ok(json!({"model": model, "methods": methods}))
    }

    async fn model_states(&self, model: &str) -> Result<Value, Box<ErrorResponse>> {
        self.check_model(model)?;
        let registry = self.app.registry.snapshot().await;
        let Some(info) = registry.get_model(model) else {
            return Err(unknown_model(model));
        };
        let states: Vec<Value> = info
            .states
            .iter()
            .flatten()
            .map(|(value, label)| json!({"value": value, "label": label}))
            .collect();
        Ok(json!({"model": model, "states": states}))
    }

    async fn record(&self, model: &str, id: i64) -> Result<Value, Box<ErrorResponse>> {
        self.check_model(model)?;
        let rows = self
            .app
            .backend_call(model, "read", vec![json!([id])], HashMap::new(), None)
            .await?;
        let registry = self.app.registry.snapshot().await;
        let normalized = normalize_records(rows, registry.get_model(model), None, self.app.normalize);
        let record = normalized
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .ok_or_else(|| {
                Box::new(
                    ErrorResponse::new(
                        ErrorCategory::NotFound,
                        "RECORD_NOT_FOUND",
                        format!("No record {} on {}", id, model),
                        "Use odoo_records_search_read to find current ids.",
                    )
                    .with_details(json!({"model": model, "id": id})),
                )
            })?;
        Ok(self.strip_blocked_fields(record))
    }

    async fn record_query(
        &self,
        model: &str,
        domain: Option<Value>,
        limit: usize,
    ) -> Result<Value, Box<ErrorResponse>> {
        self.check_model(model)?;
        let mut kwargs: HashMap<String, Value> = HashMap::new();
        kwargs.insert("limit".to_string(), json!(limit));
        let rows = self
            .app
            .backend_call(
                model,
                "search_read",
                vec![domain.unwrap_or_else(|| json!([]))],
                kwargs,
                None,
            )
            .await?;
        let registry = self.app.registry.snapshot().await;
        let normalized = normalize_records(rows, registry.get_model(model), None, self.app.normalize);
        let records: Vec<Value> = normalized
            .as_array()
            .map(|rows| rows.iter().cloned().map(|r| self.strip_blocked_fields(r)).collect())
            .unwrap_or_default();
        Ok(json!({"model": model, "count": records.len(), "records": records}))
    }

    fn strip_blocked_fields(&self, record: Value) -> Value {
        match record {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(name, _)| !self.app.gate.policy().is_field_blocked(name))
                    .collect(),
            ),
            other => other,
        }
    }
}

fn unknown_model(model: &str) -> Box<ErrorResponse> {
    Box::new(
        ErrorResponse::new(
            ErrorCategory::NotFound,
            "MODEL_NOT_IN_REGISTRY",
            format!("Model '{}' is not in the registry", model),
            "Use odoo_records_list_models to see known models; the registry only refreshes explicitly.",
        )
        .with_details(json!({"model": model})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_and_config_uris() {
        assert_eq!(parse_uri("odoo://system/info").unwrap(), ResourceUri::SystemInfo);
        assert_eq!(
            parse_uri("odoo://system/toolsets").unwrap(),
            ResourceUri::SystemToolsets
        );
        assert_eq!(
            parse_uri("odoo://config/safety").unwrap(),
            ResourceUri::ConfigSafety
        );
    }

    #[test]
    fn parses_model_uris() {
        assert_eq!(
            parse_uri("odoo://model/res.partner/fields").unwrap(),
            ResourceUri::ModelFields("res.partner".to_string())
        );
        assert_eq!(
            parse_uri("odoo://model/sale.order/states").unwrap(),
            ResourceUri::ModelStates("sale.order".to_string())
        );
    }

    #[test]
    fn parses_record_uri() {
        assert_eq!(
            parse_uri("odoo://record/res.partner/42").unwrap(),
            ResourceUri::Record {
                model: "res.partner".to_string(),
                id: 42
            }
        );
        assert!(parse_uri("odoo://record/res.partner/forty-two").is_err());
    }

    #[test]
    fn parses_record_query_with_encoded_domain() {
        let domain = urlencoding::encode(r#"[["name","ilike","acme"]]"#).into_owned();
        let uri = format!("odoo://record/res.partner?domain={}&limit=500", domain);
        match parse_uri(&uri).unwrap() {
            ResourceUri::RecordQuery {
                model,
                domain,
                limit,
            } => {
                assert_eq!(model, "res.partner");
                assert!(domain.is_some());
                // Cap applies.
                assert_eq!(limit, QUERY_LIMIT_CAP);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn query_limit_defaults() {
        match parse_uri("odoo://record/res.partner").unwrap() {
            ResourceUri::RecordQuery { limit, .. } => assert_eq!(limit, QUERY_LIMIT_DEFAULT),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn rejects_foreign_schemes_and_bad_paths() {
        assert!(parse_uri("file:///etc/passwd").is_err());
        assert!(parse_uri("odoo://system/unknown").is_err());
        assert!(parse_uri("odoo://model/res.partner").is_err());
    }

    #[test]
    fn subscribability() {
        assert!(parse_uri("odoo://record/res.partner/1").unwrap().subscribable());
        assert!(parse_uri("odoo://system/info").unwrap().subscribable());
        assert!(!parse_uri("odoo://system/modules").unwrap().subscribable());
        assert!(!parse_uri("odoo://model/res.partner/fields").unwrap().subscribable());
    }
}
