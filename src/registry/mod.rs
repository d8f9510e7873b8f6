//! Model metadata knowledge base.
//!
//! The registry merges two sources into one shape: a statically generated
//! JSON snapshot (rich method metadata from source parsing) and live
//! introspection of the connected backend (current fields and states). It is
//! built once at startup and on explicit refresh, never on a timer.

mod introspect;
mod merge;

pub use introspect::{DEFAULT_INTROSPECT_MODELS, Introspector};
pub use merge::merge;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::version::OdooVersion;

/// Methods the backend rejects keyword arguments for; consulted before every
/// `execute` dispatch so kwargs are stripped instead of faulting.
pub static NO_KWARGS_METHODS: LazyLock<std::collections::HashSet<&'static str>> =
    LazyLock::new(|| {
        [
            "action_confirm",
            "action_cancel",
            "action_done",
            "action_draft",
            "action_post",
            "action_unpost",
            "button_validate",
            "button_confirm",
            "button_cancel",
            "button_draft",
            "toggle_active",
            "unlink",
        ]
        .into_iter()
        .collect()
    });

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Char,
    Text,
    Html,
    Integer,
    Float,
    Monetary,
    Boolean,
    Date,
    Datetime,
    Binary,
    Selection,
    Many2one,
    One2many,
    Many2many,
    Reference,
}

impl FieldType {
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            FieldType::Many2one | FieldType::One2many | FieldType::Many2many
        )
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "char" => Some(FieldType::Char),
            "text" => Some(FieldType::Text),
            "html" => Some(FieldType::Html),
            "integer" => Some(FieldType::Integer),
            "float" => Some(FieldType::Float),
            "monetary" => Some(FieldType::Monetary),
            "boolean" => Some(FieldType::Boolean),
            "date" => Some(FieldType::Date),
            "datetime" => Some(FieldType::Datetime),
            "binary" => Some(FieldType::Binary),
            "selection" => Some(FieldType::Selection),
            "many2one" => Some(FieldType::Many2one),
            "one2many" => Some(FieldType::One2many),
            "many2many" => Some(FieldType::Many2many),
            "reference" => Some(FieldType::Reference),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_true")]
    pub store: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    /// Co-model for relational fields. May name a model the registry has not
    /// loaded; lookups treat that as unresolved rather than an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl FieldInfo {
    /// Build from one entry of a `fields_get` payload.
    pub fn from_wire(name: &str, attrs: &Value) -> Option<Self> {
        let field_type = attrs
            .get("type")
            .and_then(Value::as_str)
            .and_then(FieldType::from_wire)?;
        let selection = attrs.get("selection").and_then(Value::as_array).map(|raw| {
            raw.iter()
                .filter_map(|pair| {
                    let pair = pair.as_array()?;
                    Some((
                        value_to_string(pair.first()?),
                        value_to_string(pair.get(1)?),
                    ))
                })
                .collect()
        });
        Some(Self {
            name: name.to_string(),
            label: attrs
                .get("string")
                .and_then(Value::as_str)
                .unwrap_or(name)
                .to_string(),
            field_type,
            required: attrs.get("required").and_then(Value::as_bool).unwrap_or(false),
            readonly: attrs.get("readonly").and_then(Value::as_bool).unwrap_or(false),
            store: attrs.get("store").and_then(Value::as_bool).unwrap_or(true),
            help: attrs
                .get("help")
                .and_then(Value::as_str)
                .map(str::to_string),
            relation: attrs
                .get("relation")
                .and_then(Value::as_str)
                .map(str::to_string),
            selection,
            default: None,
            groups: None,
            compute: attrs
                .get("compute")
                .and_then(Value::as_str)
                .map(str::to_string),
            depends: None,
        })
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub accepts_kwargs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorator: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodInfo>,
    /// Ordered `(value, label)` pairs of the state machine, when the model
    /// has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub parent_models: Vec<String>,
    #[serde(default)]
    pub has_chatter: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Static,
    Dynamic,
    Merged,
}

/// The knowledge base proper; plain data, (de)serializable as the static
/// snapshot format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registry {
    pub models: BTreeMap<String, ModelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<OdooVersion>,
    pub build_mode: BuildMode,
    pub build_timestamp: String,
    pub model_count: usize,
    pub field_count: usize,
}

impl Registry {
    pub fn empty(build_mode: BuildMode) -> Self {
        Self {
            models: BTreeMap::new(),
            version: None,
            build_mode,
            build_timestamp: chrono::Utc::now().to_rfc3339(),
            model_count: 0,
            field_count: 0,
        }
    }

    pub fn from_models(models: BTreeMap<String, ModelInfo>, build_mode: BuildMode) -> Self {
        let mut registry = Self {
            models,
            version: None,
            build_mode,
            build_timestamp: chrono::Utc::now().to_rfc3339(),
            model_count: 0,
            field_count: 0,
        };
        registry.recount();
        registry
    }

    pub fn recount(&mut self) {
        self.model_count = self.models.len();
        self.field_count = self.models.values().map(|m| m.fields.len()).sum();
    }

    /// Load a statically generated snapshot.
    pub fn load_static(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Registry(format!("cannot read {}: {}", path.display(), e)))?;
        let mut registry: Registry = serde_json::from_str(&raw)
            .map_err(|e| Error::Registry(format!("invalid registry snapshot: {}", e)))?;
        registry.build_mode = BuildMode::Static;
        registry.recount();
        Ok(registry)
    }

    pub fn get_model(&self, model: &str) -> Option<&ModelInfo> {
        self.models.get(model)
    }

    pub fn get_field(&self, model: &str, field: &str) -> Option<&FieldInfo> {
        self.models.get(model)?.fields.get(field)
    }

    pub fn get_method(&self, model: &str, method: &str) -> Option<&MethodInfo> {
        self.models.get(model)?.methods.get(method)
    }

    /// Model names, ordered, optionally filtered by substring.
    pub fn list_models(&self, filter: Option<&str>) -> Vec<&str> {
        self.models
            .keys()
            .filter(|name| filter.is_none_or(|f| name.contains(f)))
            .map(String::as_str)
            .collect()
    }

    pub fn get_required_fields(&self, model: &str) -> Vec<&FieldInfo> {
        self.models
            .get(model)
            .map(|m| m.fields.values().filter(|f| f.required).collect())
            .unwrap_or_default()
    }

    /// The field driving the model's state machine: a selection field named
    /// `state`, or any selection field whose name ends in `state`.
    pub fn get_state_field(&self, model: &str) -> Option<&FieldInfo> {
        let info = self.models.get(model)?;
        info.fields
            .get("state")
            .filter(|f| f.field_type == FieldType::Selection)
            .or_else(|| {
                info.fields
                    .values()
                    .find(|f| f.field_type == FieldType::Selection && f.name.ends_with("state"))
            })
    }

    pub fn get_relational_fields(&self, model: &str) -> Vec<&FieldInfo> {
        self.models
            .get(model)
            .map(|m| {
                m.fields
                    .values()
                    .filter(|f| f.field_type.is_relational())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn method_accepts_kwargs(&self, method: &str) -> bool {
        !NO_KWARGS_METHODS.contains(method)
    }
}

/// The registry service: owns the current [`Registry`], rebuilds it on
/// request, and answers existence checks with a connection-lifetime cache.
pub struct ModelRegistry {
    connection: Arc<ConnectionManager>,
    registry: RwLock<Arc<Registry>>,
    /// Positive and negative existence outcomes, keyed by model name.
    existence: DashMap<String, bool>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry").finish()
    }
}

impl ModelRegistry {
    pub fn new(connection: Arc<ConnectionManager>, registry: Registry) -> Self {
        Self {
            connection,
            registry: RwLock::new(Arc::new(registry)),
            existence: DashMap::new(),
        }
    }

    /// The current snapshot. Cheap to clone and stable for the caller's
    /// lifetime; refreshes swap the arc.
    pub async fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&*self.registry.read().await)
    }

    /// Replace the registry (explicit refresh only) and reset the existence
    /// cache, since the model universe may have changed.
    pub async fn replace(&self, registry: Registry) {
        info!(
            models = registry.model_count,
            fields = registry.field_count,
            mode = ?registry.build_mode,
            "registry refreshed"
        );
        *self.registry.write().await = Arc::new(registry);
        self.existence.clear();
    }

    /// Registry lookup first; on miss a cheap backend count, with both
    /// outcomes cached for the connection lifetime.
    pub async fn model_exists(&self, model: &str) -> bool {
        if self.registry.read().await.models.contains_key(model) {
            return true;
        }
        if let Some(cached) = self.existence.get(model) {
            return *cached;
        }

        let exists = self
            .connection
            .execute(
                model,
                "search_count",
                vec![json!([])],
                [("limit".to_string(), json!(0))].into_iter().collect(),
                None,
            )
            .await
            .is_ok();
        debug!(model, exists, "model existence resolved via backend");
        self.existence.insert(model.to_string(), exists);
        exists
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn field(name: &str, field_type: FieldType) -> FieldInfo {
        FieldInfo {
            name: name.to_string(),
            label: name.to_string(),
            field_type,
            required: false,
            readonly: false,
            store: true,
            help: None,
            relation: None,
            selection: None,
            default: None,
            groups: None,
            compute: None,
            depends: None,
        }
    }

    pub(crate) fn model(name: &str, fields: Vec<FieldInfo>) -> ModelInfo {
        ModelInfo {
            model: name.to_string(),
            name: name.to_string(),
            description: String::new(),
            transient: false,
            fields: fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
            methods: BTreeMap::new(),
            states: None,
            parent_models: Vec::new(),
            has_chatter: false,
        }
    }

    #[test]
    fn field_info_from_wire_payload() {
        let attrs = json!({
            "type": "many2one",
            "string": "Customer",
            "required": true,
            "relation": "res.partner",
        });
        let field = FieldInfo::from_wire("partner_id", &attrs).unwrap();
        assert_eq!(field.field_type, FieldType::Many2one);
        assert!(field.required);
        assert_eq!(field.relation.as_deref(), Some("res.partner"));
    }

    #[test]
    fn from_wire_rejects_unknown_types() {
        assert!(FieldInfo::from_wire("x", &json!({"type": "serialized"})).is_none());
    }

    #[test]
    fn state_field_lookup() {
        let mut state = field("state", FieldType::Selection);
        state.selection = Some(vec![
            ("draft".into(), "Draft".into()),
            ("sale".into(), "Confirmed".into()),
        ]);
        let registry = Registry::from_models(
            [(
                "sale.order".to_string(),
                model("sale.order", vec![state, field("name", FieldType::Char)]),
            )]
            .into(),
            BuildMode::Static,
        );
        assert_eq!(registry.get_state_field("sale.order").unwrap().name, "state");
        assert!(registry.get_state_field("missing").is_none());
    }

    #[test]
    fn list_models_filters_by_substring() {
        let registry = Registry::from_models(
            [
                ("sale.order".to_string(), model("sale.order", vec![])),
                ("res.partner".to_string(), model("res.partner", vec![])),
            ]
            .into(),
            BuildMode::Static,
        );
        assert_eq!(registry.list_models(Some("sale")), vec!["sale.order"]);
        assert_eq!(registry.list_models(None).len(), 2);
    }

    #[test]
    fn no_kwargs_set_is_consulted() {
        let registry = Registry::empty(BuildMode::Static);
        assert!(!registry.method_accepts_kwargs("action_confirm"));
        assert!(registry.method_accepts_kwargs("search_read"));
    }

    #[test]
    fn counts_follow_models() {
        let registry = Registry::from_models(
            [(
                "res.partner".to_string(),
                model(
                    "res.partner",
                    vec![field("name", FieldType::Char), field("email", FieldType::Char)],
                ),
            )]
            .into(),
            BuildMode::Dynamic,
        );
        assert_eq!(registry.model_count, 1);
        assert_eq!(registry.field_count, 2);
    }
}
