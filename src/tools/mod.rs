//! Tool framework: trait contract, registry and annotations.
//!
//! Tools are registered dynamically (the visible set depends on the safety
//! mode and toolset gating), so the registry holds trait objects rather than
//! a compile-time router. Typed inputs come from [`SchemaTool`], which
//! derives the JSON schema with schemars.

mod records;
mod search;
mod toolset;
mod wizard;

pub use records::RecordsToolset;
pub use search::{DeepSearchToolset, SearchProfile, search_profile};
pub use toolset::{
    ListToolsetsTool, RegistrationReport, Toolset, ToolsetEnv, ToolsetMetadata, register_toolsets,
};
pub use wizard::{KnownWizard, WizardToolset, known_wizards};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::classifier::ErrorResponse;
use crate::safety::Operation;
use crate::state::AppState;

/// Per-invocation context handed to every tool.
pub struct ToolContext {
    pub app: Arc<AppState>,
    pub session_id: String,
}

/// What a tool invocation produced.
#[derive(Debug)]
pub enum ToolOutcome {
    /// Success payload, already normalized for the client.
    Success(Value),
    /// Structured error travelling as an `isError` tool result.
    Error(Box<ErrorResponse>),
    /// The input failed schema validation; surfaces as an MCP protocol
    /// error, not a tool result.
    InvalidParams(String),
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        Self::Success(value)
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success(_))
    }
}

impl From<Box<ErrorResponse>> for ToolOutcome {
    fn from(error: Box<ErrorResponse>) -> Self {
        Self::Error(error)
    }
}

/// MCP behavior hints, computed from the tool's operation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Annotations {
    pub read_only: bool,
    pub destructive: bool,
    pub idempotent: bool,
    pub open_world: bool,
}

/// Static annotation table. Every tool talks to an external system, so
/// `open_world` is always set.
pub fn annotations_for(operation: Operation) -> Annotations {
    Annotations {
        read_only: operation.is_read(),
        destructive: operation == Operation::Unlink,
        idempotent: operation.is_read() || matches!(operation, Operation::Write | Operation::Unlink),
        open_world: true,
    }
}

/// The dynamic tool contract.
#[async_trait]
pub trait OdooTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    /// The operation class, driving visibility, annotations and the
    /// read/write rate budget split.
    fn operation(&self) -> Operation;

    fn annotations(&self) -> Annotations {
        annotations_for(self.operation())
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> ToolOutcome;
}

/// Typed-input tool with automatic schema derivation.
#[async_trait]
pub trait SchemaTool: Send + Sync {
    type Input: JsonSchema + DeserializeOwned + Send;
    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const OPERATION: Operation;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome;

    fn input_schema() -> Value {
        let schema = schemars::schema_for!(Self::Input);
        let mut value =
            serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key("properties") {
                obj.insert(
                    "properties".to_string(),
                    Value::Object(serde_json::Map::new()),
                );
            }
            obj.remove("$schema");
            obj.remove("title");
        }
        value
    }
}

#[async_trait]
impl<T: SchemaTool + 'static> OdooTool for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        T::DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        T::input_schema()
    }

    fn operation(&self) -> Operation {
        T::OPERATION
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> ToolOutcome {
        match serde_json::from_value::<T::Input>(input) {
            Ok(typed) => SchemaTool::handle(self, typed, context).await,
            Err(e) => ToolOutcome::InvalidParams(format!("invalid parameters: {}", e)),
        }
    }
}

/// Name-keyed registry of the tools visible to the current session mode.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn OdooTool>>,
    /// Registration order, for stable tool listings.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. Duplicate names are a fatal startup error.
    pub fn register(&mut self, tool: Arc<dyn OdooTool>) -> crate::Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(crate::Error::Toolset(format!(
                "duplicate tool name '{}'",
                name
            )));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OdooTool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn OdooTool>> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str);

    #[async_trait]
    impl OdooTool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "dummy"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        fn operation(&self) -> Operation {
            Operation::Read
        }
        async fn execute(&self, _input: Value, _context: &ToolContext) -> ToolOutcome {
            ToolOutcome::success(Value::Null)
        }
    }

    #[test]
    fn duplicate_tool_names_are_fatal() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy("odoo_records_read"))).unwrap();
        assert!(registry.register(Arc::new(Dummy("odoo_records_read"))).is_err());
    }

    #[test]
    fn registration_order_is_stable() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy("b"))).unwrap();
        registry.register(Arc::new(Dummy("a"))).unwrap();
        assert_eq!(registry.names(), vec!["b", "a"]);
    }

    #[test]
    fn annotation_table() {
        assert!(annotations_for(Operation::Read).read_only);
        assert!(!annotations_for(Operation::Read).destructive);
        assert!(annotations_for(Operation::Unlink).destructive);
        assert!(annotations_for(Operation::Write).idempotent);
        assert!(!annotations_for(Operation::Create).idempotent);
        assert!(annotations_for(Operation::Execute).open_world);
    }
}
