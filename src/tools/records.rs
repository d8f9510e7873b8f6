//! Model-generic CRUD tools.
//!
//! The closed core tool surface: search/read/count/introspection tools plus
//! mode-gated create/write/unlink/execute. Every tool validates its caps,
//! consults the safety gate, normalizes the response and (for writes)
//! feeds the audit log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::classifier::{ErrorCategory, ErrorResponse};
use crate::domain::validate_domain;
use crate::error::Result;
use crate::normalize::normalize_records;
use crate::registry::Registry;
use crate::safety::{AuditEntry, Operation, SafetyGate};
use crate::state::AppState;

use super::{SchemaTool, ToolContext, ToolOutcome, ToolRegistry, Toolset, ToolsetMetadata};

const MAX_READ_IDS: usize = 100;
const MAX_NAME_GET_IDS: usize = 200;
const MAX_WRITE_IDS: usize = 100;
const MAX_UNLINK_IDS: usize = 50;

/// The core toolset; always first in the declaration list, no dependencies.
pub struct RecordsToolset;

impl Toolset for RecordsToolset {
    fn metadata(&self) -> ToolsetMetadata {
        ToolsetMetadata::new("records", "Model-generic CRUD and introspection tools")
            .with_tags(&["core"])
    }

    fn register(
        &self,
        registry: &mut ToolRegistry,
        gate: &SafetyGate,
        _app: &Arc<AppState>,
    ) -> Result<Vec<String>> {
        let mut published = Vec::new();
        let tools: Vec<(Operation, Arc<dyn super::OdooTool>)> = vec![
            (Operation::Search, Arc::new(SearchReadTool)),
            (Operation::Read, Arc::new(ReadTool)),
            (Operation::Count, Arc::new(CountTool)),
            (Operation::FieldsGet, Arc::new(FieldsGetTool)),
            (Operation::NameGet, Arc::new(NameGetTool)),
            (Operation::DefaultGet, Arc::new(DefaultGetTool)),
            (Operation::Read, Arc::new(ListModelsTool)),
            (Operation::Create, Arc::new(CreateTool)),
            (Operation::Write, Arc::new(WriteTool)),
            (Operation::Unlink, Arc::new(UnlinkTool)),
            (Operation::Execute, Arc::new(ExecuteTool)),
        ];
        for (operation, tool) in tools {
            // Hidden tools are never registered for the current mode.
            if !gate.operation_visible(operation) {
                continue;
            }
            published.push(tool.name().to_string());
            registry.register(tool)?;
        }
        Ok(published)
    }
}

/// Clamp a requested limit into `[1, max]`, with the configured default.
fn effective_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max)
}

fn record_audit(
    context: &ToolContext,
    tool: &str,
    model: &str,
    operation: &str,
    values: Option<Value>,
    result_id: Option<i64>,
    success: bool,
    started: Instant,
) {
    let app = &context.app;
    if !app.audit.should_log(operation) {
        return;
    }
    let uid = app.connection.uid_hint();
    app.audit.record(AuditEntry::now(
        context.session_id.clone(),
        tool,
        model,
        operation,
        values,
        result_id,
        success,
        started.elapsed().as_millis() as u64,
        uid,
    ));
}

// ---------------------------------------------------------------------------
// search_read

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchReadInput {
    /// Technical model name, e.g. "res.partner"
    pub model: String,
    /// Prefix-notation domain filter, e.g. [["name", "ilike", "acme"]]
    #[serde(default)]
    pub domain: Option<Value>,
    /// Fields to return; omit for all non-binary fields
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Maximum records to return (capped at 500, default 80)
    #[serde(default)]
    #[schemars(range(max = 500))]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    /// Sort specification, e.g. "date_order desc"
    #[serde(default)]
    pub order: Option<String>,
}

pub struct SearchReadTool;

#[async_trait]
impl SchemaTool for SearchReadTool {
    type Input = SearchReadInput;
    const NAME: &'static str = "odoo_records_search_read";
    const DESCRIPTION: &'static str =
        "Search records matching a domain filter and read the requested fields in one call.";
    const OPERATION: Operation = Operation::Search;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::Search, &input.model, None, None) {
            return e.into();
        }
        let domain = input.domain.unwrap_or_else(|| json!([]));
        if let Err(e) = validate_domain(&domain) {
            return e.into();
        }

        let limit = effective_limit(
            input.limit,
            app.search_limits.default_limit,
            app.search_limits.max_limit,
        );
        let fields = input
            .fields
            .as_ref()
            .map(|f| app.gate.filter_fields(f.iter().map(String::as_str)));

        let mut kwargs: HashMap<String, Value> = HashMap::new();
        kwargs.insert("limit".to_string(), json!(limit));
        if let Some(offset) = input.offset {
            kwargs.insert("offset".to_string(), json!(offset));
        }
        if let Some(order) = &input.order {
            kwargs.insert("order".to_string(), json!(order));
        }
        if let Some(fields) = &fields {
            kwargs.insert("fields".to_string(), json!(fields));
        }

        let result = match app
            .backend_call(&input.model, "search_read", vec![domain], kwargs, None)
            .await
        {
            Ok(value) => value,
            Err(e) => return e.into(),
        };

        let registry = app.registry.snapshot().await;
        let records = normalize_records(
            result,
            registry.get_model(&input.model),
            fields.as_deref(),
            app.normalize,
        );
        let returned = records.as_array().map(Vec::len).unwrap_or(0);
        ToolOutcome::success(json!({
            "model": input.model,
            "records": records,
            "count": returned,
            "has_more": returned == limit,
        }))
    }
}

// ---------------------------------------------------------------------------
// read

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadInput {
    pub model: String,
    /// Record ids to read (at most 100)
    #[schemars(length(max = 100))]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

pub struct ReadTool;

#[async_trait]
impl SchemaTool for ReadTool {
    type Input = ReadInput;
    const NAME: &'static str = "odoo_records_read";
    const DESCRIPTION: &'static str = "Read specific records by id. Missing ids are reported separately.";
    const OPERATION: Operation = Operation::Read;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        if input.ids.len() > MAX_READ_IDS {
            return ToolOutcome::InvalidParams(format!(
                "at most {} ids per read call",
                MAX_READ_IDS
            ));
        }
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::Read, &input.model, None, None) {
            return e.into();
        }
        let fields = input
            .fields
            .as_ref()
            .map(|f| app.gate.filter_fields(f.iter().map(String::as_str)));

        let mut kwargs: HashMap<String, Value> = HashMap::new();
        if let Some(fields) = &fields {
            kwargs.insert("fields".to_string(), json!(fields));
        }

        let result = match app
            .backend_call(&input.model, "read", vec![json!(input.ids)], kwargs, None)
            .await
        {
            Ok(value) => value,
            Err(e) => return e.into(),
        };

        let registry = app.registry.snapshot().await;
        let records = normalize_records(
            result,
            registry.get_model(&input.model),
            fields.as_deref(),
            app.normalize,
        );

        let found: Vec<i64> = records
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("id").and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default();
        let missing: Vec<i64> = input
            .ids
            .iter()
            .copied()
            .filter(|id| !found.contains(id))
            .collect();

        ToolOutcome::success(json!({
            "model": input.model,
            "records": records,
            "missing_ids": missing,
        }))
    }
}

// ---------------------------------------------------------------------------
// count

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CountInput {
    pub model: String,
    #[serde(default)]
    pub domain: Option<Value>,
}

pub struct CountTool;

#[async_trait]
impl SchemaTool for CountTool {
    type Input = CountInput;
    const NAME: &'static str = "odoo_records_count";
    const DESCRIPTION: &'static str = "Count records matching a domain filter.";
    const OPERATION: Operation = Operation::Count;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::Count, &input.model, None, None) {
            return e.into();
        }
        let domain = input.domain.unwrap_or_else(|| json!([]));
        if let Err(e) = validate_domain(&domain) {
            return e.into();
        }
        match app
            .backend_call(&input.model, "search_count", vec![domain], HashMap::new(), None)
            .await
        {
            Ok(count) => ToolOutcome::success(json!({"model": input.model, "count": count})),
            Err(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// fields_get

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FieldsGetInput {
    pub model: String,
    /// Restrict to these field names
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Attributes to project, e.g. ["string", "type", "required"]
    #[serde(default)]
    pub attributes: Option<Vec<String>>,
}

pub struct FieldsGetTool;

#[async_trait]
impl SchemaTool for FieldsGetTool {
    type Input = FieldsGetInput;
    const NAME: &'static str = "odoo_records_fields_get";
    const DESCRIPTION: &'static str =
        "Describe a model's fields: types, labels, required flags, relations and selections.";
    const OPERATION: Operation = Operation::FieldsGet;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::FieldsGet, &input.model, None, None) {
            return e.into();
        }

        let mut kwargs: HashMap<String, Value> = HashMap::new();
        if let Some(fields) = &input.fields {
            kwargs.insert("allfields".to_string(), json!(fields));
        }
        let attributes = input.attributes.unwrap_or_else(|| {
            ["string", "type", "required", "readonly", "relation", "selection", "help"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        });
        kwargs.insert("attributes".to_string(), json!(attributes));

        let result = match app
            .backend_call(&input.model, "fields_get", vec![], kwargs, None)
            .await
        {
            Ok(value) => value,
            Err(e) => return e.into(),
        };

        // Blocklisted fields never appear, even in metadata.
        let fields = match result {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(name, _)| !app.gate.policy().is_field_blocked(name))
                    .collect(),
            ),
            other => other,
        };
        ToolOutcome::success(json!({"model": input.model, "fields": fields}))
    }
}

// ---------------------------------------------------------------------------
// name_get

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NameGetInput {
    pub model: String,
    /// Record ids (at most 200)
    #[schemars(length(max = 200))]
    pub ids: Vec<i64>,
}

pub struct NameGetTool;

#[async_trait]
impl SchemaTool for NameGetTool {
    type Input = NameGetInput;
    const NAME: &'static str = "odoo_records_name_get";
    const DESCRIPTION: &'static str = "Resolve record ids to their display names.";
    const OPERATION: Operation = Operation::NameGet;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        if input.ids.len() > MAX_NAME_GET_IDS {
            return ToolOutcome::InvalidParams(format!(
                "at most {} ids per name_get call",
                MAX_NAME_GET_IDS
            ));
        }
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::NameGet, &input.model, None, None) {
            return e.into();
        }
        let result = match app
            .backend_call(
                &input.model,
                "name_get",
                vec![json!(input.ids)],
                HashMap::new(),
                None,
            )
            .await
        {
            Ok(value) => value,
            Err(e) => return e.into(),
        };

        let names: Vec<Value> = result
            .as_array()
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|pair| {
                        let pair = pair.as_array()?;
                        Some(json!({
                            "id": pair.first()?.as_i64()?,
                            "name": pair.get(1)?.as_str().unwrap_or_default(),
                        }))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ToolOutcome::success(json!({"model": input.model, "names": names}))
    }
}

// ---------------------------------------------------------------------------
// default_get

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DefaultGetInput {
    pub model: String,
    /// Field names to fetch defaults for
    pub fields: Vec<String>,
}

pub struct DefaultGetTool;

#[async_trait]
impl SchemaTool for DefaultGetTool {
    type Input = DefaultGetInput;
    const NAME: &'static str = "odoo_records_default_get";
    const DESCRIPTION: &'static str = "Fetch the default values a new record of this model would get.";
    const OPERATION: Operation = Operation::DefaultGet;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::DefaultGet, &input.model, None, None) {
            return e.into();
        }
        let fields = app.gate.filter_fields(input.fields.iter().map(String::as_str));
        match app
            .backend_call(
                &input.model,
                "default_get",
                vec![json!(fields)],
                HashMap::new(),
                None,
            )
            .await
        {
            Ok(defaults) => {
                ToolOutcome::success(json!({"model": input.model, "defaults": defaults}))
            }
            Err(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// list_models

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListModelsInput {
    /// Substring filter on the technical model name
    #[serde(default)]
    pub filter: Option<String>,
}

pub struct ListModelsTool;

#[async_trait]
impl SchemaTool for ListModelsTool {
    type Input = ListModelsInput;
    const NAME: &'static str = "odoo_records_list_models";
    const DESCRIPTION: &'static str =
        "List the models this server knows about, with writability under the current policy.";
    const OPERATION: Operation = Operation::Read;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        let registry = app.registry.snapshot().await;
        let models = list_visible_models(&registry, &app.gate, input.filter.as_deref());
        ToolOutcome::success(json!({"models": models, "count": models.len()}))
    }
}

fn list_visible_models(
    registry: &Registry,
    gate: &SafetyGate,
    filter: Option<&str>,
) -> Vec<Value> {
    registry
        .list_models(filter)
        .into_iter()
        .filter(|name| gate.policy().is_model_visible(name))
        .filter(|name| !gate.policy().is_user_denied(name))
        .map(|name| {
            let info = registry.get_model(name);
            json!({
                "model": name,
                "name": info.map(|m| m.name.as_str()).unwrap_or(name),
                "transient": info.map(|m| m.transient).unwrap_or(false),
                "writable": !gate.policy().is_model_write_blocked(name),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// create

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateInput {
    pub model: String,
    /// Field values for the new record
    pub values: Map<String, Value>,
}

pub struct CreateTool;

#[async_trait]
impl SchemaTool for CreateTool {
    type Input = CreateInput;
    const NAME: &'static str = "odoo_records_create";
    const DESCRIPTION: &'static str = "Create one record. Returns the new record id.";
    const OPERATION: Operation = Operation::Create;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        let field_names: Vec<String> = input.values.keys().cloned().collect();
        if let Err(e) = app
            .gate
            .check(Operation::Create, &input.model, Some(&field_names), None)
        {
            return e.into();
        }

        let started = Instant::now();
        let values = Value::Object(input.values);
        let result = app
            .backend_call(
                &input.model,
                "create",
                vec![values.clone()],
                HashMap::new(),
                None,
            )
            .await;

        let (success, result_id) = match &result {
            Ok(value) => (true, value.as_i64()),
            Err(_) => (false, None),
        };
        record_audit(
            context,
            Self::NAME,
            &input.model,
            "create",
            Some(values),
            result_id,
            success,
            started,
        );

        match result {
            Ok(id) => ToolOutcome::success(json!({"model": input.model, "id": id})),
            Err(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// write

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteInput {
    pub model: String,
    /// Record ids to update (at most 100)
    #[schemars(length(max = 100))]
    pub ids: Vec<i64>,
    /// Field values to write
    pub values: Map<String, Value>,
}

pub struct WriteTool;

#[async_trait]
impl SchemaTool for WriteTool {
    type Input = WriteInput;
    const NAME: &'static str = "odoo_records_write";
    const DESCRIPTION: &'static str = "Update fields on existing records.";
    const OPERATION: Operation = Operation::Write;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        if input.ids.len() > MAX_WRITE_IDS {
            return ToolOutcome::InvalidParams(format!(
                "at most {} ids per write call",
                MAX_WRITE_IDS
            ));
        }
        let app = &context.app;
        let field_names: Vec<String> = input.values.keys().cloned().collect();
        if let Err(e) = app
            .gate
            .check(Operation::Write, &input.model, Some(&field_names), None)
        {
            return e.into();
        }

        // Readonly fields are rejected up front with the offending names.
        let registry = app.registry.snapshot().await;
        let readonly: Vec<&String> = field_names
            .iter()
            .filter(|name| {
                registry
                    .get_field(&input.model, name)
                    .is_some_and(|f| f.readonly)
            })
            .collect();
        if !readonly.is_empty() {
            return ToolOutcome::Error(Box::new(
                ErrorResponse::new(
                    ErrorCategory::Validation,
                    "READONLY_FIELD",
                    format!("Fields {:?} are readonly on {}", readonly, input.model),
                    "Remove the readonly fields; they are computed by the backend.",
                )
                .with_details(json!({"model": input.model, "fields": readonly})),
            ));
        }

        let started = Instant::now();
        let values = Value::Object(input.values);
        let result = app
            .backend_call(
                &input.model,
                "write",
                vec![json!(input.ids), values.clone()],
                HashMap::new(),
                None,
            )
            .await;

        record_audit(
            context,
            Self::NAME,
            &input.model,
            "write",
            Some(values),
            input.ids.first().copied(),
            result.is_ok(),
            started,
        );

        match result {
            Ok(_) => ToolOutcome::success(json!({
                "model": input.model,
                "updated": input.ids,
            })),
            Err(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// unlink

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UnlinkInput {
    pub model: String,
    /// Record ids to delete (at most 50)
    #[schemars(length(max = 50))]
    pub ids: Vec<i64>,
}

pub struct UnlinkTool;

#[async_trait]
impl SchemaTool for UnlinkTool {
    type Input = UnlinkInput;
    const NAME: &'static str = "odoo_records_unlink";
    const DESCRIPTION: &'static str =
        "Permanently delete records. Only available in full mode; always audited.";
    const OPERATION: Operation = Operation::Unlink;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        if input.ids.len() > MAX_UNLINK_IDS {
            return ToolOutcome::InvalidParams(format!(
                "at most {} ids per unlink call",
                MAX_UNLINK_IDS
            ));
        }
        let app = &context.app;
        if let Err(e) = app.gate.check(Operation::Unlink, &input.model, None, None) {
            return e.into();
        }

        let started = Instant::now();
        let result = app
            .backend_call(
                &input.model,
                "unlink",
                vec![json!(input.ids)],
                HashMap::new(),
                None,
            )
            .await;

        record_audit(
            context,
            Self::NAME,
            &input.model,
            "unlink",
            Some(json!({"ids": input.ids})),
            input.ids.first().copied(),
            result.is_ok(),
            started,
        );

        match result {
            Ok(_) => ToolOutcome::success(json!({
                "model": input.model,
                "deleted": input.ids,
            })),
            Err(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// execute

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteInput {
    pub model: String,
    /// Public model method to call, e.g. "action_confirm"
    pub method: String,
    /// Positional arguments; record ids usually go first
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Option<Map<String, Value>>,
}

pub struct ExecuteTool;

#[async_trait]
impl SchemaTool for ExecuteTool {
    type Input = ExecuteInput;
    const NAME: &'static str = "odoo_records_execute";
    const DESCRIPTION: &'static str =
        "Call an arbitrary public method on a model. Use for workflow actions like action_confirm.";
    const OPERATION: Operation = Operation::Execute;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        if let Err(e) = app
            .gate
            .check(Operation::Execute, &input.model, None, Some(&input.method))
        {
            return e.into();
        }

        let registry = app.registry.snapshot().await;
        let kwargs: HashMap<String, Value> = if registry.method_accepts_kwargs(&input.method) {
            input
                .kwargs
                .unwrap_or_default()
                .into_iter()
                .collect()
        } else {
            // Methods on the no-kwargs list silently drop keyword arguments
            // instead of faulting on the backend.
            if input.kwargs.as_ref().is_some_and(|k| !k.is_empty()) {
                tracing::debug!(method = %input.method, "kwargs stripped for no-kwargs method");
            }
            HashMap::new()
        };

        let started = Instant::now();
        let args = input.args.unwrap_or_default();
        let result = app
            .backend_call(&input.model, &input.method, args.clone(), kwargs, None)
            .await;

        record_audit(
            context,
            Self::NAME,
            &input.model,
            "execute",
            Some(json!({"method": input.method, "args": args})),
            None,
            result.is_ok(),
            started,
        );

        match result {
            Ok(value) => {
                // Action dicts keep their tag so callers can hand them to the
                // wizard tool.
                let result_type = if crate::tools::wizard::is_wizard_action(&value) {
                    "action"
                } else {
                    "value"
                };
                ToolOutcome::success(json!({
                    "model": input.model,
                    "method": input.method,
                    "result_type": result_type,
                    "result": value,
                }))
            }
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_to_bounds() {
        assert_eq!(effective_limit(None, 80, 500), 80);
        assert_eq!(effective_limit(Some(1000), 80, 500), 500);
        assert_eq!(effective_limit(Some(0), 80, 500), 1);
        assert_eq!(effective_limit(Some(25), 80, 500), 25);
    }

    #[test]
    fn schemas_are_objects_with_properties() {
        for schema in [
            <SearchReadTool as SchemaTool>::input_schema(),
            <ReadTool as SchemaTool>::input_schema(),
            <CreateTool as SchemaTool>::input_schema(),
            <ExecuteTool as SchemaTool>::input_schema(),
        ] {
            assert!(schema.get("properties").is_some(), "{schema}");
        }
    }

    #[test]
    fn read_like_tools_have_read_annotations() {
        use crate::tools::OdooTool;
        let tool = SearchReadTool;
        assert!(tool.annotations().read_only);
        let unlink = UnlinkTool;
        assert!(unlink.annotations().destructive);
    }
}
