//! Wizard detection and execution.
//!
//! A backend result is a wizard when it is an action dict with
//! `type='ir.actions.act_window'` and `target='new'`. Execution drives the
//! transient-record protocol: build the active-record context, fetch
//! defaults, overlay caller values, create the transient, invoke the action
//! method and interpret the returned action. Chains recurse with a hard
//! depth cap so a cyclic wizard can never hang the server. Unknown wizards
//! come back as a structured description, never a silent drop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::classifier::{ErrorCategory, ErrorResponse};
use crate::error::Result;
use crate::rpc::Context;
use crate::safety::{Operation, SafetyGate};
use crate::state::AppState;

use super::{SchemaTool, ToolContext, ToolOutcome, ToolRegistry, Toolset, ToolsetMetadata};

/// Maximum chained-wizard depth before aborting with a structured error.
const MAX_CHAIN_DEPTH: u8 = 3;

/// True for action dicts that open a transient form in a dialog.
pub(crate) fn is_wizard_action(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("ir.actions.act_window")
        && value.get("target").and_then(Value::as_str) == Some("new")
}

#[derive(Clone, Debug, Serialize)]
pub struct WizardField {
    pub name: &'static str,
    pub field_type: &'static str,
    pub required: bool,
    pub description: &'static str,
}

/// Catalog entry for a wizard the server knows how to drive end to end.
#[derive(Clone, Debug, Serialize)]
pub struct KnownWizard {
    /// The transient model.
    pub model: &'static str,
    pub description: &'static str,
    /// The model the wizard acts on.
    pub source_model: &'static str,
    pub action_method: &'static str,
    /// Alternate completion methods, keyed by caller flags.
    pub alternative_actions: &'static [&'static str],
    pub fields: &'static [WizardField],
    pub context_keys: &'static [&'static str],
    pub min_backend_major: Option<u32>,
    pub max_backend_major: Option<u32>,
}

/// The shipped wizard catalog.
pub fn known_wizards() -> &'static [KnownWizard] {
    &[
        KnownWizard {
            model: "account.payment.register",
            description: "Register a payment against posted invoices or bills",
            source_model: "account.move",
            action_method: "action_create_payments",
            alternative_actions: &[],
            fields: &[
                WizardField {
                    name: "amount",
                    field_type: "monetary",
                    required: false,
                    description: "Payment amount; defaults to the residual",
                },
                WizardField {
                    name: "payment_date",
                    field_type: "date",
                    required: false,
                    description: "Defaults to today",
                },
                WizardField {
                    name: "journal_id",
                    field_type: "many2one",
                    required: false,
                    description: "Bank or cash journal",
                },
            ],
            context_keys: &["active_model", "active_ids"],
            min_backend_major: Some(14),
            max_backend_major: None,
        },
        KnownWizard {
            model: "stock.backorder.confirmation",
            description: "Confirm a partial transfer, creating or cancelling the backorder",
            source_model: "stock.picking",
            action_method: "process",
            alternative_actions: &["process_cancel_backorder"],
            fields: &[],
            context_keys: &["active_model", "active_ids", "button_validate_picking_ids"],
            min_backend_major: Some(14),
            max_backend_major: None,
        },
        KnownWizard {
            model: "sale.advance.payment.inv",
            description: "Create invoices from confirmed sales orders",
            source_model: "sale.order",
            action_method: "create_invoices",
            alternative_actions: &[],
            fields: &[WizardField {
                name: "advance_payment_method",
                field_type: "selection",
                required: false,
                description: "'delivered' for regular invoicing, 'percentage' or 'fixed' for down payments",
            }],
            context_keys: &["active_model", "active_ids"],
            min_backend_major: Some(14),
            max_backend_major: None,
        },
        KnownWizard {
            model: "account.move.reversal",
            description: "Reverse posted journal entries (credit notes)",
            source_model: "account.move",
            action_method: "reverse_moves",
            alternative_actions: &[],
            fields: &[
                WizardField {
                    name: "reason",
                    field_type: "char",
                    required: false,
                    description: "Shown on the reversal entry",
                },
                WizardField {
                    name: "date",
                    field_type: "date",
                    required: false,
                    description: "Reversal date",
                },
            ],
            context_keys: &["active_model", "active_ids"],
            min_backend_major: Some(14),
            max_backend_major: None,
        },
    ]
}

pub fn find_known_wizard(model: &str) -> Option<&'static KnownWizard> {
    known_wizards().iter().find(|w| w.model == model)
}

pub struct WizardToolset;

impl Toolset for WizardToolset {
    fn metadata(&self) -> ToolsetMetadata {
        ToolsetMetadata::new("wizard", "Transient-record wizard execution")
            .depends_on(&["records"])
            .with_tags(&["core", "workflow"])
    }

    fn register(
        &self,
        registry: &mut ToolRegistry,
        gate: &SafetyGate,
        _app: &Arc<AppState>,
    ) -> Result<Vec<String>> {
        let mut published = Vec::new();
        registry.register(Arc::new(ListWizardsTool))?;
        published.push(ListWizardsTool::NAME.to_string());
        // Running a wizard writes; readonly mode only sees the catalog.
        if gate.operation_visible(Operation::Execute) {
            registry.register(Arc::new(RunWizardTool))?;
            published.push(RunWizardTool::NAME.to_string());
        }
        Ok(published)
    }
}

// ---------------------------------------------------------------------------
// list

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListWizardsInput {
    /// Filter by source model, e.g. "account.move"
    #[serde(default)]
    pub source_model: Option<String>,
}

pub struct ListWizardsTool;

#[async_trait]
impl SchemaTool for ListWizardsTool {
    type Input = ListWizardsInput;
    const NAME: &'static str = "odoo_wizard_list";
    const DESCRIPTION: &'static str =
        "List the wizards this server can drive end to end, with their fields and source models.";
    const OPERATION: Operation = Operation::Read;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let major = context
            .app
            .connection
            .version()
            .await
            .map(|v| v.major)
            .unwrap_or(0);
        let wizards: Vec<Value> = known_wizards()
            .iter()
            .filter(|w| {
                input
                    .source_model
                    .as_deref()
                    .is_none_or(|m| m == w.source_model)
            })
            .filter(|w| w.min_backend_major.is_none_or(|min| major >= min))
            .filter(|w| w.max_backend_major.is_none_or(|max| major <= max))
            .map(|w| json!(w))
            .collect();
        ToolOutcome::success(json!({"wizards": wizards, "count": wizards.len()}))
    }
}

// ---------------------------------------------------------------------------
// run

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunWizardInput {
    /// The transient wizard model, e.g. "account.payment.register"
    pub wizard_model: String,
    /// The records the wizard acts on
    pub ids: Vec<i64>,
    /// The source model; defaults to the catalog entry's source
    #[serde(default)]
    pub model: Option<String>,
    /// Values overlaid on the wizard's defaults
    #[serde(default)]
    pub values: Map<String, Value>,
    /// Override the action method
    #[serde(default)]
    pub action_method: Option<String>,
    /// Backorder confirmation only: true processes and keeps the backorder
    /// (default), false cancels it
    #[serde(default)]
    pub process_backorder: Option<bool>,
}

pub struct RunWizardTool;

#[async_trait]
impl SchemaTool for RunWizardTool {
    type Input = RunWizardInput;
    const NAME: &'static str = "odoo_wizard_run";
    const DESCRIPTION: &'static str = "Execute a backend wizard: fetch defaults, create the transient record and run its action method, following chained wizards up to depth 3.";
    const OPERATION: Operation = Operation::Execute;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        if input.ids.is_empty() {
            return ToolOutcome::InvalidParams("ids must not be empty".to_string());
        }

        let known = find_known_wizard(&input.wizard_model);
        let source_model = match input.model.as_deref().or(known.map(|w| w.source_model)) {
            Some(model) => model.to_string(),
            None => {
                // Unknown wizard with no source model: describe it instead of
                // guessing.
                return describe_unknown_wizard(app, &input.wizard_model, &input.ids).await;
            }
        };
        let action_method = resolve_action_method(&input, known);

        if let Err(e) = app.gate.check(
            Operation::Execute,
            &source_model,
            None,
            Some(&action_method),
        ) {
            return e.into();
        }

        if known.is_none() && !app.registry.model_exists(&input.wizard_model).await {
            return ToolOutcome::Error(Box::new(
                ErrorResponse::new(
                    ErrorCategory::Wizard,
                    "UNKNOWN_WIZARD",
                    format!("No wizard model '{}' on this backend", input.wizard_model),
                    "Use odoo_wizard_list for the supported catalog, or odoo_records_list_models to find the transient model.",
                )
                .with_details(json!({"wizard_model": input.wizard_model})),
            ));
        }

        match execute_wizard(
            app,
            &input.wizard_model,
            &source_model,
            &input.ids,
            Value::Object(input.values),
            &action_method,
            0,
        )
        .await
        {
            Ok(outcome) => ToolOutcome::success(outcome),
            Err(e) => ToolOutcome::Error(e),
        }
    }
}

/// The backorder wizard has two completion methods selected by a caller
/// flag; everywhere else the catalog (or the caller) names the method.
fn resolve_action_method(input: &RunWizardInput, known: Option<&KnownWizard>) -> String {
    if let Some(method) = &input.action_method {
        return method.clone();
    }
    if let Some(known) = known {
        if known.model == "stock.backorder.confirmation"
            && input.process_backorder == Some(false)
        {
            return "process_cancel_backorder".to_string();
        }
        return known.action_method.to_string();
    }
    // Unknown wizards most commonly expose a bare `process`.
    "process".to_string()
}

/// Drive one wizard invocation, recursing on chained wizards.
async fn execute_wizard(
    app: &AppState,
    wizard_model: &str,
    source_model: &str,
    active_ids: &[i64],
    values: Value,
    action_method: &str,
    depth: u8,
) -> std::result::Result<Value, Box<ErrorResponse>> {
    if depth >= MAX_CHAIN_DEPTH {
        return Err(Box::new(
            ErrorResponse::new(
                ErrorCategory::Wizard,
                "WIZARD_CHAIN_TOO_DEEP",
                format!("Wizard chain exceeded {} steps", MAX_CHAIN_DEPTH),
                "The wizard chain appears cyclic; drive the remaining steps manually with odoo_records_execute.",
            )
            .with_details(json!({"wizard_model": wizard_model, "depth": depth})),
        ));
    }

    let mut context = Context::new();
    context.insert("active_model".to_string(), json!(source_model));
    context.insert("active_id".to_string(), json!(active_ids[0]));
    context.insert("active_ids".to_string(), json!(active_ids));

    // Defaults first, caller values on top.
    let field_names: Vec<String> = match app
        .backend_call(
            wizard_model,
            "fields_get",
            vec![],
            [("attributes".to_string(), json!(["type"]))].into_iter().collect(),
            Some(&context),
        )
        .await
    {
        Ok(fields) => fields
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default(),
        Err(e) => return Err(e),
    };
    let defaults = app
        .backend_call(
            wizard_model,
            "default_get",
            vec![json!(field_names)],
            HashMap::new(),
            Some(&context),
        )
        .await?;

    let mut record = defaults.as_object().cloned().unwrap_or_default();
    // Defaults may reference fields the create call cannot accept.
    record.retain(|_, value| !value.is_null());
    if let Some(overlay) = values.as_object() {
        for (key, value) in overlay {
            record.insert(key.clone(), value.clone());
        }
    }

    let wizard_id = app
        .backend_call(
            wizard_model,
            "create",
            vec![Value::Object(record)],
            HashMap::new(),
            Some(&context),
        )
        .await?;
    let wizard_id = wizard_id.as_i64().unwrap_or_default();

    let action = app
        .backend_call(
            wizard_model,
            action_method,
            vec![json!([wizard_id])],
            HashMap::new(),
            Some(&context),
        )
        .await?;

    interpret_action(app, source_model, active_ids, action, depth).await
}

/// Map the action method's return value onto the protocol outcomes.
async fn interpret_action(
    app: &AppState,
    source_model: &str,
    active_ids: &[i64],
    action: Value,
    depth: u8,
) -> std::result::Result<Value, Box<ErrorResponse>> {
    let done = json!({"status": "complete", "depth": depth});
    match &action {
        Value::Null | Value::Bool(_) => Ok(done),
        Value::Object(map) => {
            match map.get("type").and_then(Value::as_str) {
                Some("ir.actions.act_window_close") | None => Ok(done),
                Some("ir.actions.report") => Ok(json!({
                    "status": "report",
                    "depth": depth,
                    "report": {
                        "name": map.get("report_name"),
                        "type": map.get("report_type"),
                    },
                })),
                Some("ir.actions.act_url") => Ok(json!({
                    "status": "url",
                    "depth": depth,
                    "url": map.get("url"),
                })),
                Some("ir.actions.act_window") if is_wizard_action(&action) => {
                    // Chained wizard: the next transient model comes from the
                    // action itself.
                    let next_model = map
                        .get("res_model")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if next_model.is_empty() {
                        return Ok(json!({
                            "status": "action",
                            "depth": depth,
                            "action": action,
                        }));
                    }
                    let next_method = find_known_wizard(&next_model)
                        .map(|w| w.action_method.to_string())
                        .unwrap_or_else(|| "process".to_string());
                    let chained = Box::pin(execute_wizard(
                        app,
                        &next_model,
                        source_model,
                        active_ids,
                        json!({}),
                        &next_method,
                        depth + 1,
                    ))
                    .await?;
                    Ok(json!({
                        "status": "chained",
                        "depth": depth,
                        "next_wizard": next_model,
                        "result": chained,
                    }))
                }
                Some(_) => Ok(json!({
                    "status": "action",
                    "depth": depth,
                    "action": action,
                })),
            }
        }
        other => Ok(json!({
            "status": "complete",
            "depth": depth,
            "result": other,
        })),
    }
}

/// Structured description for wizards outside the catalog: the model, its
/// introspected fields, context hints and how to finish the job with the
/// generic tools.
async fn describe_unknown_wizard(app: &AppState, wizard_model: &str, ids: &[i64]) -> ToolOutcome {
    let fields = app
        .backend_call(
            wizard_model,
            "fields_get",
            vec![],
            [("attributes".to_string(), json!(["string", "type", "required"]))]
                .into_iter()
                .collect(),
            None,
        )
        .await
        .unwrap_or_else(|_| json!({}));

    ToolOutcome::success(json!({
        "status": "unknown_wizard",
        "wizard_model": wizard_model,
        "fields": fields,
        "context_hints": ["active_model", "active_id", "active_ids"],
        "instructions": format!(
            "This wizard is not in the catalog. Drive it manually: call \
             odoo_records_default_get on '{}', create the transient record with \
             odoo_records_create, then invoke its action method with \
             odoo_records_execute passing args [[wizard_id]] and the ids {:?} \
             as active_ids in the values.",
            wizard_model, ids
        ),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wizard_detection_requires_new_target() {
        assert!(is_wizard_action(&json!({
            "type": "ir.actions.act_window",
            "target": "new",
            "res_model": "account.payment.register",
        })));
        assert!(!is_wizard_action(&json!({
            "type": "ir.actions.act_window",
            "target": "current",
        })));
        assert!(!is_wizard_action(&json!({"type": "ir.actions.act_window_close"})));
        assert!(!is_wizard_action(&json!(true)));
    }

    #[test]
    fn catalog_covers_payment_and_backorder() {
        assert!(find_known_wizard("account.payment.register").is_some());
        let backorder = find_known_wizard("stock.backorder.confirmation").unwrap();
        assert_eq!(backorder.action_method, "process");
        assert!(backorder
            .alternative_actions
            .contains(&"process_cancel_backorder"));
    }

    #[test]
    fn backorder_flag_selects_method() {
        let base = RunWizardInput {
            wizard_model: "stock.backorder.confirmation".to_string(),
            ids: vec![1],
            model: None,
            values: Map::new(),
            action_method: None,
            process_backorder: None,
        };
        let known = find_known_wizard("stock.backorder.confirmation");
        assert_eq!(resolve_action_method(&base, known), "process");

        let cancel = RunWizardInput {
            process_backorder: Some(false),
            ..base
        };
        assert_eq!(resolve_action_method(&cancel, known), "process_cancel_backorder");
    }

    #[test]
    fn explicit_action_method_wins() {
        let input = RunWizardInput {
            wizard_model: "account.payment.register".to_string(),
            ids: vec![42],
            model: None,
            values: Map::new(),
            action_method: Some("action_create_payments".to_string()),
            process_backorder: None,
        };
        assert_eq!(
            resolve_action_method(&input, find_known_wizard("account.payment.register")),
            "action_create_payments"
        );
    }
}
