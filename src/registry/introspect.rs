//! Live backend introspection.
//!
//! Builds a dynamic [`Registry`] by reading installed modules, filtering the
//! target models to those the current uid can read, and fetching field
//! metadata per model under a capped-concurrency semaphore. The whole pass
//! runs under a wall-clock budget; whatever was collected when the budget
//! expires is kept.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::rpc::RpcResult;

use super::{BuildMode, FieldInfo, ModelInfo, Registry};

/// Default introspection targets: the models the core toolsets and deep
/// search reason about. Replaceable wholesale via configuration.
pub const DEFAULT_INTROSPECT_MODELS: &[&str] = &[
    "res.partner",
    "res.users",
    "res.company",
    "res.currency",
    "product.product",
    "product.template",
    "product.category",
    "sale.order",
    "sale.order.line",
    "purchase.order",
    "purchase.order.line",
    "account.move",
    "account.move.line",
    "account.payment",
    "account.journal",
    "account.account",
    "stock.picking",
    "stock.move",
    "stock.quant",
    "stock.warehouse",
    "crm.lead",
    "crm.team",
    "crm.stage",
    "project.project",
    "project.task",
    "hr.employee",
    "hr.department",
    "helpdesk.ticket",
    "mail.message",
    "ir.module.module",
];

/// Attributes requested from `fields_get`; everything else is noise at this
/// layer.
const FIELD_ATTRIBUTES: &[&str] = &[
    "string",
    "type",
    "required",
    "readonly",
    "store",
    "help",
    "relation",
    "selection",
    "compute",
];

const MAX_IN_FLIGHT: usize = 5;

pub struct Introspector {
    connection: Arc<ConnectionManager>,
    targets: Vec<String>,
    budget: Duration,
}

impl Introspector {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            targets: DEFAULT_INTROSPECT_MODELS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            budget: Duration::from_secs(60),
        }
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        if !targets.is_empty() {
            self.targets = targets;
        }
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Names of installed modules, used here to prune targets and by the
    /// toolset pipeline for prerequisite checks.
    pub async fn installed_modules(&self) -> RpcResult<Vec<String>> {
        let rows = self
            .connection
            .execute(
                "ir.module.module",
                "search_read",
                vec![json!([["state", "=", "installed"]])],
                [("fields".to_string(), json!(["name"]))].into_iter().collect(),
                None,
            )
            .await?;
        Ok(rows
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Run the introspection pass and return a dynamic registry.
    pub async fn build(&self) -> Registry {
        let deadline = Instant::now() + self.budget;
        let collected: Arc<Mutex<BTreeMap<String, ModelInfo>>> =
            Arc::new(Mutex::new(BTreeMap::new()));

        // Base metadata for all targets in one call.
        let meta = self.fetch_model_meta().await.unwrap_or_default();

        let readable = self.filter_readable(&self.targets, deadline).await;
        debug!(
            targets = self.targets.len(),
            readable = readable.len(),
            "introspection targets resolved"
        );

        let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let mut tasks = JoinSet::new();
        for model in readable {
            let connection = Arc::clone(&self.connection);
            let semaphore = Arc::clone(&semaphore);
            let collected = Arc::clone(&collected);
            let meta = meta.get(&model).cloned();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                match fetch_fields(&connection, &model).await {
                    Ok(fields) => {
                        let info = assemble_model(&model, fields, meta);
                        collected.lock().await.insert(model, info);
                    }
                    Err(e) => debug!(model = %model, error = %e, "field introspection failed"),
                }
            });
        }

        // Drain tasks until done or the budget expires.
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    let pending = tasks.len();
                    tasks.abort_all();
                    warn!(
                        pending,
                        budget_secs = self.budget.as_secs(),
                        "introspection budget expired; keeping partial results"
                    );
                    break;
                }
            }
        }

        // Aborted tasks may still hold clones of the arc; take the map out
        // from under the lock instead of unwrapping.
        let models = std::mem::take(&mut *collected.lock().await);
        let mut registry = Registry::from_models(models, BuildMode::Dynamic);
        registry.version = self.connection.version().await;
        registry
    }

    /// `ir.model` rows for the targets: display name and transient flag.
    async fn fetch_model_meta(&self) -> RpcResult<BTreeMap<String, (String, bool)>> {
        let rows = self
            .connection
            .execute(
                "ir.model",
                "search_read",
                vec![json!([["model", "in", self.targets]])],
                [("fields".to_string(), json!(["model", "name", "transient"]))]
                    .into_iter()
                    .collect(),
                None,
            )
            .await?;
        Ok(rows
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let model = row.get("model")?.as_str()?.to_string();
                        let name = row
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or(&model)
                            .to_string();
                        let transient = row
                            .get("transient")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        Some((model, (name, transient)))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Keep only models the current uid can read. Denials are silent skips;
    /// probe errors count as unreadable.
    async fn filter_readable(&self, targets: &[String], deadline: Instant) -> Vec<String> {
        let mut readable = Vec::with_capacity(targets.len());
        for model in targets {
            if Instant::now() >= deadline {
                warn!("introspection budget expired during access filtering");
                break;
            }
            let allowed = self
                .connection
                .execute(
                    model,
                    "check_access_rights",
                    vec![json!("read")],
                    [("raise_exception".to_string(), json!(false))]
                        .into_iter()
                        .collect(),
                    None,
                )
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if allowed {
                readable.push(model.clone());
            } else {
                debug!(model = %model, "skipped: not readable by current uid");
            }
        }
        readable
    }
}

async fn fetch_fields(
    connection: &ConnectionManager,
    model: &str,
) -> RpcResult<BTreeMap<String, FieldInfo>> {
    let payload = connection
        .execute(
            model,
            "fields_get",
            vec![],
            [("attributes".to_string(), json!(FIELD_ATTRIBUTES))]
                .into_iter()
                .collect(),
            None,
        )
        .await?;

    let mut fields = BTreeMap::new();
    if let Some(map) = payload.as_object() {
        for (name, attrs) in map {
            if let Some(info) = FieldInfo::from_wire(name, attrs) {
                fields.insert(name.clone(), info);
            }
        }
    }
    Ok(fields)
}

fn assemble_model(
    model: &str,
    fields: BTreeMap<String, FieldInfo>,
    meta: Option<(String, bool)>,
) -> ModelInfo {
    let states = fields
        .get("state")
        .and_then(|f| f.selection.clone())
        .filter(|s| !s.is_empty());
    let has_chatter = fields.contains_key("message_ids");
    let (name, transient) = meta.unwrap_or_else(|| (model.to_string(), false));

    ModelInfo {
        model: model.to_string(),
        name,
        description: String::new(),
        transient,
        fields,
        methods: BTreeMap::new(),
        states,
        parent_models: Vec::new(),
        has_chatter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldType;

    #[test]
    fn default_targets_cover_the_core_models() {
        assert!(DEFAULT_INTROSPECT_MODELS.contains(&"res.partner"));
        assert!(DEFAULT_INTROSPECT_MODELS.contains(&"sale.order"));
        assert!(DEFAULT_INTROSPECT_MODELS.len() >= 25);
    }

    #[test]
    fn assemble_detects_states_and_chatter() {
        let mut fields = BTreeMap::new();
        let mut state = FieldInfo::from_wire("state", &json!({"type": "selection"})).unwrap();
        state.selection = Some(vec![("draft".into(), "Draft".into())]);
        fields.insert("state".to_string(), state);
        fields.insert(
            "message_ids".to_string(),
            FieldInfo::from_wire("message_ids", &json!({"type": "one2many"})).unwrap(),
        );

        let info = assemble_model("sale.order", fields, Some(("Sales Order".into(), false)));
        assert!(info.has_chatter);
        assert_eq!(info.states.as_ref().unwrap().len(), 1);
        assert_eq!(info.name, "Sales Order");
        assert_eq!(
            info.fields.get("message_ids").unwrap().field_type,
            FieldType::One2many
        );
    }
}
