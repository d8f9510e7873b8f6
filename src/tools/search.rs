//! Progressive deep search.
//!
//! One tool, five escalating strategies per target model: exact match,
//! standard ilike, extended ilike over deeper fields, expansion through
//! related partners, and finally chatter full-text. The search stops at the
//! first level that yields results unless the caller asks for an exhaustive
//! pass, and the response carries a transparent log of what was tried.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::normalize::normalize_records;
use crate::safety::{Operation, SafetyGate};
use crate::state::AppState;

use super::{SchemaTool, ToolContext, ToolOutcome, ToolRegistry, Toolset, ToolsetMetadata};

/// Per-model search behavior. Unlisted models fall back to plain `name`
/// ilike and nothing deeper.
#[derive(Clone, Copy, Debug)]
pub struct SearchProfile {
    pub name_field: &'static str,
    pub search_fields: &'static [&'static str],
    pub deep_search_fields: &'static [&'static str],
    /// Field pointing at `res.partner` for level-4 expansion.
    pub partner_field: Option<&'static str>,
}

const FALLBACK_PROFILE: SearchProfile = SearchProfile {
    name_field: "name",
    search_fields: &["name"],
    deep_search_fields: &[],
    partner_field: None,
};

/// The shipped catalog: partners, orders, invoices, leads, tickets,
/// products, tasks.
pub fn search_profile(model: &str) -> SearchProfile {
    match model {
        "res.partner" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "email", "phone", "vat"],
            deep_search_fields: &["street", "city", "website", "ref", "comment"],
            partner_field: None,
        },
        "sale.order" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "client_order_ref"],
            deep_search_fields: &["origin", "note"],
            partner_field: Some("partner_id"),
        },
        "purchase.order" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "partner_ref"],
            deep_search_fields: &["origin", "notes"],
            partner_field: Some("partner_id"),
        },
        "account.move" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "ref", "payment_reference"],
            deep_search_fields: &["invoice_origin", "narration"],
            partner_field: Some("partner_id"),
        },
        "crm.lead" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "contact_name", "email_from", "phone"],
            deep_search_fields: &["description", "street", "city", "website"],
            partner_field: Some("partner_id"),
        },
        "helpdesk.ticket" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "partner_email"],
            deep_search_fields: &["description"],
            partner_field: Some("partner_id"),
        },
        "product.template" | "product.product" => SearchProfile {
            name_field: "name",
            search_fields: &["name", "default_code", "barcode"],
            deep_search_fields: &["description", "description_sale"],
            partner_field: None,
        },
        "project.task" => SearchProfile {
            name_field: "name",
            search_fields: &["name"],
            deep_search_fields: &["description"],
            partner_field: Some("partner_id"),
        },
        _ => FALLBACK_PROFILE,
    }
}

/// Models searched when the caller does not name one.
const DEFAULT_TARGETS: &[&str] = &[
    "res.partner",
    "sale.order",
    "account.move",
    "crm.lead",
    "product.template",
    "project.task",
];

pub struct DeepSearchToolset;

impl Toolset for DeepSearchToolset {
    fn metadata(&self) -> ToolsetMetadata {
        ToolsetMetadata::new("search", "Progressive multi-strategy record search")
            .depends_on(&["records"])
            .with_tags(&["core", "search"])
    }

    fn register(
        &self,
        registry: &mut ToolRegistry,
        gate: &SafetyGate,
        _app: &Arc<AppState>,
    ) -> Result<Vec<String>> {
        if !gate.operation_visible(Operation::Search) {
            return Ok(Vec::new());
        }
        registry.register(Arc::new(DeepSearchTool))?;
        Ok(vec![DeepSearchTool::NAME.to_string()])
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeepSearchInput {
    /// Free-text query, e.g. a customer or order reference
    pub query: String,
    /// Target model; omit to search the default model set
    #[serde(default)]
    pub model: Option<String>,
    /// Run all five levels even after a hit
    #[serde(default)]
    pub exhaustive: bool,
    /// Records per level per model (bounded by the server's search limits)
    #[serde(default)]
    pub limit: Option<usize>,
}

pub struct DeepSearchTool;

#[async_trait]
impl SchemaTool for DeepSearchTool {
    type Input = DeepSearchInput;
    const NAME: &'static str = "odoo_search_deep";
    const DESCRIPTION: &'static str = "Progressively search a model (or the default set) with five escalating strategies: exact, ilike, extended ilike, related-partner expansion and chatter full-text.";
    const OPERATION: Operation = Operation::Search;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutcome {
        let app = &context.app;
        let query = input.query.trim().to_string();
        if query.is_empty() {
            return ToolOutcome::InvalidParams("query must not be empty".to_string());
        }

        let targets: Vec<String> = match &input.model {
            Some(model) => vec![model.clone()],
            None => DEFAULT_TARGETS.iter().map(|s| s.to_string()).collect(),
        };
        let limit = input
            .limit
            .unwrap_or(app.search_limits.default_limit)
            .clamp(1, app.search_limits.max_limit);
        let max_depth = app.search_limits.deep_search_depth.min(5);

        let mut log: Vec<Value> = Vec::new();
        let mut strategies: BTreeSet<&'static str> = BTreeSet::new();
        let mut depth_reached: u8 = 0;
        let mut results: Vec<Value> = Vec::new();
        let mut total: usize = 0;

        for model in &targets {
            if let Err(e) = app.gate.check(Operation::Search, model, None, None) {
                log.push(json!({
                    "model": model,
                    "level": 0,
                    "strategy": "skipped",
                    "reason": e.message,
                }));
                continue;
            }
            if !app.registry.model_exists(model).await {
                log.push(json!({
                    "model": model,
                    "level": 0,
                    "strategy": "skipped",
                    "reason": "model does not exist on this backend",
                }));
                continue;
            }

            let outcome = search_model(app, model, &query, limit, max_depth, input.exhaustive)
                .await;
            for step in outcome.log {
                log.push(step);
            }
            for strategy in outcome.strategies {
                strategies.insert(strategy);
            }
            depth_reached = depth_reached.max(outcome.depth);
            if !outcome.records.is_empty() {
                total += outcome.records.len();
                results.push(json!({
                    "model": model,
                    "count": outcome.records.len(),
                    "records": outcome.records,
                }));
            }
        }

        let suggestions = build_suggestions(&query, &targets, total);
        ToolOutcome::success(json!({
            "query": query,
            "total_results": total,
            "depth_reached": depth_reached,
            "strategies_used": strategies.into_iter().collect::<Vec<_>>(),
            "search_log": log,
            "results": results,
            "suggestions": suggestions,
        }))
    }
}

struct ModelSearchOutcome {
    records: Vec<Value>,
    log: Vec<Value>,
    strategies: Vec<&'static str>,
    depth: u8,
}

async fn search_model(
    app: &AppState,
    model: &str,
    query: &str,
    limit: usize,
    max_depth: u8,
    exhaustive: bool,
) -> ModelSearchOutcome {
    let profile = search_profile(model);
    let registry = app.registry.snapshot().await;
    let model_info = registry.get_model(model);

    let mut outcome = ModelSearchOutcome {
        records: Vec::new(),
        log: Vec::new(),
        strategies: Vec::new(),
        depth: 0,
    };

    for level in 1..=max_depth {
        let (strategy, domain) = match level {
            1 => (
                "exact",
                Some(json!([[profile.name_field, "=", query]])),
            ),
            2 => ("ilike", word_domain(query, profile.search_fields)),
            3 => {
                // Deep fields are only queried when the registry confirms
                // they exist on this backend.
                let known: Vec<&str> = profile
                    .deep_search_fields
                    .iter()
                    .copied()
                    .filter(|field| {
                        model_info.is_none_or(|info| info.fields.contains_key(*field))
                    })
                    .collect();
                ("extended_ilike", word_domain(query, &known))
            }
            4 => (
                "related_models",
                related_partner_domain(app, model, query, profile.partner_field).await,
            ),
            _ => ("chatter", None),
        };

        let found = if level == 5 {
            let searchable = model_info.is_none_or(|info| info.has_chatter);
            if searchable {
                chatter_search(app, model, query, limit).await
            } else {
                None
            }
        } else {
            match domain {
                Some(domain) => run_level(app, model, domain, limit).await,
                None => None,
            }
        };

        match found {
            None => {
                outcome.log.push(json!({
                    "model": model,
                    "level": level,
                    "strategy": strategy,
                    "results_found": 0,
                    "skipped": true,
                }));
            }
            Some(records) => {
                outcome.depth = outcome.depth.max(level);
                outcome.strategies.push(strategy);
                let count = records.len();
                outcome.log.push(json!({
                    "model": model,
                    "level": level,
                    "strategy": strategy,
                    "results_found": count,
                }));
                if count > 0 {
                    outcome.records = records;
                    if !exhaustive {
                        break;
                    }
                }
            }
        }
    }
    outcome
}

/// OR of every search field against every whitespace-separated word.
fn word_domain(query: &str, fields: &[&str]) -> Option<Value> {
    let words: Vec<&str> = query.split_whitespace().collect();
    if fields.is_empty() || words.is_empty() {
        return None;
    }
    let mut conditions: Vec<Value> = Vec::new();
    for field in fields {
        for word in &words {
            conditions.push(json!([field, "ilike", word]));
        }
    }
    Some(or_domain(conditions))
}

/// Polish-prefix OR over a condition list.
fn or_domain(conditions: Vec<Value>) -> Value {
    let mut domain: Vec<Value> = Vec::with_capacity(conditions.len() * 2);
    for _ in 1..conditions.len() {
        domain.push(json!("|"));
    }
    domain.extend(conditions);
    Value::Array(domain)
}

/// Level 4: find partners matching the query, expand company partners to
/// their child contacts and individuals to parent plus siblings, then filter
/// the primary model by the expanded partner set. Models without an explicit
/// profile are treated as company-side only.
async fn related_partner_domain(
    app: &AppState,
    model: &str,
    query: &str,
    partner_field: Option<&str>,
) -> Option<Value> {
    let partner_field = partner_field?;
    if model == "res.partner" {
        return None;
    }

    let mut kwargs: HashMap<String, Value> = HashMap::new();
    kwargs.insert("fields".to_string(), json!(["id", "is_company", "parent_id"]));
    kwargs.insert("limit".to_string(), json!(10));
    let seeds = app
        .backend_call(
            "res.partner",
            "search_read",
            vec![json!([["name", "ilike", query]])],
            kwargs,
            None,
        )
        .await
        .ok()?;
    let seeds = seeds.as_array()?.clone();
    if seeds.is_empty() {
        return None;
    }

    let mut expanded: BTreeSet<i64> = BTreeSet::new();
    let mut company_ids: Vec<i64> = Vec::new();
    let mut parent_ids: Vec<i64> = Vec::new();
    for seed in &seeds {
        let Some(id) = seed.get("id").and_then(Value::as_i64) else {
            continue;
        };
        expanded.insert(id);
        let is_company = seed.get("is_company").and_then(Value::as_bool).unwrap_or(false);
        if is_company {
            company_ids.push(id);
        } else if let Some(parent) = seed
            .get("parent_id")
            .and_then(Value::as_array)
            .and_then(|pair| pair.first())
            .and_then(Value::as_i64)
        {
            // Individual: include the parent company and the siblings.
            expanded.insert(parent);
            parent_ids.push(parent);
        }
    }

    let relatives = company_ids.iter().chain(parent_ids.iter()).copied().collect::<Vec<_>>();
    if !relatives.is_empty() {
        let mut kwargs: HashMap<String, Value> = HashMap::new();
        kwargs.insert("fields".to_string(), json!(["id"]));
        if let Ok(children) = app
            .backend_call(
                "res.partner",
                "search_read",
                vec![json!([["parent_id", "in", relatives]])],
                kwargs,
                None,
            )
            .await
        {
            if let Some(rows) = children.as_array() {
                for row in rows {
                    if let Some(id) = row.get("id").and_then(Value::as_i64) {
                        expanded.insert(id);
                    }
                }
            }
        }
    }

    let ids: Vec<i64> = expanded.into_iter().collect();
    Some(json!([[partner_field, "in", ids]]))
}

/// Level 5: full-text over chatter messages, then read the actual records.
async fn chatter_search(
    app: &AppState,
    model: &str,
    query: &str,
    limit: usize,
) -> Option<Vec<Value>> {
    let mut kwargs: HashMap<String, Value> = HashMap::new();
    kwargs.insert("fields".to_string(), json!(["res_id"]));
    kwargs.insert("limit".to_string(), json!(limit * 4));
    let messages = app
        .backend_call(
            "mail.message",
            "search_read",
            vec![json!([["model", "=", model], ["body", "ilike", query]])],
            kwargs,
            None,
        )
        .await
        .ok()?;

    let mut ids: Vec<i64> = Vec::new();
    let mut seen = BTreeSet::new();
    for message in messages.as_array()? {
        if let Some(id) = message.get("res_id").and_then(Value::as_i64) {
            if id > 0 && seen.insert(id) {
                ids.push(id);
            }
        }
    }
    ids.truncate(limit);
    if ids.is_empty() {
        return Some(Vec::new());
    }

    run_level(app, model, json!([["id", "in", ids]]), limit).await
}

async fn run_level(app: &AppState, model: &str, domain: Value, limit: usize) -> Option<Vec<Value>> {
    let mut kwargs: HashMap<String, Value> = HashMap::new();
    kwargs.insert("limit".to_string(), json!(limit));
    let result = app
        .backend_call(model, "search_read", vec![domain], kwargs, None)
        .await
        .ok()?;
    let registry = app.registry.snapshot().await;
    let normalized = normalize_records(result, registry.get_model(model), None, app.normalize);
    Some(normalized.as_array().cloned().unwrap_or_default())
}

/// Concrete next-step tool calls the caller can copy verbatim.
fn build_suggestions(query: &str, targets: &[String], total: usize) -> Vec<Value> {
    let mut suggestions = Vec::new();
    if total == 0 {
        suggestions.push(json!({
            "description": "Broaden the query or check which fields are searchable",
            "tool": "odoo_records_fields_get",
            "arguments": {"model": targets.first().cloned().unwrap_or_else(|| "res.partner".to_string())},
        }));
        suggestions.push(json!({
            "description": "Count loosely matching partners to gauge the data",
            "tool": "odoo_records_count",
            "arguments": {"model": "res.partner", "domain": [["name", "ilike", query]]},
        }));
    } else {
        for model in targets {
            suggestions.push(json!({
                "description": format!("Read full details of the {} matches", model),
                "tool": "odoo_records_search_read",
                "arguments": {"model": model, "domain": [["name", "ilike", query]], "limit": 10},
            }));
        }
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_catalog_and_fallback() {
        assert_eq!(search_profile("sale.order").partner_field, Some("partner_id"));
        assert!(search_profile("res.partner").partner_field.is_none());
        let fallback = search_profile("stock.lot");
        assert_eq!(fallback.search_fields, &["name"]);
        assert!(fallback.deep_search_fields.is_empty());
    }

    #[test]
    fn word_domain_is_or_of_fields_and_words() {
        let domain = word_domain("acme corp", &["name", "email"]).unwrap();
        let elements = domain.as_array().unwrap();
        // 4 conditions (2 fields x 2 words) need 3 leading "|".
        assert_eq!(elements.len(), 7);
        assert_eq!(elements[0], json!("|"));
        assert_eq!(elements[3], json!(["name", "ilike", "acme"]));
        // And the result is a valid domain.
        assert!(crate::domain::validate_domain(&domain).is_ok());
    }

    #[test]
    fn word_domain_empty_inputs() {
        assert!(word_domain("   ", &["name"]).is_none());
        assert!(word_domain("acme", &[]).is_none());
    }

    #[test]
    fn or_domain_single_condition_has_no_operator() {
        let domain = or_domain(vec![json!(["name", "=", "x"])]);
        assert_eq!(domain.as_array().unwrap().len(), 1);
    }

    #[test]
    fn suggestions_reference_real_tools() {
        let none = build_suggestions("acme", &["sale.order".to_string()], 0);
        assert!(none.iter().any(|s| s["tool"] == "odoo_records_fields_get"));
        let hits = build_suggestions("acme", &["sale.order".to_string()], 3);
        assert!(hits.iter().any(|s| s["tool"] == "odoo_records_search_read"));
    }
}
