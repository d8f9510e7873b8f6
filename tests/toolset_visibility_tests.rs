//! Tool visibility per safety mode: hidden tools are never registered.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use odoo_mcp::classifier::ErrorClassifier;
use odoo_mcp::connection::{ConnectionConfig, ConnectionManager};
use odoo_mcp::normalize::NormalizeOptions;
use odoo_mcp::registry::{BuildMode, ModelRegistry, Registry};
use odoo_mcp::safety::{
    AuditConfig, AuditWriter, RateLimitConfig, RateLimiter, SafetyGate, SafetyMode, SafetyPolicy,
};
use odoo_mcp::state::{AppState, SearchLimits};
use odoo_mcp::tools::{
    DeepSearchToolset, RecordsToolset, ToolRegistry, Toolset, ToolsetEnv, WizardToolset,
    register_toolsets,
};

async fn app_state(gate: SafetyGate) -> Arc<AppState> {
    let shutdown = CancellationToken::new();
    let connection = Arc::new(ConnectionManager::new(
        ConnectionConfig::new("http://localhost:1", "test", "test"),
        shutdown.clone(),
    ));
    let registry = Arc::new(ModelRegistry::new(
        Arc::clone(&connection),
        Registry::empty(BuildMode::Static),
    ));
    Arc::new(AppState {
        connection,
        registry,
        gate,
        limiter: RateLimiter::new(RateLimitConfig::default()),
        audit: AuditWriter::start(AuditConfig::default()).await.unwrap(),
        classifier: ErrorClassifier::new(),
        normalize: NormalizeOptions::default(),
        search_limits: SearchLimits::default(),
        toolset_report: std::sync::OnceLock::new(),
        shutdown,
    })
}

async fn registered_tools(mode: SafetyMode, write_allow: &[&str]) -> Vec<String> {
    let policy = SafetyPolicy::new(mode).with_user_lists(
        [],
        [],
        write_allow.iter().map(|s| s.to_string()),
        [],
        [],
    );
    let gate = SafetyGate::new(policy);
    let app = app_state(gate.clone()).await;

    let toolsets: Vec<Box<dyn Toolset>> = vec![
        Box::new(RecordsToolset),
        Box::new(DeepSearchToolset),
        Box::new(WizardToolset),
    ];
    let mut registry = ToolRegistry::new();
    let report =
        register_toolsets(toolsets, &ToolsetEnv::default(), &mut registry, &gate, &app).unwrap();
    assert!(report.skipped.is_empty());
    registry.names().into_iter().map(str::to_string).collect()
}

#[tokio::test]
async fn readonly_mode_hides_write_tools() {
    let tools = registered_tools(SafetyMode::Readonly, &[]).await;
    assert!(tools.contains(&"odoo_records_search_read".to_string()));
    assert!(tools.contains(&"odoo_records_fields_get".to_string()));
    assert!(tools.contains(&"odoo_search_deep".to_string()));
    assert!(tools.contains(&"odoo_wizard_list".to_string()));
    // Never registered, so calling them yields MCP method-not-found.
    assert!(!tools.contains(&"odoo_records_create".to_string()));
    assert!(!tools.contains(&"odoo_records_write".to_string()));
    assert!(!tools.contains(&"odoo_records_unlink".to_string()));
    assert!(!tools.contains(&"odoo_records_execute".to_string()));
    assert!(!tools.contains(&"odoo_wizard_run".to_string()));
}

#[tokio::test]
async fn restricted_mode_hides_only_unlink() {
    let tools = registered_tools(SafetyMode::Restricted, &["sale.order"]).await;
    assert!(tools.contains(&"odoo_records_create".to_string()));
    assert!(tools.contains(&"odoo_records_write".to_string()));
    assert!(tools.contains(&"odoo_records_execute".to_string()));
    assert!(tools.contains(&"odoo_wizard_run".to_string()));
    assert!(!tools.contains(&"odoo_records_unlink".to_string()));
}

#[tokio::test]
async fn full_mode_registers_everything() {
    let tools = registered_tools(SafetyMode::Full, &[]).await;
    for name in [
        "odoo_records_search_read",
        "odoo_records_read",
        "odoo_records_count",
        "odoo_records_fields_get",
        "odoo_records_name_get",
        "odoo_records_default_get",
        "odoo_records_list_models",
        "odoo_records_create",
        "odoo_records_write",
        "odoo_records_unlink",
        "odoo_records_execute",
        "odoo_search_deep",
        "odoo_wizard_list",
        "odoo_wizard_run",
    ] {
        assert!(tools.contains(&name.to_string()), "missing {name}");
    }
}
