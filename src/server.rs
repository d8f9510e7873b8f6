//! MCP server host.
//!
//! Wires the dynamic tool registry, resource engine and prompt catalog into
//! an rmcp `ServerHandler` and serves it over stdio or streamable HTTP. One
//! handler instance exists per client session, which is what scopes rate
//! limits and subscriptions per client. Startup order: connect and probe,
//! build the registry, register toolsets, then serve.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestMethod, CallToolRequestParam, CallToolResult, Content, GetPromptRequestParam,
    GetPromptResult, Implementation, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
    Prompt, PromptArgument, PromptMessage, PromptMessageRole, ProtocolVersion, RawResource,
    RawResourceTemplate, ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents,
    ResourceTemplate, ServerCapabilities, SubscribeRequestParam, Tool, ToolAnnotations,
    UnsubscribeRequestParam,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, ServiceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::{ErrorCategory, ErrorClassifier, ErrorResponse};
use crate::config::Settings;
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{Error, Result};
use crate::normalize::NormalizeOptions;
use crate::prompts;
use crate::registry::{BuildMode, Introspector, ModelRegistry, Registry, merge};
use crate::resources::{
    ResourceEngine, SubscriptionManager, parse_uri, resource_templates, static_resources,
};
use crate::safety::{
    AuditConfig, AuditWriter, RateLimitConfig, RateLimiter, SafetyGate, SafetyPolicy,
};
use crate::state::{AppState, SearchLimits};
use crate::tools::{
    DeepSearchToolset, OdooTool, RecordsToolset, ToolContext, ToolOutcome, ToolRegistry, Toolset,
    ToolsetEnv, WizardToolset, register_toolsets,
};

/// Shared pieces produced by [`bootstrap`], consumed by [`serve`].
pub struct ServerParts {
    pub app: Arc<AppState>,
    pub tools: Arc<ToolRegistry>,
    pub subscription_poll: Duration,
}

/// Connect, probe, build the registry and register toolsets.
///
/// Every failure here is startup-fatal: unreachable backend, invalid policy,
/// duplicate tool names and dependency cycles all bubble up as errors the
/// binary turns into a non-zero exit.
pub async fn bootstrap(settings: &Settings) -> Result<ServerParts> {
    let shutdown = CancellationToken::new();

    // Safety policy first; a bad policy should fail before we touch the
    // network.
    let policy = SafetyPolicy::new(settings.safety_mode()?).with_user_lists(
        settings.safety.model_allow.iter().cloned(),
        settings.safety.model_deny.iter().cloned(),
        settings.safety.write_allow.iter().cloned(),
        settings.safety.field_deny.iter().cloned(),
        settings.safety.method_deny.iter().cloned(),
    );
    policy.validate().map_err(Error::Config)?;
    let gate = SafetyGate::new(policy);

    let mut connection_config = ConnectionConfig::new(
        settings.connection.url.clone(),
        settings.connection.database.clone(),
        settings.connection.username.clone(),
    );
    connection_config.password = settings.connection.password.clone().map(Into::into);
    connection_config.api_key = settings.connection.api_key.clone().map(Into::into);
    connection_config.protocol = settings.forced_protocol();
    connection_config.timeout = Duration::from_secs(settings.connection.timeout_secs);
    connection_config.tls = crate::rpc::TlsOptions {
        verify_ssl: settings.connection.verify_ssl,
        ca_pem: settings
            .connection
            .ca_cert
            .as_deref()
            .map(std::fs::read)
            .transpose()
            .map_err(|e| Error::Config(format!("cannot read ca-cert: {e}")))?,
    };
    connection_config.health_check_interval =
        Duration::from_secs(settings.health.check_interval_secs);
    connection_config.reconnect_max = settings.health.reconnect_max;
    connection_config.backoff_base = Duration::from_secs(settings.health.backoff_base_secs);
    connection_config.base_context = settings.base_context();

    let connection = Arc::new(ConnectionManager::new(connection_config, shutdown.clone()));
    connection
        .connect()
        .await
        .map_err(|e| Error::Server(format!("backend connection failed: {e}")))?;
    let version = connection.version().await;
    info!(
        version = version.as_ref().map(|v| v.full_string.as_str()).unwrap_or("unknown"),
        "connected to backend"
    );

    // Registry: static snapshot, live introspection, or both merged.
    let static_registry = settings
        .registry
        .static_path
        .as_deref()
        .map(Registry::load_static)
        .transpose()?;
    let introspector = Introspector::new(Arc::clone(&connection))
        .with_targets(settings.registry.introspect_models.clone())
        .with_budget(Duration::from_secs(settings.registry.introspect_budget_secs));
    let dynamic_registry = if settings.registry.introspect_on_startup {
        Some(introspector.build().await)
    } else {
        None
    };
    let registry = match (static_registry, dynamic_registry) {
        (Some(static_base), Some(dynamic)) => merge(static_base, dynamic),
        (Some(static_base), None) => static_base,
        (None, Some(dynamic)) => dynamic,
        (None, None) => {
            warn!("no static registry and introspection disabled; registry is empty");
            Registry::empty(BuildMode::Static)
        }
    };
    info!(
        models = registry.model_count,
        fields = registry.field_count,
        mode = ?registry.build_mode,
        "registry built"
    );
    let model_registry = Arc::new(ModelRegistry::new(Arc::clone(&connection), registry));

    let audit = AuditWriter::start(AuditConfig {
        enabled: settings.audit.enabled,
        file: settings.audit.file.clone(),
        log_reads: settings.audit.log_reads,
        log_writes: settings.audit.log_writes,
        log_deletes: settings.audit.log_deletes,
    })
    .await
    .map_err(|e| Error::Config(format!("cannot open audit log: {e}")))?;

    let app = Arc::new(AppState {
        connection: Arc::clone(&connection),
        registry: model_registry,
        gate: gate.clone(),
        limiter: RateLimiter::new(RateLimitConfig {
            enabled: settings.rate_limit.enabled,
            rpm: settings.rate_limit.rpm,
            rph: settings.rate_limit.rph,
            read_rpm: settings.rate_limit.read_rpm,
            write_rpm: settings.rate_limit.write_rpm,
            burst: settings.rate_limit.burst,
        }),
        audit,
        classifier: ErrorClassifier::new(),
        normalize: NormalizeOptions {
            strip_html: settings.display.strip_html,
            normalize_relational: settings.display.normalize_relational,
        },
        search_limits: SearchLimits {
            default_limit: settings.search.default_limit,
            max_limit: settings.search.max_limit,
            deep_search_depth: settings.search.deep_search_depth,
        },
        toolset_report: std::sync::OnceLock::new(),
        shutdown,
    });

    // Toolset registration: explicit declaration list, dependency order,
    // prerequisite gating.
    let installed_modules: HashSet<String> = match introspector.installed_modules().await {
        Ok(modules) => modules.into_iter().collect(),
        Err(e) => {
            warn!(error = %e, "could not list installed modules; module prerequisites will skip");
            HashSet::new()
        }
    };
    let env = ToolsetEnv {
        installed_modules,
        backend_major: version.map(|v| v.major).unwrap_or(0),
        enabled: settings.toolsets.enabled.iter().cloned().collect(),
        disabled: settings.toolsets.disabled.iter().cloned().collect(),
    };
    let toolsets: Vec<Box<dyn Toolset>> = vec![
        Box::new(RecordsToolset),
        Box::new(DeepSearchToolset),
        Box::new(WizardToolset),
    ];
    let mut tools = ToolRegistry::new();
    let report = register_toolsets(toolsets, &env, &mut tools, &gate, &app)?;
    tools.register(Arc::new(crate::tools::ListToolsetsTool))?;
    info!(
        registered = report.registered.len(),
        skipped = report.skipped.len(),
        tools = tools.len(),
        "toolsets registered"
    );
    let _ = app.toolset_report.set(report);

    Ok(ServerParts {
        app,
        tools: Arc::new(tools),
        subscription_poll: Duration::from_secs(settings.health.subscription_poll_secs),
    })
}

/// One MCP session's view of the server.
pub struct OdooMcpServer {
    app: Arc<AppState>,
    tools: Arc<ToolRegistry>,
    resources: ResourceEngine,
    subscriptions: Arc<SubscriptionManager>,
    session_id: String,
}

impl OdooMcpServer {
    pub fn new(app: Arc<AppState>, tools: Arc<ToolRegistry>, poll: Duration) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&app), poll));
        Self {
            resources: ResourceEngine::new(Arc::clone(&app)),
            subscriptions,
            session_id: uuid::Uuid::new_v4().to_string(),
            app,
            tools,
        }
    }

    fn tool_descriptor(&self, tool: &Arc<dyn OdooTool>) -> Tool {
        let schema = match tool.input_schema() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let hints = tool.annotations();
        Tool {
            name: tool.name().to_string().into(),
            title: None,
            description: Some(tool.description().to_string().into()),
            input_schema: Arc::new(schema),
            output_schema: None,
            annotations: Some(ToolAnnotations {
                title: None,
                read_only_hint: Some(hints.read_only),
                destructive_hint: Some(hints.destructive),
                idempotent_hint: Some(hints.idempotent),
                open_world_hint: Some(hints.open_world),
            }),
            icons: None,
            meta: None,
        }
    }
}

impl Drop for OdooMcpServer {
    fn drop(&mut self) {
        // Session over: its subscriptions and rate windows go with it.
        self.subscriptions.clear();
        self.app.limiter.forget(&self.session_id);
    }
}

fn error_result(response: &ErrorResponse) -> CallToolResult {
    let wire = response.to_client_json();
    let text = serde_json::to_string(&wire)
        .unwrap_or_else(|_| format!("{{\"error\": true, \"message\": \"{}\"}}", response.message));
    CallToolResult::error(vec![Content::text(text)])
}

fn resource_error(e: Box<ErrorResponse>, uri: &str) -> McpError {
    match e.category {
        ErrorCategory::NotFound => {
            McpError::resource_not_found(e.message.clone(), Some(json!({"uri": uri})))
        }
        ErrorCategory::Validation => McpError::invalid_params(e.message.clone(), None),
        _ => McpError::internal_error(e.message.clone(), Some(e.to_client_json())),
    }
}

impl ServerHandler for OdooMcpServer {
    fn get_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_prompts()
                .enable_prompts_list_changed()
                .enable_resources()
                .enable_resources_subscribe()
                .enable_resources_list_changed()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Bridge to an Odoo backend. Start with odoo_records_list_models and \
                 odoo://system/info; search with odoo_search_deep; writes are subject \
                 to the configured safety mode."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        let tools: Vec<Tool> = self.tools.iter().map(|t| self.tool_descriptor(t)).collect();
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        // Hidden tools are unregistered, so this is the scenario where a
        // client calls one by name anyway: method not found.
        let Some(tool) = self.tools.get(request.name.as_ref()) else {
            return Err(McpError::method_not_found::<CallToolRequestMethod>());
        };

        let is_write = !tool.operation().is_read();
        if let Err(limited) = self.app.limiter.check(&self.session_id, is_write) {
            return Ok(error_result(&limited));
        }

        let input = match request.arguments {
            Some(map) => serde_json::Value::Object(map),
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        let context = ToolContext {
            app: Arc::clone(&self.app),
            session_id: self.session_id.clone(),
        };

        match tool.execute(input, &context).await {
            ToolOutcome::Success(value) => {
                let text = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            ToolOutcome::Error(response) => Ok(error_result(&response)),
            ToolOutcome::InvalidParams(message) => Err(McpError::invalid_params(message, None)),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListResourcesResult, McpError> {
        let resources: Vec<Resource> = static_resources()
            .into_iter()
            .map(|(uri, name, description)| {
                let mut raw = RawResource::new(uri, name.to_string());
                raw.description = Some(description.to_string());
                raw.mime_type = Some("application/json".to_string());
                Resource {
                    raw,
                    annotations: None,
                }
            })
            .collect();
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListResourceTemplatesResult, McpError> {
        let templates: Vec<ResourceTemplate> = resource_templates()
            .into_iter()
            .map(|(template, name, description)| ResourceTemplate {
                raw: RawResourceTemplate {
                    uri_template: template.to_string(),
                    name: name.to_string(),
                    title: None,
                    description: Some(description.to_string()),
                    mime_type: Some("application/json".to_string()),
                },
                annotations: None,
            })
            .collect();
        Ok(ListResourceTemplatesResult::with_all_items(templates))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ReadResourceResult, McpError> {
        let value = self
            .resources
            .read(&request.uri)
            .await
            .map_err(|e| resource_error(e, &request.uri))?;
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(text, request.uri)],
        })
    }

    async fn subscribe(
        &self,
        request: SubscribeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<(), McpError> {
        let parsed = parse_uri(&request.uri).map_err(|e| resource_error(e, &request.uri))?;
        self.subscriptions
            .subscribe(&request.uri, parsed, context.peer.clone())
            .map_err(|e| McpError::invalid_params(e.message.clone(), Some(e.to_client_json())))
    }

    async fn unsubscribe(
        &self,
        request: UnsubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<(), McpError> {
        self.subscriptions.unsubscribe(&request.uri);
        Ok(())
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListPromptsResult, McpError> {
        let prompts: Vec<Prompt> = prompts::catalog()
            .iter()
            .map(|p| {
                let arguments: Vec<PromptArgument> = p
                    .arguments
                    .iter()
                    .map(|(name, description, required)| PromptArgument {
                        name: name.to_string(),
                        title: None,
                        description: Some(description.to_string()),
                        required: Some(*required),
                    })
                    .collect();
                Prompt::new(p.name, Some(p.description), Some(arguments))
            })
            .collect();
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<GetPromptResult, McpError> {
        let Some(prompt) = prompts::get(&request.name) else {
            return Err(McpError::invalid_params(
                format!("unknown prompt '{}'", request.name),
                None,
            ));
        };
        let args: std::collections::HashMap<String, String> = request
            .arguments
            .as_ref()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(GetPromptResult {
            description: Some(prompt.description.to_string()),
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::User,
                prompt.render(&args),
            )],
        })
    }
}

/// Serve over the configured transport until shutdown.
pub async fn serve(settings: &Settings, parts: ServerParts) -> Result<()> {
    match settings.transport.kind.as_str() {
        "stdio" => serve_stdio(parts).await,
        // SSE clients are served through the streamable HTTP endpoint.
        "http" | "sse" => serve_http(settings, parts).await,
        other => Err(Error::Config(format!("unknown transport kind '{}'", other))),
    }
}

async fn serve_stdio(parts: ServerParts) -> Result<()> {
    let app = Arc::clone(&parts.app);
    let handler = OdooMcpServer::new(parts.app, parts.tools, parts.subscription_poll);

    info!("serving MCP over stdio");
    let service = handler
        .serve(rmcp::transport::stdio())
        .await
        .map_err(|e| Error::Server(format!("stdio transport failed: {e}")))?;

    tokio::select! {
        outcome = service.waiting() => {
            if let Err(e) = outcome {
                error!(error = %e, "stdio session ended with error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    graceful_shutdown(&app).await;
    Ok(())
}

async fn serve_http(settings: &Settings, parts: ServerParts) -> Result<()> {
    use rmcp::transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    };

    let app = Arc::clone(&parts.app);
    let tools = Arc::clone(&parts.tools);
    let poll = parts.subscription_poll;
    let factory_app = Arc::clone(&app);
    let service = StreamableHttpService::new(
        move || {
            Ok(OdooMcpServer::new(
                Arc::clone(&factory_app),
                Arc::clone(&tools),
                poll,
            ))
        },
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let path = if settings.transport.path.is_empty() {
        "/mcp".to_string()
    } else {
        settings.transport.path.clone()
    };
    let router = axum::Router::new().nest_service(&path, service);
    let address = format!("{}:{}", settings.transport.host, settings.transport.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| Error::Server(format!("cannot bind {address}: {e}")))?;
    info!(%address, %path, "serving MCP over streamable HTTP");

    let shutdown = app.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .map_err(|e| Error::Server(format!("http server failed: {e}")))?;

    graceful_shutdown(&app).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Cancel pending work, drain the audit log (bounded), then close the
/// adapter. The transport is already down when this runs; the process exits
/// 0 right after.
async fn graceful_shutdown(app: &Arc<AppState>) {
    app.shutdown.cancel();
    let drain = async {
        app.audit.flush().await;
        app.connection.close().await;
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("graceful shutdown timed out after 30s");
    }
    info!("shutdown complete");
}
