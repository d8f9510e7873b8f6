//! Command-line surface.
//!
//! Flags mirror the most commonly tuned options; anything not exposed here
//! is reachable through the config file or environment. CLI values win over
//! both.

use std::path::PathBuf;

use clap::Parser;

use crate::error::Result;

use super::{Settings, parse_list};

#[derive(Debug, Parser)]
#[command(
    name = "odoo-mcp",
    version,
    about = "MCP server bridging an Odoo backend to LLM clients"
)]
pub struct Cli {
    /// Path to a JSON config file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Backend base URL, e.g. https://erp.example.com
    #[arg(long)]
    pub url: Option<String>,

    /// Backend database name
    #[arg(long, short = 'd')]
    pub database: Option<String>,

    /// Backend login
    #[arg(long, short = 'u')]
    pub username: Option<String>,

    /// Backend password (prefer ODOO_MCP_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// Backend API key (prefer ODOO_MCP_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Wire protocol: auto, legacy-xml, legacy-json, modern-rest
    #[arg(long)]
    pub protocol: Option<String>,

    /// Safety mode: readonly, restricted, full
    #[arg(long, short = 'm')]
    pub mode: Option<String>,

    /// Models writes are allowed on (comma-separated, restricted mode)
    #[arg(long)]
    pub write_allow: Option<String>,

    /// Transport: stdio, sse, http
    #[arg(long, short = 't')]
    pub transport: Option<String>,

    /// Host for the HTTP/SSE transports
    #[arg(long)]
    pub host: Option<String>,

    /// Port for the HTTP/SSE transports
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Path to a statically generated registry snapshot
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Skip live introspection at startup
    #[arg(long)]
    pub no_introspect: bool,

    /// Enable the audit log, writing to the given file
    #[arg(long)]
    pub audit_file: Option<PathBuf>,

    /// Log level filter, e.g. info or odoo_mcp=debug
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Overlay the flags that were provided.
    pub fn apply(&self, settings: &mut Settings) -> Result<()> {
        if let Some(v) = &self.url {
            settings.connection.url = v.clone();
        }
        if let Some(v) = &self.database {
            settings.connection.database = v.clone();
        }
        if let Some(v) = &self.username {
            settings.connection.username = v.clone();
        }
        if let Some(v) = &self.password {
            settings.connection.password = Some(v.clone());
        }
        if let Some(v) = &self.api_key {
            settings.connection.api_key = Some(v.clone());
        }
        if let Some(v) = &self.protocol {
            settings.connection.protocol = v.clone();
        }
        if let Some(v) = &self.mode {
            settings.safety.mode = v.clone();
        }
        if let Some(v) = &self.write_allow {
            settings.safety.write_allow = parse_list(v);
        }
        if let Some(v) = &self.transport {
            settings.transport.kind = v.clone();
        }
        if let Some(v) = &self.host {
            settings.transport.host = v.clone();
        }
        if let Some(v) = self.port {
            settings.transport.port = v;
        }
        if let Some(v) = &self.registry {
            settings.registry.static_path = Some(v.clone());
        }
        if self.no_introspect {
            settings.registry.introspect_on_startup = false;
        }
        if let Some(v) = &self.audit_file {
            settings.audit.enabled = true;
            settings.audit.file = v.clone();
        }
        if let Some(v) = &self.log_level {
            settings.logging.level = v.clone();
        }
        Ok(())
    }
}
