//! # odoo-mcp
//!
//! MCP server that bridges an Odoo ERP backend to LLM clients.
//!
//! The server speaks all three backend wire protocols (XML-RPC for 14-16,
//! JSON-RPC for 17-18, bearer-token REST for 19+), selects one by probing
//! the backend's version, and exposes a model-generic tool surface with a
//! strict, mode-based write policy. A merged static/dynamic model registry
//! supplies field and method metadata; a progressive five-level search and
//! a wizard executor cover the workflows record-level CRUD cannot.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use odoo_mcp::config::{Cli, Settings};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> odoo_mcp::Result<()> {
//!     let cli = Cli::parse();
//!     let settings = Settings::load(&cli)?;
//!     let parts = odoo_mcp::server::bootstrap(&settings).await?;
//!     odoo_mcp::server::serve(&settings, parts).await
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod normalize;
pub mod probe;
pub mod prompts;
pub mod registry;
pub mod resources;
pub mod rpc;
pub mod safety;
pub mod server;
pub mod state;
pub mod tools;
pub mod version;

pub use classifier::{ErrorCategory, ErrorClassifier, ErrorResponse};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{Error, Result};
pub use probe::VersionProber;
pub use registry::{FieldInfo, MethodInfo, ModelInfo, ModelRegistry, Registry};
pub use rpc::{Protocol, RpcError, RpcFault, WireAdapter};
pub use safety::{SafetyGate, SafetyMode, SafetyPolicy};
pub use server::{OdooMcpServer, bootstrap, serve};
pub use state::AppState;
pub use version::{Edition, OdooVersion};
