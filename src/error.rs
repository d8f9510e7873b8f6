//! Crate-level error types.

use thiserror::Error;

use crate::rpc::RpcError;

/// Top-level error for server construction and operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend RPC failure
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Registry could not be built or loaded
    #[error("registry error: {0}")]
    Registry(String),

    /// Toolset registration failure (cycle, duplicate tool, missing dependency)
    #[error("toolset error: {0}")]
    Toolset(String),

    /// MCP transport or serve-loop failure
    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
