//! Shared server state wired through tools, resources and the MCP host.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::classifier::{ErrorCategory, ErrorClassifier, ErrorResponse};
use crate::connection::ConnectionManager;
use crate::normalize::NormalizeOptions;
use crate::registry::ModelRegistry;
use crate::rpc::{Context, RpcError};
use crate::safety::{AuditWriter, RateLimiter, SafetyGate};

/// Search-related limits from configuration.
#[derive(Clone, Copy, Debug)]
pub struct SearchLimits {
    pub default_limit: usize,
    pub max_limit: usize,
    pub deep_search_depth: u8,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            default_limit: 80,
            max_limit: 500,
            deep_search_depth: 5,
        }
    }
}

/// Everything a tool or resource handler needs, assembled once at startup.
pub struct AppState {
    pub connection: Arc<ConnectionManager>,
    pub registry: Arc<ModelRegistry>,
    pub gate: SafetyGate,
    pub limiter: RateLimiter,
    pub audit: AuditWriter,
    pub classifier: ErrorClassifier,
    pub normalize: NormalizeOptions,
    pub search_limits: SearchLimits,
    /// Set once after toolset registration; exposed via
    /// `odoo://system/toolsets`.
    pub toolset_report: std::sync::OnceLock<crate::tools::RegistrationReport>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Invoke the backend and classify any failure into the structured error
    /// shape tools return. Log severity follows the category.
    pub async fn backend_call(
        &self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        context: Option<&Context>,
    ) -> Result<Value, Box<ErrorResponse>> {
        self.connection
            .execute(model, method, args, kwargs, context)
            .await
            .map_err(|e| self.classify_rpc(e))
    }

    /// Map an adapter error into an [`ErrorResponse`], logging by severity.
    pub fn classify_rpc(&self, error: RpcError) -> Box<ErrorResponse> {
        let response = match error {
            RpcError::Fault(fault) => self.classifier.classify(&fault),
            RpcError::Transport(e) => ErrorResponse::new(
                ErrorCategory::Connection,
                "BACKEND_UNREACHABLE",
                format!("The backend could not be reached: {}", e),
                "Wait and retry; the server reconnects automatically.",
            ),
            RpcError::Timeout(after) => ErrorResponse::new(
                ErrorCategory::Connection,
                "BACKEND_TIMEOUT",
                format!("The backend did not answer within {:?}", after),
                "Retry with a smaller limit or narrower domain.",
            ),
            RpcError::SessionExpired => ErrorResponse::new(
                ErrorCategory::Connection,
                "SESSION_EXPIRED",
                "The backend session expired and could not be re-established",
                "Retry; the server re-authenticates automatically.",
            ),
            RpcError::AuthenticationFailed(message) => ErrorResponse::new(
                ErrorCategory::Configuration,
                "AUTHENTICATION_FAILED",
                message,
                "Check the configured credentials; this is not recoverable per call.",
            ),
            RpcError::Protocol(message) => ErrorResponse::new(
                ErrorCategory::Connection,
                "PROTOCOL_ERROR",
                message,
                "Retry; if the error persists the backend speaks an unexpected protocol version.",
            ),
            RpcError::Cancelled => ErrorResponse::new(
                ErrorCategory::Connection,
                "CANCELLED",
                "The operation was cancelled",
                "The server is shutting down or the request was aborted.",
            ),
        };

        match response.category {
            ErrorCategory::Validation | ErrorCategory::State | ErrorCategory::NotFound => {
                warn!(code = %response.code, message = %response.message, "backend call rejected");
            }
            ErrorCategory::Access | ErrorCategory::Connection | ErrorCategory::Unknown => {
                error!(code = %response.code, message = %response.message, "backend call failed");
            }
            _ => {}
        }
        if let Some(original) = &response.original_error {
            tracing::debug!(original = %original, "original backend error");
        }
        Box::new(response)
    }
}
