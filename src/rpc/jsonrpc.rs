//! Legacy JSON-RPC adapter (backend versions 17-18).
//!
//! Speaks JSON-RPC 2.0 against `/web/session/authenticate` and
//! `/web/dataset/call_kw/{model}/{method}`. The session cookie issued at
//! login is carried by the client's cookie store; HTTP 401/403 or JSON-RPC
//! error code 100 signal an expired session, which the connection manager
//! repairs by re-authenticating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Context, Protocol, RpcError, RpcFault, RpcResult, TlsOptions, WireAdapter, merge_context};

/// JSON-RPC error code the backend uses for "session expired".
const SESSION_EXPIRED_CODE: i64 = 100;

pub struct JsonRpcAdapter {
    client: reqwest::Client,
    base_url: String,
    base_context: Context,
    request_id: AtomicU64,
}

impl std::fmt::Debug for JsonRpcAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcAdapter")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl JsonRpcAdapter {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tls: &TlsOptions,
    ) -> RpcResult<Self> {
        Ok(Self {
            client: tls.client(timeout, true)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            base_context: Context::new(),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn with_base_context(mut self, context: Context) -> Self {
        self.base_context = context;
        self
    }

    async fn rpc(&self, path: &str, params: Value) -> RpcResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "call",
            "params": params,
        });

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RpcError::SessionExpired);
        }
        let response = response.error_for_status()?;
        let envelope: Value = response.json().await?;

        if let Some(error) = envelope.get("error") {
            return Err(decode_error(error));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn decode_error(error: &Value) -> RpcError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == SESSION_EXPIRED_CODE {
        return RpcError::SessionExpired;
    }

    let data = error.get("data");
    let message = data
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .or_else(|| error.get("message").and_then(Value::as_str))
        .unwrap_or("unknown JSON-RPC error")
        .to_string();
    let traceback = data
        .and_then(|d| d.get("debug"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut fault = RpcFault::from_backend(message.clone(), traceback);
    // The structured class name wins over whatever the traceback parse found.
    if let Some(name) = data
        .and_then(|d| d.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
    {
        fault.error_class = Some(name.to_string());
        fault.message = message;
    }
    RpcError::Fault(fault)
}

#[async_trait]
impl WireAdapter for JsonRpcAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::LegacyJson
    }

    async fn authenticate(&self, db: &str, login: &str, credential: &str) -> RpcResult<i64> {
        let result = self
            .rpc(
                "/web/session/authenticate",
                json!({"db": db, "login": login, "password": credential}),
            )
            .await?;

        // uid is false (not an error) when credentials are rejected.
        let uid = result.get("uid").and_then(Value::as_i64).unwrap_or(0);
        if uid <= 0 {
            return Err(RpcError::AuthenticationFailed(format!(
                "backend rejected credentials for '{}'",
                login
            )));
        }
        Ok(uid)
    }

    async fn execute(
        &self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        context: Option<&Context>,
    ) -> RpcResult<Value> {
        let merged = merge_context(&self.base_context, context);

        let mut kw = serde_json::Map::new();
        for (key, value) in kwargs {
            kw.insert(key, value);
        }
        if !merged.is_empty() {
            kw.insert("context".to_string(), json!(merged));
        }

        let path = format!("/web/dataset/call_kw/{}/{}", model, method);
        self.rpc(
            &path,
            json!({
                "model": model,
                "method": method,
                "args": args,
                "kwargs": Value::Object(kw),
            }),
        )
        .await
        .map_err(|err| match err {
            RpcError::Fault(fault) => RpcError::Fault(fault.with_call(model, method)),
            other => other,
        })
    }

    async fn version_info(&self) -> RpcResult<Value> {
        self.rpc("/web/webclient/version_info", json!({})).await
    }

    async fn close(&self) {
        // The cookie store dies with the client; nothing persistent to drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_100_is_session_expiry() {
        let err = decode_error(&json!({"code": 100, "message": "Session expired"}));
        assert!(matches!(err, RpcError::SessionExpired));
    }

    #[test]
    fn structured_error_class_wins() {
        let err = decode_error(&json!({
            "code": 200,
            "message": "Odoo Server Error",
            "data": {
                "name": "odoo.exceptions.ValidationError",
                "message": "Missing partner",
                "debug": "Traceback...\nValueError: something else",
            }
        }));
        match err {
            RpcError::Fault(fault) => {
                assert_eq!(
                    fault.error_class.as_deref(),
                    Some("odoo.exceptions.ValidationError")
                );
                assert_eq!(fault.message, "Missing partner");
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }
}
