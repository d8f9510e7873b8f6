//! Modern REST adapter (backend versions 19+).
//!
//! Speaks the `/json/2/{model}/{method}` interface with a bearer API key.
//! The token is stateless: there is no session to re-establish, a 401 means
//! the key itself is invalid. Null and empty are distinguished natively and
//! integers are full 64-bit.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use super::{Context, Protocol, RpcError, RpcFault, RpcResult, TlsOptions, WireAdapter, merge_context};

pub struct RestAdapter {
    client: reqwest::Client,
    base_url: String,
    base_context: Context,
    bearer: RwLock<Option<SecretString>>,
}

impl std::fmt::Debug for RestAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAdapter")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl RestAdapter {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tls: &TlsOptions,
    ) -> RpcResult<Self> {
        Ok(Self {
            client: tls.client(timeout, false)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            base_context: Context::new(),
            bearer: RwLock::new(None),
        })
    }

    pub fn with_base_context(mut self, context: Context) -> Self {
        self.base_context = context;
        self
    }

    async fn call(&self, model: &str, method: &str, body: Value) -> RpcResult<Value> {
        let token = self
            .bearer
            .read()
            .await
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .ok_or_else(|| RpcError::AuthenticationFailed("no API key configured".to_string()))?;

        let response = self
            .client
            .post(format!("{}/json/2/{}/{}", self.base_url, model, method))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RpcError::AuthenticationFailed(
                "backend rejected the API key".to_string(),
            ));
        }
        let status = response.status();
        let envelope: Value = response.json().await.map_err(|e| {
            RpcError::Protocol(format!("non-JSON response (status {}): {}", status, e))
        })?;

        if let Some(error) = envelope.get("error") {
            return Err(decode_error(error));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn decode_error(error: &Value) -> RpcError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown backend error")
        .to_string();
    let traceback = error
        .get("debug")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut fault = RpcFault::from_backend(message.clone(), traceback);
    if let Some(name) = error
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
    {
        fault.error_class = Some(name.to_string());
        fault.message = message;
    }
    RpcError::Fault(fault)
}

#[async_trait]
impl WireAdapter for RestAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::ModernRest
    }

    /// Stores the API key and resolves the uid for `login` with a cheap
    /// lookup. The key is the credential; `db` is implicit in the host.
    async fn authenticate(&self, _db: &str, login: &str, credential: &str) -> RpcResult<i64> {
        *self.bearer.write().await = Some(SecretString::from(credential.to_string()));

        let result = self
            .call(
                "res.users",
                "search_read",
                json!({
                    "args": [[["login", "=", login]]],
                    "fields": ["id"],
                    "limit": 1,
                }),
            )
            .await?;

        let uid = result
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("id"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if uid <= 0 {
            return Err(RpcError::AuthenticationFailed(format!(
                "no user matches login '{}'",
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

        let mut body = serde_json::Map::new();
        body.insert("args".to_string(), Value::Array(args));
        for (key, value) in kwargs {
            body.insert(key, value);
        }
        if !merged.is_empty() {
            body.insert("context".to_string(), json!(merged));
        }

        self.call(model, method, Value::Object(body))
            .await
            .map_err(|err| match err {
                RpcError::Fault(fault) => RpcError::Fault(fault.with_call(model, method)),
                other => other,
            })
    }

    /// The webclient version endpoint stays available on REST-era backends
    /// and needs no session, so it is reused here for self-description.
    async fn version_info(&self) -> RpcResult<Value> {
        let response = self
            .client
            .post(format!("{}/web/webclient/version_info", self.base_url))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "call", "params": {}}))
            .send()
            .await?
            .error_for_status()?;
        let envelope: Value = response.json().await?;
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn close(&self) {
        *self.bearer.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_without_key_fails() {
        let adapter = RestAdapter::new(
            "http://localhost:8069",
            Duration::from_secs(5),
            &TlsOptions::default(),
        )
        .unwrap();
        let err = adapter
            .execute("res.partner", "read", vec![], HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::AuthenticationFailed(_)));
    }

    #[test]
    fn decodes_structured_error() {
        let err = decode_error(&json!({
            "name": "odoo.exceptions.UserError",
            "message": "Cannot delete posted entry",
        }));
        match err {
            RpcError::Fault(fault) => {
                assert_eq!(
                    fault.error_class.as_deref(),
                    Some("odoo.exceptions.UserError")
                );
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }
}
