//! Legacy XML-RPC adapter (backend versions 14-16).
//!
//! The XML-RPC endpoints are served synchronously and the codec here wraps a
//! blocking HTTP client, so every call is dispatched through
//! `tokio::task::spawn_blocking`. The shared scheduler never blocks on this
//! protocol. Credentials travel as uid+password on every `execute_kw` call;
//! there is no session to expire, an auth fault simply surfaces on the call
//! that hit it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task;

use super::xml_codec;
use super::{Context, Protocol, RpcError, RpcResult, TlsOptions, WireAdapter, merge_context};

#[derive(Clone)]
struct Session {
    db: String,
    uid: i64,
    password: String,
}

/// Cached blocking endpoints for `/xmlrpc/2/common` and `/xmlrpc/2/object`.
/// Dropped on close; recreated on the next call if the adapter is reused.
struct Endpoints {
    client: reqwest::blocking::Client,
    common_url: String,
    object_url: String,
}

impl Endpoints {
    fn build(base_url: &str, timeout: Duration, tls: &TlsOptions) -> RpcResult<Self> {
        let client = tls.blocking_client(timeout)?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            common_url: format!("{}/xmlrpc/2/common", base),
            object_url: format!("{}/xmlrpc/2/object", base),
        })
    }

    fn call(&self, url: &str, method: &str, params: &[Value]) -> RpcResult<Value> {
        let body = xml_codec::encode_call(method, params);
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()?
            .error_for_status()?;
        let text = response.text()?;
        xml_codec::decode_response(&text)
    }
}

pub struct XmlRpcAdapter {
    base_url: String,
    timeout: Duration,
    tls: TlsOptions,
    base_context: Context,
    // Blocking state, touched only from spawn_blocking closures.
    endpoints: Arc<Mutex<Option<Arc<Endpoints>>>>,
    session: Arc<Mutex<Option<Session>>>,
}

impl std::fmt::Debug for XmlRpcAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlRpcAdapter")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl XmlRpcAdapter {
    pub fn new(base_url: impl Into<String>, timeout: Duration, tls: TlsOptions) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            tls,
            base_context: Context::new(),
            endpoints: Arc::new(Mutex::new(None)),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_base_context(mut self, context: Context) -> Self {
        self.base_context = context;
        self
    }

    /// Run `f` with the cached endpoints on the blocking pool, creating them
    /// on first use.
    async fn with_endpoints<T, F>(&self, f: F) -> RpcResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Endpoints) -> RpcResult<T> + Send + 'static,
    {
        let endpoints = Arc::clone(&self.endpoints);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let tls = self.tls.clone();

        task::spawn_blocking(move || {
            let cached = {
                let mut guard = endpoints
                    .lock()
                    .map_err(|_| RpcError::Protocol("endpoint lock poisoned".to_string()))?;
                match guard.as_ref() {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let built = Arc::new(Endpoints::build(&base_url, timeout, &tls)?);
                        *guard = Some(Arc::clone(&built));
                        built
                    }
                }
            };
            f(&cached)
        })
        .await
        .map_err(|_| RpcError::Cancelled)?
    }

    fn current_session(&self) -> RpcResult<Session> {
        self.session
            .lock()
            .map_err(|_| RpcError::Protocol("session lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| RpcError::AuthenticationFailed("not authenticated".to_string()))
    }
}

#[async_trait]
impl WireAdapter for XmlRpcAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::LegacyXml
    }

    async fn authenticate(&self, db: &str, login: &str, credential: &str) -> RpcResult<i64> {
        let params = vec![json!(db), json!(login), json!(credential), json!({})];
        let result = self
            .with_endpoints(move |ep| ep.call(&ep.common_url, "authenticate", &params))
            .await?;

        // The backend answers `false` (not a fault) on bad credentials.
        let uid = result.as_i64().unwrap_or(0);
        if uid <= 0 {
            return Err(RpcError::AuthenticationFailed(format!(
                "backend rejected credentials for '{}'",
                login
            )));
        }

        let session = Session {
            db: db.to_string(),
            uid,
            password: credential.to_string(),
        };
        *self
            .session
            .lock()
            .map_err(|_| RpcError::Protocol("session lock poisoned".to_string()))? = Some(session);
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
        let session = self.current_session()?;
        let merged = merge_context(&self.base_context, context);

        let mut kw = serde_json::Map::new();
        for (key, value) in kwargs {
            kw.insert(key, value);
        }
        if !merged.is_empty() {
            kw.insert("context".to_string(), json!(merged));
        }

        let params = vec![
            json!(session.db),
            json!(session.uid),
            json!(session.password),
            json!(model),
            json!(method),
            Value::Array(args),
            Value::Object(kw),
        ];
        let model_owned = model.to_string();
        let method_owned = method.to_string();

        self.with_endpoints(move |ep| ep.call(&ep.object_url, "execute_kw", &params))
            .await
            .map_err(|err| match err {
                RpcError::Fault(fault) => {
                    RpcError::Fault(fault.with_call(&model_owned, &method_owned))
                }
                other => other,
            })
    }

    async fn version_info(&self) -> RpcResult<Value> {
        self.with_endpoints(move |ep| ep.call(&ep.common_url, "version", &[]))
            .await
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.endpoints.lock() {
            *guard = None;
        }
        if let Ok(mut guard) = self.session.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_before_authenticate_fails() {
        let adapter = XmlRpcAdapter::new(
            "http://localhost:8069",
            Duration::from_secs(5),
            TlsOptions::default(),
        );
        let err = adapter
            .execute("res.partner", "read", vec![], HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::AuthenticationFailed(_)));
    }

    #[test]
    fn protocol_is_legacy_xml() {
        let adapter = XmlRpcAdapter::new(
            "http://localhost:8069",
            Duration::from_secs(5),
            TlsOptions::default(),
        );
        assert_eq!(adapter.protocol(), Protocol::LegacyXml);
    }
}
