//! Connection lifecycle: probing, authentication, health checks, reconnect.
//!
//! Exactly one adapter instance is active while the manager is `Ready`. The
//! base context (language, timezone, allowed companies) is built once and
//! never mutated; per-call contexts are overlaid at invocation time. State
//! transitions are serialized through a single mutex and waiters park on a
//! readiness notify during reconnection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe::{self, VersionProber};
use crate::rpc::{
    Context, JsonRpcAdapter, Protocol, RestAdapter, RpcError, RpcResult, TlsOptions, WireAdapter,
    XmlRpcAdapter,
};
use crate::version::{Edition, OdooVersion};

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Ready,
    Error,
    Reconnecting,
}

/// Everything needed to reach and authenticate against one backend.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: Option<SecretString>,
    pub api_key: Option<SecretString>,
    /// Force a protocol instead of selecting by probed version.
    pub protocol: Option<Protocol>,
    pub timeout: Duration,
    pub tls: TlsOptions,
    /// Idle window after which the next operation runs a health check first.
    pub health_check_interval: Duration,
    pub reconnect_max: u32,
    pub backoff_base: Duration,
    pub base_context: Context,
}

impl ConnectionConfig {
    pub fn new(
        url: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            username: username.into(),
            password: None,
            api_key: None,
            protocol: None,
            timeout: Duration::from_secs(30),
            tls: TlsOptions::default(),
            health_check_interval: Duration::from_secs(300),
            reconnect_max: 3,
            backoff_base: Duration::from_secs(1),
            base_context: Context::new(),
        }
    }
}

/// Backoff schedule for reconnect attempts: base, 2x, 4x with light jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let millis = base.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = millis * 0.1 * (rand::random::<f64>() * 2.0 - 1.0);
    Duration::from_millis((millis + jitter).max(0.0) as u64)
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    adapter: RwLock<Option<Arc<dyn WireAdapter>>>,
    version: RwLock<Option<OdooVersion>>,
    uid: RwLock<Option<i64>>,
    /// Lock-free copy of the uid for synchronous readers (audit path).
    /// Zero means "not authenticated".
    cached_uid: std::sync::atomic::AtomicI64,
    last_activity: Mutex<Instant>,
    ready: Notify,
    /// Serializes connect/reconnect so transitions are never interleaved.
    transition: Mutex<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url)
            .field("database", &self.config.database)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            adapter: RwLock::new(None),
            version: RwLock::new(None),
            uid: RwLock::new(None),
            cached_uid: std::sync::atomic::AtomicI64::new(0),
            last_activity: Mutex::new(Instant::now()),
            ready: Notify::new(),
            transition: Mutex::new(()),
            shutdown,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn version(&self) -> Option<OdooVersion> {
        self.version.read().await.clone()
    }

    pub async fn uid(&self) -> Option<i64> {
        *self.uid.read().await
    }

    /// Synchronous uid snapshot for non-async callers; may lag a reconnect
    /// by one call.
    pub fn uid_hint(&self) -> Option<i64> {
        match self.cached_uid.load(std::sync::atomic::Ordering::Relaxed) {
            0 => None,
            uid => Some(uid),
        }
    }

    pub fn base_context(&self) -> &Context {
        &self.config.base_context
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Probe, build the adapter, authenticate, become `Ready`.
    pub async fn connect(&self) -> RpcResult<()> {
        let _guard = self.transition.lock().await;
        self.set_state(ConnectionState::Connecting).await;

        let (version, selected) = self.probe_version().await;
        let protocol = self.config.protocol.unwrap_or(selected);
        info!(version = %version.full_string, %protocol, "connecting to backend");

        let adapter = self.build_adapter(protocol)?;
        match self.authenticate(adapter.as_ref(), protocol).await {
            Ok(uid) => {
                self.set_state(ConnectionState::Authenticated).await;
                *self.uid.write().await = Some(uid);
                self.cached_uid.store(uid, std::sync::atomic::Ordering::Relaxed);

                let mut version = version;
                if version.edition == Edition::Unknown {
                    version.edition = probe::detect_edition(adapter.as_ref()).await;
                    if version.edition == Edition::Community {
                        debug!("edition resolved to community");
                    }
                }
                *self.version.write().await = Some(version);
                *self.adapter.write().await = Some(adapter);
                self.touch().await;
                self.set_state(ConnectionState::Ready).await;
                self.ready.notify_waiters();
                Ok(())
            }
            Err(e) => {
                adapter.close().await;
                self.set_state(ConnectionState::Error).await;
                Err(e)
            }
        }
    }

    async fn probe_version(&self) -> (OdooVersion, Protocol) {
        let credential = self
            .config
            .api_key
            .as_ref()
            .or(self.config.password.as_ref())
            .map(|s| s.expose_secret().to_string())
            .unwrap_or_default();
        VersionProber::new(
            &self.config.url,
            &self.config.database,
            &self.config.username,
            credential,
        )
        .with_timeout(self.config.timeout.min(Duration::from_secs(10)))
        .with_tls(self.config.tls.clone())
        .probe()
        .await
    }

    fn build_adapter(&self, protocol: Protocol) -> RpcResult<Arc<dyn WireAdapter>> {
        let base_context = self.config.base_context.clone();
        Ok(match protocol {
            Protocol::LegacyXml => Arc::new(
                XmlRpcAdapter::new(&self.config.url, self.config.timeout, self.config.tls.clone())
                    .with_base_context(base_context),
            ),
            Protocol::LegacyJson => Arc::new(
                JsonRpcAdapter::new(&self.config.url, self.config.timeout, &self.config.tls)?
                    .with_base_context(base_context),
            ),
            Protocol::ModernRest => Arc::new(
                RestAdapter::new(&self.config.url, self.config.timeout, &self.config.tls)?
                    .with_base_context(base_context),
            ),
        })
    }

    /// Credential tie-break: api-key first; fall back to the password only on
    /// an auth-shaped failure, and never for the REST protocol where the key
    /// is mandatory.
    async fn authenticate(&self, adapter: &dyn WireAdapter, protocol: Protocol) -> RpcResult<i64> {
        let db = &self.config.database;
        let user = &self.config.username;

        match (&self.config.api_key, &self.config.password) {
            (Some(key), Some(password)) if protocol != Protocol::ModernRest => {
                match adapter.authenticate(db, user, key.expose_secret()).await {
                    Ok(uid) => Ok(uid),
                    Err(e) if e.is_auth_shaped() => {
                        warn!("api key rejected; falling back to password authentication");
                        adapter.authenticate(db, user, password.expose_secret()).await
                    }
                    Err(e) => Err(e),
                }
            }
            (Some(key), _) => adapter.authenticate(db, user, key.expose_secret()).await,
            (None, Some(_)) if protocol == Protocol::ModernRest => Err(
                RpcError::AuthenticationFailed("the REST protocol requires an API key".to_string()),
            ),
            (None, Some(password)) => {
                adapter.authenticate(db, user, password.expose_secret()).await
            }
            (None, None) => Err(RpcError::AuthenticationFailed(
                "no password or API key configured".to_string(),
            )),
        }
    }

    /// Invoke `model.method` through the active adapter with health checking
    /// and the reconnect-then-retry-once policy.
    pub async fn execute(
        &self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        context: Option<&Context>,
    ) -> RpcResult<Value> {
        self.ensure_ready().await?;

        let adapter = self.current_adapter().await?;
        let call = adapter.execute(model, method, args.clone(), kwargs.clone(), context);
        let result = tokio::select! {
            r = call => r,
            _ = self.shutdown.cancelled() => Err(RpcError::Cancelled),
        };
        self.touch().await;

        match result {
            Err(e) if e.is_connection_shaped() => {
                debug!(model, method, error = %e, "call failed with connection-shaped error; reconnecting");
                self.reconnect().await?;
                // Retry the failed operation exactly once.
                let adapter = self.current_adapter().await?;
                let retry = adapter.execute(model, method, args, kwargs, context);
                let result = tokio::select! {
                    r = retry => r,
                    _ = self.shutdown.cancelled() => Err(RpcError::Cancelled),
                };
                self.touch().await;
                result
            }
            other => other,
        }
    }

    /// Wait out any in-flight reconnection, then run the idle health check.
    async fn ensure_ready(&self) -> RpcResult<()> {
        loop {
            // Register for the readiness signal before reading the state, so
            // a transition landing in between still wakes us.
            let notified = self.ready.notified();
            match self.state().await {
                ConnectionState::Ready => break,
                ConnectionState::Reconnecting | ConnectionState::Connecting => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.shutdown.cancelled() => return Err(RpcError::Cancelled),
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Error => {
                    return Err(RpcError::Protocol("not connected".to_string()));
                }
                ConnectionState::Authenticated => break,
            }
        }

        let idle = self.last_activity.lock().await.elapsed();
        if idle >= self.config.health_check_interval {
            debug!(idle_secs = idle.as_secs(), "idle window elapsed; running health check");
            if let Err(e) = self.health_check().await {
                debug!(error = %e, "health check failed; reconnecting");
                self.reconnect().await?;
            }
        }
        Ok(())
    }

    /// Cheapest identity check: verify the current uid still resolves.
    async fn health_check(&self) -> RpcResult<()> {
        let adapter = self.current_adapter().await?;
        let uid = self
            .uid()
            .await
            .ok_or_else(|| RpcError::Protocol("no uid on record".to_string()))?;
        let count = adapter
            .execute(
                "res.users",
                "search_count",
                vec![json!([["id", "=", uid]])],
                HashMap::new(),
                None,
            )
            .await?;
        self.touch().await;
        if count.as_i64().unwrap_or(0) >= 1 {
            Ok(())
        } else {
            Err(RpcError::SessionExpired)
        }
    }

    /// Reconnect with exponential backoff, serialized so concurrent failures
    /// trigger a single pass. Callers that lose the race wait on readiness.
    async fn reconnect(&self) -> RpcResult<()> {
        let Ok(_guard) = self.transition.try_lock() else {
            // Another caller is already reconnecting; wait for the outcome.
            // The signal is registered before re-reading the state so the
            // other pass cannot complete unnoticed in between.
            let notified = self.ready.notified();
            if self.state().await != ConnectionState::Ready {
                tokio::select! {
                    _ = notified => {}
                    _ = self.shutdown.cancelled() => return Err(RpcError::Cancelled),
                }
            }
            return match self.state().await {
                ConnectionState::Ready => Ok(()),
                _ => Err(RpcError::Protocol("reconnection failed".to_string())),
            };
        };

        self.set_state(ConnectionState::Reconnecting).await;
        if let Some(old) = self.adapter.write().await.take() {
            old.close().await;
        }

        let protocol = self
            .config
            .protocol
            .or_else(|| {
                // Blocking read is fine: version is only written under the
                // transition lock we are holding.
                self.version
                    .try_read()
                    .ok()
                    .and_then(|v| v.as_ref().map(|v| Protocol::for_major(v.major)))
            })
            .unwrap_or(Protocol::LegacyXml);

        let mut last_error = RpcError::Protocol("reconnect never attempted".to_string());
        for attempt in 1..=self.config.reconnect_max {
            let delay = backoff_delay(self.config.backoff_base, attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect attempt");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Err(RpcError::Cancelled),
            }

            let adapter = self.build_adapter(protocol)?;
            match self.authenticate(adapter.as_ref(), protocol).await {
                Ok(uid) => {
                    *self.uid.write().await = Some(uid);
                    self.cached_uid.store(uid, std::sync::atomic::Ordering::Relaxed);
                    *self.adapter.write().await = Some(adapter);
                    self.touch().await;
                    self.set_state(ConnectionState::Ready).await;
                    self.ready.notify_waiters();
                    info!(attempt, "reconnected to backend");
                    return Ok(());
                }
                Err(e) => {
                    adapter.close().await;
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = e;
                }
            }
        }

        self.set_state(ConnectionState::Error).await;
        self.ready.notify_waiters();
        Err(last_error)
    }

    async fn current_adapter(&self) -> RpcResult<Arc<dyn WireAdapter>> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| RpcError::Protocol("no active adapter".to_string()))
    }

    /// The active adapter, for collaborators that poll independently
    /// (resource subscriptions) but share the reconnection barrier.
    pub async fn adapter(&self) -> RpcResult<Arc<dyn WireAdapter>> {
        self.ensure_ready().await?;
        self.current_adapter().await
    }

    pub async fn close(&self) {
        let _guard = self.transition.lock().await;
        if let Some(adapter) = self.adapter.write().await.take() {
            adapter.close().await;
        }
        *self.uid.write().await = None;
        self.cached_uid.store(0, std::sync::atomic::Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected).await;
        self.ready.notify_waiters();
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        // Jitter is ±10%; check the midpoints scale 1x/2x/4x.
        let base = Duration::from_secs(1);
        let d1 = backoff_delay(base, 1).as_millis() as f64;
        let d2 = backoff_delay(base, 2).as_millis() as f64;
        let d3 = backoff_delay(base, 3).as_millis() as f64;
        assert!((900.0..=1100.0).contains(&d1), "d1 = {d1}");
        assert!((1800.0..=2200.0).contains(&d2), "d2 = {d2}");
        assert!((3600.0..=4400.0).contains(&d3), "d3 = {d3}");
    }

    #[tokio::test]
    async fn execute_without_connect_is_an_error() {
        let config = ConnectionConfig::new("http://localhost:8069", "db", "admin");
        let manager = ConnectionManager::new(config, CancellationToken::new());
        let err = manager
            .execute("res.partner", "read", vec![], HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn initial_state_is_disconnected() {
        let config = ConnectionConfig::new("http://localhost:8069", "db", "admin");
        let manager = ConnectionManager::new(config, CancellationToken::new());
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }
}
