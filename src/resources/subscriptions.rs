//! Polling-based resource subscriptions.
//!
//! One manager per client session. Each subscription runs its own poller
//! task that computes a change signature (a record's `write_date`, or the
//! serialized system info) and emits `notifications/resources/updated` when
//! it moves. Pollers share the connection manager and therefore its
//! reconnection barrier. A poller that stops for any reason (unsubscribe,
//! dead peer, access loss, deleted record) releases its slot in the
//! per-client cap before it exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rmcp::model::ResourceUpdatedNotificationParam;
use rmcp::service::{Peer, RoleServer};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::classifier::{ErrorCategory, ErrorResponse};
use crate::state::AppState;

use super::ResourceUri;

/// Per-client subscription cap.
pub const SUBSCRIPTION_LIMIT: usize = 50;

/// Outbound `resources/updated` channel. The server hands in the session
/// peer; tests substitute their own sink.
#[async_trait]
pub(crate) trait UpdateNotifier: Send + Sync + 'static {
    /// Err means the client is gone and the watch should stop.
    async fn notify_updated(&self, uri: String) -> Result<(), ()>;
}

#[async_trait]
impl UpdateNotifier for Peer<RoleServer> {
    async fn notify_updated(&self, uri: String) -> Result<(), ()> {
        self.notify_resource_updated(ResourceUpdatedNotificationParam { uri })
            .await
            .map_err(|_| ())
    }
}

struct ActiveSubscription {
    poller: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

pub struct SubscriptionManager {
    app: Arc<AppState>,
    poll_interval: Duration,
    /// Shared with every poller so each can release its own slot on exit.
    active: Arc<DashMap<String, ActiveSubscription>>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.active.len())
            .finish()
    }
}

impl SubscriptionManager {
    pub fn new(app: Arc<AppState>, poll_interval: Duration) -> Self {
        Self {
            app,
            poll_interval,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.active.len()
    }

    /// Start watching a URI for this client.
    pub fn subscribe(
        &self,
        uri: &str,
        parsed: ResourceUri,
        peer: Peer<RoleServer>,
    ) -> Result<(), Box<ErrorResponse>> {
        self.subscribe_with(uri, parsed, peer)
    }

    pub(crate) fn subscribe_with<N: UpdateNotifier>(
        &self,
        uri: &str,
        parsed: ResourceUri,
        notifier: N,
    ) -> Result<(), Box<ErrorResponse>> {
        if !parsed.subscribable() {
            return Err(Box::new(
                ErrorResponse::new(
                    ErrorCategory::Validation,
                    "NOT_SUBSCRIBABLE",
                    format!("'{}' does not support subscriptions", uri),
                    "Only odoo://record/{model}/{id} and odoo://system/info can be subscribed.",
                )
                .with_details(json!({"uri": uri})),
            ));
        }
        if self.active.contains_key(uri) {
            return Ok(());
        }
        if self.active.len() >= SUBSCRIPTION_LIMIT {
            return Err(Box::new(
                ErrorResponse::new(
                    ErrorCategory::RateLimit,
                    "SUBSCRIPTION_LIMIT",
                    format!("This session already has {} subscriptions", SUBSCRIPTION_LIMIT),
                    "Unsubscribe from resources you no longer watch.",
                )
                .with_details(json!({"limit": SUBSCRIPTION_LIMIT})),
            ));
        }

        let app = Arc::clone(&self.app);
        let active = Arc::clone(&self.active);
        let interval = self.poll_interval;
        let uri_owned = uri.to_string();
        // The poller waits for this gate so its self-removal can never race
        // the insert below.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let poller = tokio::spawn(async move {
            let _ = registered_rx.await;
            poll_loop(app, &uri_owned, parsed, notifier, interval).await;
            // Every exit path releases the slot; dead watches never pin the
            // cap.
            active.remove(&uri_owned);
        });

        self.active
            .insert(uri.to_string(), ActiveSubscription { poller });
        let _ = registered_tx.send(());
        debug!(uri, "subscription started");
        Ok(())
    }

    pub fn unsubscribe(&self, uri: &str) {
        if self.active.remove(uri).is_some() {
            debug!(uri, "subscription removed");
        }
    }

    /// Drop everything; used when the client disconnects.
    pub fn clear(&self) {
        self.active.clear();
    }
}

async fn poll_loop<N: UpdateNotifier>(
    app: Arc<AppState>,
    uri: &str,
    parsed: ResourceUri,
    notifier: N,
    interval: Duration,
) {
    let mut last_signature: Option<String> = None;
    let shutdown = app.shutdown.clone();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }

        match signature(&app, &parsed).await {
            Ok(current) => {
                let changed = last_signature.as_ref().is_some_and(|prev| prev != &current);
                if changed {
                    debug!(uri = %uri, "resource changed; notifying");
                    if notifier.notify_updated(uri.to_string()).await.is_err() {
                        // Client is gone; stop polling and let the caller
                        // release the slot.
                        return;
                    }
                }
                last_signature = Some(current);
            }
            Err(e) => {
                // Access loss or a deleted record ends the watch.
                warn!(uri = %uri, code = %e.code, "subscription poll failed; stopping");
                return;
            }
        }
    }
}

/// Cheap change signature for a subscribable resource.
async fn signature(app: &AppState, parsed: &ResourceUri) -> Result<String, Box<ErrorResponse>> {
    match parsed {
        ResourceUri::Record { model, id } => {
            let mut kwargs: HashMap<String, Value> = HashMap::new();
            kwargs.insert("fields".to_string(), json!(["write_date"]));
            let rows = app
                .backend_call(model, "read", vec![json!([id])], kwargs, None)
                .await?;
            let write_date = rows
                .as_array()
                .and_then(|rows| rows.first())
                .and_then(|row| row.get("write_date"))
                .cloned()
                .unwrap_or(Value::Null);
            if write_date.is_null() {
                return Err(Box::new(ErrorResponse::new(
                    ErrorCategory::NotFound,
                    "RECORD_GONE",
                    format!("Record {} on {} no longer exists", id, model),
                    "The record was deleted; the subscription has been removed.",
                )));
            }
            Ok(write_date.to_string())
        }
        ResourceUri::SystemInfo => {
            let state = app.connection.state().await;
            let version = app
                .connection
                .version()
                .await
                .map(|v| v.full_string)
                .unwrap_or_default();
            Ok(format!("{:?}|{}", state, version))
        }
        _ => Ok(String::new()),
    }
}
