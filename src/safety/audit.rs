//! Append-only audit log.
//!
//! One JSON object per line, written by a dedicated task fed through a
//! bounded channel so the tool path never waits on disk. Order within a
//! session is preserved by the channel. Secret field values and binary
//! payloads are sanitized before the entry is enqueued.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Value strings longer than this are treated as binary payloads and
/// replaced with a marker.
const BINARY_VALUE_THRESHOLD: usize = 1024;

#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub enabled: bool,
    pub file: PathBuf,
    pub log_reads: bool,
    pub log_writes: bool,
    pub log_deletes: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: PathBuf::from("odoo-mcp-audit.jsonl"),
            log_reads: false,
            log_writes: true,
            log_deletes: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub session_id: String,
    pub tool: String,
    pub model: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<i64>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
}

impl AuditEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn now(
        session_id: impl Into<String>,
        tool: impl Into<String>,
        model: impl Into<String>,
        operation: impl Into<String>,
        values: Option<Value>,
        result_id: Option<i64>,
        success: bool,
        duration_ms: u64,
        uid: Option<i64>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.into(),
            tool: tool.into(),
            model: model.into(),
            operation: operation.into(),
            values: values.map(sanitize),
            result_id,
            success,
            duration_ms,
            uid,
        }
    }
}

/// Replace secret fields and binary payloads; keys survive, values do not.
fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sanitized = map
                .into_iter()
                .map(|(key, val)| {
                    if crate::safety::DEFAULT_FIELD_BLOCKLIST.contains(&key.as_str()) {
                        (key, json!("<redacted>"))
                    } else {
                        (key, sanitize(val))
                    }
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::String(s) if s.len() > BINARY_VALUE_THRESHOLD => json!("<binary omitted>"),
        other => other,
    }
}

enum Command {
    Write(Box<AuditEntry>),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Handle to the audit writer task. Cloneable; dropping every handle closes
/// the channel and lets the task drain and exit.
#[derive(Clone)]
pub struct AuditWriter {
    config: AuditConfig,
    tx: Option<mpsc::Sender<Command>>,
}

impl std::fmt::Debug for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter")
            .field("enabled", &self.config.enabled)
            .field("file", &self.config.file)
            .finish()
    }
}

impl AuditWriter {
    /// Spawn the writer task. Disabled configs produce an inert handle.
    pub async fn start(config: AuditConfig) -> std::io::Result<Self> {
        if !config.enabled {
            return Ok(Self { config, tx: None });
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file)
            .await?;
        let (tx, mut rx) = mpsc::channel::<Command>(1024);

        tokio::spawn(async move {
            let mut file = file;
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Write(entry) => match serde_json::to_string(&entry) {
                        Ok(mut line) => {
                            line.push('\n');
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                warn!(error = %e, "audit write failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "audit entry serialization failed"),
                    },
                    Command::Flush(done) => {
                        if let Err(e) = file.flush().await {
                            warn!(error = %e, "audit flush failed");
                        }
                        let _ = done.send(());
                    }
                }
            }
            let _ = file.flush().await;
            debug!("audit writer drained");
        });

        Ok(Self {
            config,
            tx: Some(tx),
        })
    }

    /// Whether this operation class should be recorded at all.
    pub fn should_log(&self, operation: &str) -> bool {
        if self.tx.is_none() {
            return false;
        }
        match operation {
            "unlink" => self.config.log_deletes,
            "create" | "write" | "execute" => self.config.log_writes,
            _ => self.config.log_reads,
        }
    }

    /// Enqueue an entry without waiting. A full channel drops the entry with
    /// a warning rather than stalling the tool path.
    pub fn record(&self, entry: AuditEntry) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(Command::Write(Box::new(entry))) {
                warn!(error = %e, "audit channel full; entry dropped");
            }
        }
    }

    /// Wait until everything enqueued so far is on disk.
    pub async fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            if tx.send(Command::Flush(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        }
    }
}
