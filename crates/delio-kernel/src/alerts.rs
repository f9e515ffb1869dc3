//! Out-of-band operator alerts.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use delio_core::ids::AlertId;
use delio_core::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Expected operational condition (timeouts, contention).
    Warning,
    /// Handler defect detected by the guard.
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub id: AlertId,
    pub severity: AlertSeverity,
    /// Short machine-readable kind, e.g. `illegal_transition`.
    pub kind: String,
    pub user_id: Option<UserId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn new(
        severity: AlertSeverity,
        kind: &str,
        user_id: Option<UserId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            severity,
            kind: kind.to_string(),
            user_id,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// One-line rendering for chat delivery.
    pub fn render(&self) -> String {
        let level = match self.severity {
            AlertSeverity::Warning => "WARN",
            AlertSeverity::Critical => "CRITICAL",
        };
        match self.user_id {
            Some(user) => format!("[{level}] {} (user {user}): {}", self.kind, self.message),
            None => format!("[{level}] {}: {}", self.kind, self.message),
        }
    }
}

/// Broadcast alert channel. `emit` never awaits; lagging receivers drop
/// alerts rather than blocking the kernel.
pub struct AlertEmitter {
    tx: broadcast::Sender<OperatorAlert>,
    emit_count: AtomicU64,
}

impl AlertEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Returns the number of receivers reached.
    pub fn emit(&self, alert: OperatorAlert) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(alert).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorAlert> {
        self.tx.subscribe()
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for AlertEmitter {
    fn default() -> Self {
        Self::new()
    }
}
