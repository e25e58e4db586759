//! Security audit trail
//!
//! Every consequential auth event produces an audit record. Sinks are
//! fire-and-forget: logging never fails the operation that triggered it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of auditable auth events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Login,
    LoginFailed,
    Logout,
    SessionCreated,
    SessionDestroyed,
    TwoFactorEnabled,
    TwoFactorDisabled,
    TwoFactorFailed,
    BackupCodeUsed,
    PasswordChanged,
    PasswordReset,
    Registration,
}

impl AuditCategory {
    /// Dotted event name, e.g. `session.destroyed`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "auth.login",
            Self::LoginFailed => "auth.login_failed",
            Self::Logout => "auth.logout",
            Self::SessionCreated => "session.created",
            Self::SessionDestroyed => "session.destroyed",
            Self::TwoFactorEnabled => "2fa.enabled",
            Self::TwoFactorDisabled => "2fa.disabled",
            Self::TwoFactorFailed => "2fa.failed",
            Self::BackupCodeUsed => "2fa.backup_code_used",
            Self::PasswordChanged => "password.changed",
            Self::PasswordReset => "password.reset",
            Self::Registration => "auth.registration",
        }
    }

    /// Whether the event indicates a failed or suspicious attempt
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::LoginFailed | Self::TwoFactorFailed)
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub category: AuditCategory,
    pub message: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    fn log(&self, category: AuditCategory, message: &str, data: serde_json::Value);
}

/// Emits audit records as `tracing` events on the `audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, category: AuditCategory, message: &str, data: serde_json::Value) {
        if category.is_failure() {
            tracing::warn!(target: "audit", event = %category, data = %data, "{}", message);
        } else {
            tracing::info!(target: "audit", event = %category, data = %data, "{}", message);
        }
    }
}

/// Keeps audit records in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records of one category, oldest first
    pub fn by_category(&self, category: AuditCategory) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.category == category)
            .cloned()
            .collect()
    }

    pub fn count(&self, category: AuditCategory) -> usize {
        self.records.lock().iter().filter(|r| r.category == category).count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, category: AuditCategory, message: &str, data: serde_json::Value) {
        self.records.lock().push(AuditRecord {
            category,
            message: message.to_string(),
            data,
            timestamp: Utc::now(),
        });
    }
}
