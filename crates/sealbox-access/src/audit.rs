//! Audit trail for integrity failures
//!
//! An AEAD failure on data the caller should be able to read (a wrap
//! addressed to them, a field under a key they hold) may mean tampering
//! or a wrap/key mismatch bug. Every such failure is recorded here before
//! the error propagates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use sealbox_core::{AUDIT_TARGET, ResourceId, UserId};

/// One integrity failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub resource: ResourceId,
    pub user: UserId,
    pub operation: &'static str,
    pub error: String,
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes audit events to the `sealbox::audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        error!(
            target: AUDIT_TARGET,
            resource = %event.resource,
            user = %event.user,
            operation = event.operation,
            error = %event.error,
            "Integrity failure"
        );
    }
}

/// Keeps audit events in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Audit front end shared by the managers
#[derive(Clone)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            sinks: vec![Arc::new(TracingAuditSink)],
        }
    }
}

impl AuditLog {
    /// Tracing output plus an extra sink
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        let mut log = Self::default();
        log.sinks.push(sink);
        log
    }

    /// Record an integrity failure
    pub fn integrity_failure(
        &self,
        resource: &ResourceId,
        user: &UserId,
        operation: &'static str,
        error: &dyn std::fmt::Display,
    ) {
        let event = AuditEvent {
            at: Utc::now(),
            resource: resource.clone(),
            user: user.clone(),
            operation,
            error: error.to_string(),
        };
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("sinks", &self.sinks.len()).finish()
    }
}
