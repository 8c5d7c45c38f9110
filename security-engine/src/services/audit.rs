//! Audit sinks for security events.
//!
//! The engine hands every terminal outcome to an [`AuditSink`]. Persistence is
//! the embedding application's concern; the sinks here log through `tracing`
//! or keep events in memory.

use async_trait::async_trait;
use std::sync::Mutex;

use super::error::StoreError;
use crate::models::{SecurityEvent, Severity};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError>;
}

/// Writes each event as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        let subject = event.subject_id.as_deref().unwrap_or("-");
        let ip = event.ip.as_deref().unwrap_or("-");
        let resource = event.resource.as_deref().unwrap_or("-");

        match event.severity {
            Severity::Info => tracing::info!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                subject,
                ip,
                resource,
                risk_score = event.risk_score,
                anomaly_score = event.anomaly_score,
                blocked = event.blocked,
                details = %event.details,
                "Security event"
            ),
            Severity::Warning | Severity::Critical => tracing::warn!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                subject,
                ip,
                resource,
                risk_score = event.risk_score,
                anomaly_score = event.anomaly_score,
                blocked = event.blocked,
                details = %event.details,
                "Security event"
            ),
        }
        Ok(())
    }
}

/// Keeps every event in memory. For tests and local tooling.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("audit buffer poisoned: {}", e)))?
            .push(event.clone());
        Ok(())
    }
}
