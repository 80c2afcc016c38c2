//! Observability
//!
//! Structured events for every fallback, every invalidation batch and every
//! failed phase verdict. The event schema downstream is owned by the sink;
//! the default sink forwards to `tracing`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Engine operation an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Prune,
    DependencyInference,
    InvalidationBatch,
    PhaseValidation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prune => "prune",
            Self::DependencyInference => "dependency_inference",
            Self::InvalidationBatch => "invalidation_batch",
            Self::PhaseValidation => "phase_validation",
        }
    }
}

/// Outcome recorded with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Committed,
    Fallback,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Fallback => "fallback",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    pub subject_id: Option<Uuid>,
    pub operation: Operation,
    pub status: EventStatus,
    pub duration: Duration,
    /// Free-form context (error text, phase name, reopened count)
    pub detail: String,
}

impl EngineEvent {
    pub fn new(
        subject_id: Option<Uuid>,
        operation: Operation,
        status: EventStatus,
        duration: Duration,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            subject_id,
            operation,
            status,
            duration,
            detail: detail.into(),
        }
    }
}

pub trait ObservabilitySink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Default sink: one `tracing` record per event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        let subject_id = event.subject_id.map(|id| id.to_string()).unwrap_or_default();
        let duration_ms = event.duration.as_millis() as u64;
        match event.status {
            EventStatus::Committed => info!(
                subject_id = %subject_id,
                operation = event.operation.as_str(),
                status = event.status.as_str(),
                duration_ms,
                detail = %event.detail,
                "engine event"
            ),
            EventStatus::Fallback | EventStatus::Failed => warn!(
                subject_id = %subject_id,
                operation = event.operation.as_str(),
                status = event.status.as_str(),
                duration_ms,
                detail = %event.detail,
                "engine event"
            ),
        }
    }
}

/// Keeps events in memory, for embedding hosts that batch-export and for tests
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, operation: Operation, status: EventStatus) -> usize {
        self.events()
            .iter()
            .filter(|e| e.operation == operation && e.status == status)
            .count()
    }
}

impl ObservabilitySink for MemorySink {
    fn emit(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Fallback counters kept for observability
#[derive(Debug, Default)]
pub struct FallbackCounters {
    pruning: AtomicU64,
    dependency_inference: AtomicU64,
}

/// Point-in-time copy of [`FallbackCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub pruning: u64,
    pub dependency_inference: u64,
}

impl FallbackCounters {
    pub fn record(&self, operation: Operation) {
        match operation {
            Operation::Prune => {
                self.pruning.fetch_add(1, Ordering::Relaxed);
            }
            Operation::DependencyInference => {
                self.dependency_inference.fetch_add(1, Ordering::Relaxed);
            }
            Operation::InvalidationBatch | Operation::PhaseValidation => {}
        }
    }

    pub fn snapshot(&self) -> FallbackStats {
        FallbackStats {
            pruning: self.pruning.load(Ordering::Relaxed),
            dependency_inference: self.dependency_inference.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts_by_operation_and_status() {
        let sink = MemorySink::new();
        sink.emit(EngineEvent::new(
            None,
            Operation::Prune,
            EventStatus::Fallback,
            Duration::from_millis(5),
            "timeout",
        ));
        sink.emit(EngineEvent::new(
            Some(Uuid::new_v4()),
            Operation::InvalidationBatch,
            EventStatus::Committed,
            Duration::ZERO,
            "2 reopened",
        ));
        assert_eq!(sink.count(Operation::Prune, EventStatus::Fallback), 1);
        assert_eq!(sink.count(Operation::Prune, EventStatus::Committed), 0);
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn test_fallback_counters() {
        let counters = FallbackCounters::default();
        counters.record(Operation::Prune);
        counters.record(Operation::Prune);
        counters.record(Operation::DependencyInference);
        counters.record(Operation::PhaseValidation);
        assert_eq!(
            counters.snapshot(),
            FallbackStats {
                pruning: 2,
                dependency_inference: 1
            }
        );
    }
}
