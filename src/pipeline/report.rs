//! Batch outcomes and the end-of-run summary.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{OracleError, StoreError, ValidationError};
use crate::utils::elapsed_ms;

/// Terminal result for one event
#[derive(Debug)]
pub enum EventOutcome {
    Persisted { sequence: u64 },
    OracleFailed(OracleError),
    ValidationFailed(ValidationError),
    StoreFailed(StoreError),
    /// Dispatched, but the worker died before reporting. The record may
    /// or may not have been appended.
    WorkerFailed(String),
    /// Never dispatched, because of shutdown or an unavailable store
    NotAttempted,
}

impl EventOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            EventOutcome::Persisted { .. } => "persisted",
            EventOutcome::OracleFailed(OracleError::Unavailable(_)) => "oracle_unavailable",
            EventOutcome::OracleFailed(OracleError::Timeout(_)) => "oracle_timeout",
            EventOutcome::OracleFailed(OracleError::Refused(_)) => "oracle_refused",
            EventOutcome::ValidationFailed(_) => "validation_failed",
            EventOutcome::StoreFailed(_) => "store_failed",
            EventOutcome::WorkerFailed(_) => "worker_failed",
            EventOutcome::NotAttempted => "not_attempted",
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, EventOutcome::Persisted { .. })
    }
}

#[derive(Debug)]
pub struct EventReport {
    pub event_id: String,
    pub outcome: EventOutcome,
}

#[derive(Debug)]
pub struct BatchReport {
    /// One entry per input event, in input order
    pub events: Vec<EventReport>,
    /// The store failed and could not be reopened
    pub store_unavailable: bool,
    /// Dispatch stopped on a shutdown request
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            total: self.events.len(),
            elapsed_ms: elapsed_ms(self.started_at, self.finished_at),
            ..BatchSummary::default()
        };

        for report in &self.events {
            match &report.outcome {
                EventOutcome::Persisted { .. } => summary.persisted += 1,
                EventOutcome::OracleFailed(OracleError::Unavailable(_)) => {
                    summary.oracle_unavailable += 1
                }
                EventOutcome::OracleFailed(OracleError::Timeout(_)) => summary.oracle_timeout += 1,
                EventOutcome::OracleFailed(OracleError::Refused(_)) => summary.oracle_refused += 1,
                EventOutcome::ValidationFailed(_) => summary.validation_failed += 1,
                EventOutcome::StoreFailed(_) => summary.store_failed += 1,
                EventOutcome::WorkerFailed(_) => summary.worker_failed += 1,
                EventOutcome::NotAttempted => summary.not_attempted += 1,
            }
        }
        summary
    }

    pub fn outcome(&self, event_id: &str) -> Option<&EventOutcome> {
        self.events
            .iter()
            .find(|report| report.event_id == event_id)
            .map(|report| &report.outcome)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub persisted: usize,
    pub oracle_unavailable: usize,
    pub oracle_timeout: usize,
    pub oracle_refused: usize,
    pub validation_failed: usize,
    pub store_failed: usize,
    pub worker_failed: usize,
    pub not_attempted: usize,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    pub fn oracle_failed(&self) -> usize {
        self.oracle_unavailable + self.oracle_timeout + self.oracle_refused
    }

    pub fn failed(&self) -> usize {
        self.oracle_failed() + self.validation_failed + self.store_failed + self.worker_failed
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} persisted={} failed={} (oracle_unavailable={} oracle_timeout={} \
             oracle_refused={} validation_failed={} store_failed={} worker_failed={}) \
             not_attempted={} elapsed_ms={}",
            self.total,
            self.persisted,
            self.failed(),
            self.oracle_unavailable,
            self.oracle_timeout,
            self.oracle_refused,
            self.validation_failed,
            self.store_failed,
            self.worker_failed,
            self.not_attempted,
            self.elapsed_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn report(outcomes: Vec<EventOutcome>) -> BatchReport {
        let now = Utc::now();
        BatchReport {
            events: outcomes
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| EventReport {
                    event_id: format!("e{}.json", i),
                    outcome,
                })
                .collect(),
            store_unavailable: false,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_summary_counts_by_kind() {
        let report = report(vec![
            EventOutcome::Persisted { sequence: 0 },
            EventOutcome::Persisted { sequence: 1 },
            EventOutcome::OracleFailed(OracleError::Timeout(Duration::from_secs(60))),
            EventOutcome::OracleFailed(OracleError::Refused("no".into())),
            EventOutcome::ValidationFailed(ValidationError::new("bad", "{}")),
            EventOutcome::WorkerFailed("task panicked".into()),
            EventOutcome::NotAttempted,
        ]);

        let summary = report.summary();
        assert_eq!(summary.total, 7);
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.oracle_timeout, 1);
        assert_eq!(summary.oracle_refused, 1);
        assert_eq!(summary.validation_failed, 1);
        assert_eq!(summary.worker_failed, 1);
        assert_eq!(summary.not_attempted, 1);
        assert_eq!(summary.failed(), 4);
        assert_eq!(summary.elapsed_ms, 0);
    }

    #[test]
    fn test_summary_display() {
        let summary = report(vec![EventOutcome::Persisted { sequence: 0 }]).summary();
        let line = summary.to_string();
        assert!(line.starts_with("total=1 persisted=1 failed=0"));
        assert!(line.contains("not_attempted=0"));
    }

    #[test]
    fn test_outcome_lookup_and_kind() {
        let report = report(vec![
            EventOutcome::Persisted { sequence: 4 },
            EventOutcome::OracleFailed(OracleError::Unavailable("down".into())),
        ]);
        assert!(report.outcome("e0.json").unwrap().is_persisted());
        assert_eq!(report.outcome("e1.json").unwrap().kind(), "oracle_unavailable");
        assert!(report.outcome("missing").is_none());
    }
}
