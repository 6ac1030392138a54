//! Triage pipeline
//!
//! Drives each pending event through classify, validate and persist with
//! bounded concurrency. Failures stay with the event that caused them; only
//! a store that cannot be reopened stops the batch early.

mod report;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use config::ConfigError;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::AppConfig;
use crate::error::{OracleError, StoreError};
use crate::models::{SecurityEvent, TriageRecord};
use crate::oracle::{Oracle, RawOracleOutput};
use crate::shutdown::wait_for_shutdown;
use crate::store::RecordSink;
use crate::utils::{truncate_str, LogRateLimiter};
use crate::validator::{self, OracleMode};

pub use report::{BatchReport, BatchSummary, EventOutcome, EventReport};

const TARGET_PIPELINE: &str = "pipeline";

/// Longest slice of rejected oracle output written to the log
const MAX_LOGGED_RAW: usize = 512;

/// Window for collapsing repeated oracle failure warnings
const ORACLE_WARN_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Events in flight at once
    pub concurrency: usize,
    pub oracle_timeout: Duration,
    pub mode: OracleMode,
    /// Extra attempts after `OracleError::Unavailable`
    pub oracle_retries: u32,
    pub retry_backoff: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            concurrency: cfg.pipeline.concurrency,
            oracle_timeout: cfg.oracle_timeout(),
            mode: cfg.oracle_mode()?,
            oracle_retries: cfg.pipeline.oracle_retries,
            retry_backoff: Duration::from_millis(cfg.pipeline.retry_backoff_ms),
        })
    }
}

/// Why an event left the happy path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Oracle,
    Validation,
    Store,
}

/// Per-event lifecycle. Transitions only move forward and end in exactly
/// one of `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Pending,
    Classifying,
    Validating,
    Persisting,
    Done,
    Failed(FailureKind),
}

impl EventState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::Done | EventState::Failed(_))
    }

    pub fn can_advance_to(&self, next: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, next),
            (Pending, Classifying)
                | (Classifying, Validating)
                | (Classifying, Failed(FailureKind::Oracle))
                | (Validating, Persisting)
                | (Validating, Failed(FailureKind::Validation))
                | (Persisting, Done)
                | (Persisting, Failed(FailureKind::Store))
        )
    }
}

struct EventProgress<'a> {
    event_id: &'a str,
    state: EventState,
}

impl<'a> EventProgress<'a> {
    fn new(event_id: &'a str) -> Self {
        Self {
            event_id,
            state: EventState::Pending,
        }
    }

    fn advance(&mut self, next: EventState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(
            target: TARGET_PIPELINE,
            event_id = %self.event_id,
            from = ?self.state,
            to = ?next,
            "Event state"
        );
        self.state = next;
    }
}

pub struct Pipeline {
    oracle: Arc<dyn Oracle>,
    sink: Arc<dyn RecordSink>,
    settings: PipelineSettings,
}

/// State shared by the workers of one batch
struct BatchContext {
    oracle: Arc<dyn Oracle>,
    sink: Arc<dyn RecordSink>,
    settings: PipelineSettings,
    store_down: AtomicBool,
    oracle_warnings: Mutex<LogRateLimiter>,
}

impl Pipeline {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        sink: Arc<dyn RecordSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            oracle,
            sink,
            settings,
        }
    }

    /// Triage `events`, returning one outcome per event in input order.
    ///
    /// Once `shutdown` flips no new events are dispatched; events already in
    /// flight finish normally.
    pub async fn run_batch(
        &self,
        events: Vec<SecurityEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> BatchReport {
        let started_at = Utc::now();
        let total = events.len();
        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        let mut outcomes: Vec<Option<EventOutcome>> = (0..total).map(|_| None).collect();

        info!(
            target: TARGET_PIPELINE,
            events = total,
            concurrency = self.settings.concurrency,
            mode = ?self.settings.mode,
            "Batch started"
        );

        let ctx = Arc::new(BatchContext {
            oracle: Arc::clone(&self.oracle),
            sink: Arc::clone(&self.sink),
            settings: self.settings.clone(),
            store_down: AtomicBool::new(false),
            oracle_warnings: Mutex::new(LogRateLimiter::new(ORACLE_WARN_WINDOW)),
        });
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_events = HashMap::new();
        let mut cancelled = false;

        for (index, event) in events.into_iter().enumerate() {
            if *shutdown.borrow() {
                cancelled = true;
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown.clone()) => {
                    cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // A failed reopen may land while we wait for a permit
            if ctx.store_down.load(Ordering::SeqCst) {
                break;
            }

            let ctx = Arc::clone(&ctx);
            let handle = tasks.spawn(async move {
                let outcome = ctx.process(&event).await;
                drop(permit);
                outcome
            });
            task_events.insert(handle.id(), index);
        }

        if cancelled {
            info!(target: TARGET_PIPELINE, "Shutdown requested, no further events dispatched");
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(err) => {
                    let event_id = task_events
                        .get(&err.id())
                        .map(|&index| event_ids[index].as_str())
                        .unwrap_or_default();
                    error!(
                        target: TARGET_PIPELINE,
                        event_id,
                        error = %err,
                        "Event worker failed"
                    );
                    (err.id(), EventOutcome::WorkerFailed(err.to_string()))
                }
            };
            if let Some(index) = task_events.remove(&id) {
                outcomes[index] = Some(outcome);
            }
        }

        let events = event_ids
            .into_iter()
            .zip(outcomes)
            .map(|(event_id, outcome)| EventReport {
                event_id,
                outcome: outcome.unwrap_or(EventOutcome::NotAttempted),
            })
            .collect();

        let report = BatchReport {
            events,
            store_unavailable: ctx.store_down.load(Ordering::SeqCst),
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            target: TARGET_PIPELINE,
            summary = %report.summary(),
            "Batch finished"
        );
        report
    }
}

impl BatchContext {
    async fn process(&self, event: &SecurityEvent) -> EventOutcome {
        let mut progress = EventProgress::new(&event.event_id);

        progress.advance(EventState::Classifying);
        let raw = match self.classify(event).await {
            Ok(raw) => raw,
            Err(err) => {
                progress.advance(EventState::Failed(FailureKind::Oracle));
                self.log_oracle_failure(event, &err);
                return EventOutcome::OracleFailed(err);
            }
        };

        progress.advance(EventState::Validating);
        let verdict = match validator::validate(&raw, self.settings.mode) {
            Ok(verdict) => verdict,
            Err(err) => {
                progress.advance(EventState::Failed(FailureKind::Validation));
                warn!(
                    target: TARGET_PIPELINE,
                    event_id = %event.event_id,
                    reason = %err.reason,
                    raw = %truncate_str(&err.raw, MAX_LOGGED_RAW),
                    "Oracle output rejected"
                );
                return EventOutcome::ValidationFailed(err);
            }
        };

        progress.advance(EventState::Persisting);
        let record = TriageRecord::new(event, &verdict);
        match self.persist(record).await {
            Ok(sequence) => {
                progress.advance(EventState::Done);
                info!(
                    target: TARGET_PIPELINE,
                    event_id = %event.event_id,
                    rule = %event.rule,
                    threat_level = %verdict.threat_level(),
                    sequence,
                    "Event triaged"
                );
                EventOutcome::Persisted { sequence }
            }
            Err(err) => {
                progress.advance(EventState::Failed(FailureKind::Store));
                error!(
                    target: TARGET_PIPELINE,
                    event_id = %event.event_id,
                    error = %err,
                    "Failed to persist triage record"
                );
                self.recover_store().await;
                EventOutcome::StoreFailed(err)
            }
        }
    }

    /// One oracle call under the configured timeout, retrying only
    /// `Unavailable` up to `oracle_retries` times.
    async fn classify(&self, event: &SecurityEvent) -> Result<RawOracleOutput, OracleError> {
        let timeout = self.settings.oracle_timeout;
        let mut attempt = 0u32;

        loop {
            let result = match tokio::time::timeout(timeout, self.oracle.classify(event)).await {
                Ok(result) => result,
                Err(_) => Err(OracleError::Timeout(timeout)),
            };

            match result {
                Err(OracleError::Unavailable(ref reason))
                    if attempt < self.settings.oracle_retries =>
                {
                    attempt += 1;
                    debug!(
                        target: TARGET_PIPELINE,
                        event_id = %event.event_id,
                        attempt,
                        %reason,
                        "Oracle unavailable, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn persist(&self, record: TriageRecord) -> Result<u64, StoreError> {
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.append(&record))
            .await
            .unwrap_or_else(|err| {
                Err(StoreError::WriteFailed {
                    path: self.sink.path().to_path_buf(),
                    reason: format!("append task failed: {}", err),
                })
            })
    }

    /// After a failed append, try to reacquire the store. A failed reopen
    /// marks the store unavailable for the rest of the batch.
    async fn recover_store(&self) {
        if self.store_down.load(Ordering::SeqCst) {
            return;
        }

        let sink = Arc::clone(&self.sink);
        let reopened = tokio::task::spawn_blocking(move || sink.reopen())
            .await
            .unwrap_or_else(|err| {
                Err(StoreError::WriteFailed {
                    path: self.sink.path().to_path_buf(),
                    reason: format!("reopen task failed: {}", err),
                })
            });

        match reopened {
            Ok(()) => {
                info!(target: TARGET_PIPELINE, "Result store recovered after write failure");
            }
            Err(err) => {
                if !self.store_down.swap(true, Ordering::SeqCst) {
                    error!(
                        target: TARGET_PIPELINE,
                        error = %err,
                        "Result store unavailable, aborting batch"
                    );
                }
            }
        }
    }

    fn log_oracle_failure(&self, event: &SecurityEvent, err: &OracleError) {
        let decision = self
            .oracle_warnings
            .lock()
            .map(|mut limiter| limiter.check(err.kind()))
            .unwrap_or(Some(0));

        match decision {
            Some(suppressed) => warn!(
                target: TARGET_PIPELINE,
                event_id = %event.event_id,
                kind = err.kind(),
                error = %err,
                suppressed,
                "Oracle call failed"
            ),
            None => debug!(
                target: TARGET_PIPELINE,
                event_id = %event.event_id,
                kind = err.kind(),
                error = %err,
                "Oracle call failed"
            ),
        }
    }
}
