//! Dispatcher: queue message → run start, with acknowledgement decisions.
//!
//! A message is acknowledged only when every record in it was started,
//! recognised as a duplicate, skipped by the suffix filter, or rejected as
//! malformed. If starting any record fails the message stays in flight and
//! the queue redelivers it after the visibility timeout; records that did
//! start are then recognised as duplicates.
//!
//! With run slots attached ([`Dispatcher::with_run_slots`]) every record
//! waits for a free slot before it is started, and a started run keeps its
//! slot until it is terminal.

use crate::config::{PipelineConfig, RunIdStrategy};
use crate::error::PipelineError;
use crate::event::{parse_notification, RunId, UploadEvent};
use crate::orchestrator::{Orchestrator, RunHandle, StartOutcome};
use crate::queue::{EventQueue, QueueMessage};
use crate::run::PipelineRun;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Error recorded on runs found non-terminal when a worker starts.
pub const INTERRUPTED: &str = "interrupted before completion";

/// What happened to one record of a message.
#[derive(Debug)]
pub enum DispatchOutcome {
    Started(RunHandle),
    /// A run with the same id is in progress or has succeeded.
    Duplicate(PipelineRun),
    /// The key does not match the suffix filter.
    Skipped { key: String },
    /// The payload could not be parsed; never retried.
    Malformed(String),
}

/// Everything the dispatcher did with one message.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DispatchOutcome>,
    /// Set when starting a record failed; the message must not be acked.
    pub failure: Option<PipelineError>,
}

impl DispatchReport {
    pub fn should_ack(&self) -> bool {
        self.failure.is_none()
    }

    pub fn started(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Started(_)))
            .count()
    }

    /// Consume the report, keeping the handles of started runs.
    pub fn into_handles(self) -> Vec<RunHandle> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o {
                DispatchOutcome::Started(h) => Some(h),
                _ => None,
            })
            .collect()
    }
}

/// Derive the run id for an upload event.
pub fn derive_run_id(event: &UploadEvent, strategy: RunIdStrategy) -> RunId {
    RunId::derive(event, strategy)
}

pub struct Dispatcher {
    orchestrator: Orchestrator,
    queue: Arc<dyn EventQueue>,
    run_slots: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator, queue: Arc<dyn EventQueue>) -> Self {
        Self {
            orchestrator,
            queue,
            run_slots: None,
        }
    }

    /// Bound the runs this dispatcher has executing at once by `slots`.
    pub fn with_run_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.run_slots = Some(slots);
        self
    }

    pub fn queue(&self) -> &Arc<dyn EventQueue> {
        &self.queue
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        self.orchestrator.config()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Parse `message` and start a run for every accepted record, in order.
    pub async fn dispatch(&self, message: &QueueMessage) -> DispatchReport {
        let mut report = DispatchReport::default();

        let events = match parse_notification(&message.body) {
            Ok(events) => events,
            Err(e) => {
                warn!("Message {}: {}; dropping", message.message_id, e);
                report.outcomes.push(DispatchOutcome::Malformed(e.to_string()));
                return report;
            }
        };

        let config = self.config();
        for event in events {
            if !config.accepts_key(&event.key) {
                debug!(
                    "Message {}: skipping '{}' (suffix filter '{}')",
                    message.message_id, event.key, config.suffix_filter
                );
                report.outcomes.push(DispatchOutcome::Skipped { key: event.key });
                continue;
            }

            let run_id = derive_run_id(&event, config.run_id_strategy);
            let started = async {
                let permit = self.acquire_slot().await?;
                self.orchestrator
                    .start_with_permit(run_id.clone(), event.object_ref(), permit)
                    .await
            }
            .await;
            match started {
                Ok(StartOutcome::Started(handle)) => {
                    report.outcomes.push(DispatchOutcome::Started(handle));
                }
                Ok(StartOutcome::Duplicate(existing)) => {
                    report.outcomes.push(DispatchOutcome::Duplicate(existing));
                }
                Err(e) => {
                    warn!(
                        "Message {}: could not start run '{}': {}",
                        message.message_id, run_id, e
                    );
                    report.failure = Some(e);
                    break;
                }
            }
        }
        report
    }

    /// Fail every run a previous process left non-terminal, then start each
    /// one again. Must run before this process starts runs of its own.
    pub async fn recover_interrupted(&self) -> Result<Vec<RunHandle>, PipelineError> {
        let interrupted = self
            .orchestrator
            .run_store()
            .fail_interrupted(INTERRUPTED)
            .await?;

        let mut handles = Vec::new();
        for run in interrupted {
            warn!(
                "Run '{}' was interrupted during attempt {}; restarting",
                run.run_id, run.attempt
            );
            let permit = self.acquire_slot().await?;
            match self
                .orchestrator
                .start_with_permit(run.run_id, run.source, permit)
                .await?
            {
                StartOutcome::Started(handle) => handles.push(handle),
                StartOutcome::Duplicate(existing) => {
                    debug!("Run '{}' already {}", existing.run_id, existing.status)
                }
            }
        }
        Ok(handles)
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, PipelineError> {
        match &self.run_slots {
            Some(slots) => Arc::clone(slots)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| PipelineError::Internal("run slots closed".into())),
            None => Ok(None),
        }
    }

    /// Dispatch `message`, then acknowledge it if every record was handled.
    ///
    /// Errors only when the queue itself fails.
    pub async fn handle(&self, message: QueueMessage) -> Result<DispatchReport, PipelineError> {
        let report = self.dispatch(&message).await;

        if report.should_ack() {
            if !self.queue.ack(&message.receipt).await? {
                warn!(
                    "Message {}: receipt expired before ack; it will be redelivered",
                    message.message_id
                );
            }
        } else {
            info!(
                "Message {} left unacknowledged for redelivery (delivery {})",
                message.message_id, message.receive_count
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn run_id_strategies() {
        let event = UploadEvent::new(
            "uploads",
            "doc1.pdf",
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        );
        assert_eq!(derive_run_id(&event, RunIdStrategy::ObjectKey).as_str(), "doc1.pdf");
        assert_ne!(
            derive_run_id(&event, RunIdStrategy::KeyAndEventTime),
            derive_run_id(&event, RunIdStrategy::ObjectKey)
        );
    }

    #[test]
    fn report_without_failure_is_acked() {
        let mut report = DispatchReport::default();
        report.outcomes.push(DispatchOutcome::Malformed("x".into()));
        report.outcomes.push(DispatchOutcome::Skipped { key: "a.txt".into() });
        assert!(report.should_ack());
        assert_eq!(report.started(), 0);

        report.failure = Some(PipelineError::RunStore("disk full".into()));
        assert!(!report.should_ack());
    }
}
