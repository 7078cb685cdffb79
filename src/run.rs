//! Pipeline runs and their state machine.
//!
//! ```text
//!  Pending ──▶ Extracting ──▶ Inferring ──▶ Aggregating ──▶ Succeeded
//!                  │  │            │              │
//!                  │  └──(no images)────────────────────────▶ Succeeded
//!                  └────────────┴──────────────┴───────────▶ Failed
//! ```
//!
//! The legal edges are encoded once in [`RunStatus::can_transition_to`]; the
//! orchestrator goes through [`PipelineRun::transition`] for every move so an
//! impossible sequence surfaces as an error instead of a corrupt record.

use crate::error::PipelineError;
use crate::event::{RunId, UploadObjectRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a [`PipelineRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Extracting,
    Inferring,
    Aggregating,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    /// Whether a dispatcher seeing this status must not start another run.
    pub fn blocks_new_run(self) -> bool {
        self != RunStatus::Failed
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Pending, Failed)
                | (Extracting, Inferring)
                | (Extracting, Succeeded)
                | (Extracting, Failed)
                | (Inferring, Aggregating)
                | (Inferring, Failed)
                | (Aggregating, Succeeded)
                | (Aggregating, Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Extracting => "extracting",
            RunStatus::Inferring => "inferring",
            RunStatus::Aggregating => "aggregating",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One execution of the pipeline for one uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub source: UploadObjectRef,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of images found by the Extract stage, once known.
    pub image_count: Option<usize>,
    /// 1 for the first run under this id; incremented when a failed run is restarted.
    pub attempt: u32,
}

impl PipelineRun {
    /// A fresh run in `Pending`.
    pub fn new(run_id: RunId, source: UploadObjectRef) -> Self {
        Self {
            run_id,
            source,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            image_count: None,
            attempt: 1,
        }
    }

    /// Move to `next`, stamping `ended_at` on terminal states.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                run_id: self.run_id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to `Failed` with an error detail.
    pub fn fail(&mut self, detail: impl Into<String>) -> Result<(), PipelineError> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(detail.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, if the run has ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> PipelineRun {
        PipelineRun::new(RunId::new("doc1.pdf"), UploadObjectRef::pdf("uploads", "doc1.pdf"))
    }

    #[test]
    fn happy_path_transitions() {
        let mut r = run();
        for next in [
            RunStatus::Extracting,
            RunStatus::Inferring,
            RunStatus::Aggregating,
            RunStatus::Succeeded,
        ] {
            r.transition(next).expect("legal edge");
        }
        assert!(r.is_terminal());
        assert!(r.ended_at.is_some());
        assert!(r.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn empty_document_skips_inferring() {
        let mut r = run();
        r.transition(RunStatus::Extracting).unwrap();
        r.transition(RunStatus::Succeeded).unwrap();
    }

    #[test]
    fn terminal_states_are_final() {
        let mut r = run();
        r.transition(RunStatus::Extracting).unwrap();
        r.fail("corrupt pdf").unwrap();
        assert_eq!(r.error.as_deref(), Some("corrupt pdf"));
        let err = r.transition(RunStatus::Inferring).unwrap_err();
        assert!(err.to_string().contains("failed → inferring"), "got: {err}");
    }

    #[test]
    fn pending_cannot_jump_to_aggregating() {
        let mut r = run();
        assert!(r.transition(RunStatus::Aggregating).is_err());
        assert_eq!(r.status, RunStatus::Pending);
    }

    #[test]
    fn only_failed_allows_restart() {
        assert!(!RunStatus::Failed.blocks_new_run());
        assert!(RunStatus::Succeeded.blocks_new_run());
        assert!(RunStatus::Inferring.blocks_new_run());
    }
}
