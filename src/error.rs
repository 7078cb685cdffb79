//! Error types for the edgequake-pdfvision library.
//!
//! Three layers of failure exist, and each gets its own type:
//!
//! * [`PipelineError`]: **Fatal** for the caller: configuration is invalid,
//!   a store cannot be reached, the upload protocol was rejected. Returned as
//!   `Err(PipelineError)` from public entry points.
//!
//! * [`StageError`]: the classification a stage hands back to the
//!   orchestrator. Stages never leak raw I/O, pdfium or HTTP errors; they map
//!   them into `Retryable`, `Input` or `Fatal` at their own boundary so the
//!   state machine only reasons about outcomes.
//!
//! * [`ImageError`]: **Non-fatal**: a single image could not be described.
//!   Stored inside [`crate::output::InferenceResult`] so a run can succeed
//!   with partial results.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdfvision library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Event errors ──────────────────────────────────────────────────────
    /// A queue message body is not an object-creation notification.
    #[error("Malformed upload event: {0}")]
    MalformedEvent(String),

    // ── Storage errors ────────────────────────────────────────────────────
    /// Object storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The run-status table could not be read or written.
    #[error("Run store error: {0}")]
    RunStore(String),

    /// Could not persist a run table or result file.
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Orchestration errors ──────────────────────────────────────────────
    /// A run tried to move between two states that are not connected.
    #[error("Illegal transition for run '{run_id}': {from} → {to}")]
    IllegalTransition {
        run_id: String,
        from: String,
        to: String,
    },

    /// No run with the given id exists.
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// The event queue rejected an operation.
    #[error("Queue error: {0}")]
    Queue(String),

    // ── Upload protocol errors ────────────────────────────────────────────
    /// The credential issuer answered with a non-2xx status.
    #[error("{message}")]
    CredentialRejected { status: u16, message: String },

    /// The direct upload to storage answered with a non-2xx status.
    #[error("Failed to upload file")]
    UploadFailed { status: u16 },

    /// Transport-level HTTP failure.
    #[error("HTTP request to '{url}' failed: {reason}")]
    Http { url: String, reason: String },

    // ── Provider errors ───────────────────────────────────────────────────
    /// The requested LLM provider could not be created.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by an [`crate::storage::ObjectStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The object does not exist.
    #[error("Object '{bucket}/{key}' not found")]
    NotFound { bucket: String, key: String },

    /// The key would escape the bucket or is otherwise unusable.
    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Storage is temporarily unreachable; the caller may retry.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Any other I/O failure.
    #[error("Storage I/O error on '{key}': {detail}")]
    Io { key: String, detail: String },
}

impl StorageError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Io { .. })
    }
}

/// How a stage invocation failed, as seen by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Timeout, throttling, temporary unavailability. Retried with backoff.
    #[error("transient failure: {0}")]
    Retryable(String),

    /// Corrupt PDF, unreadable image, model rejection. Never retried.
    #[error("input rejected: {0}")]
    Input(String),

    /// Retry budget exhausted or unrecoverable failure.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Retryable(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            StageError::Retryable(d) | StageError::Input(d) | StageError::Fatal(d) => d,
        }
    }
}

impl From<StorageError> for StageError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } | StorageError::InvalidKey { .. } => {
                StageError::Input(e.to_string())
            }
            StorageError::Unavailable(_) | StorageError::Io { .. } => {
                StageError::Retryable(e.to_string())
            }
        }
    }
}

/// A non-fatal error for a single image.
///
/// The run continues unless the abort-on-image-failure policy is active.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ImageError {
    /// The model call kept failing until the retry budget ran out.
    #[error("page {page} image {image}: failed after {attempts} attempts: {detail}")]
    Failed {
        page: usize,
        image: usize,
        attempts: u32,
        detail: String,
    },

    /// The image or the model rejected the request; not retried.
    #[error("page {page} image {image}: rejected: {detail}")]
    Rejected {
        page: usize,
        image: usize,
        detail: String,
    },

    /// The last attempt timed out.
    #[error("page {page} image {image}: timed out after {secs}s")]
    Timeout { page: usize, image: usize, secs: u64 },
}
