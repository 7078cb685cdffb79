//! # edgequake-pdfvision
//!
//! Describe every image embedded in uploaded PDF documents using a Vision
//! Language Model, with at-least-once event delivery and exactly one run per
//! upload.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload ─▶ queue ─▶ dispatcher ─▶ orchestrator
//!                                     │
//!                                     ├─ 1. Extract   PDF → PNG per embedded image (pdfium, spawn_blocking)
//!                                     ├─ 2. Infer ×K  image → description (VLM, bounded fan-out)
//!                                     ├─ 3. Fan-in    wait for all K terminal results
//!                                     └─ 4. Aggregate order by (page, image) → result sink
//! ```
//!
//! Each run moves through `Pending → Extracting → Inferring → Aggregating →
//! Succeeded`, or to `Failed`, and every transition is persisted in the run
//! store. Duplicate deliveries of the same upload event never start a second
//! run while the first is in progress or has succeeded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfvision::{
//!     LocalObjectStore, MemoryRunStore, ModelInferStage, Orchestrator,
//!     PdfExtractStage, PdfiumReader, PipelineConfig, ProviderVisionModel, RunId, StartOutcome,
//!     StoreResultSink, UploadObjectRef,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(PipelineConfig::default());
//!     let objects = Arc::new(LocalObjectStore::new("./data"));
//!     let model = Arc::new(ProviderVisionModel::from_config(&config)?);
//!
//!     let orchestrator = Orchestrator::new(
//!         config.clone(),
//!         Arc::new(MemoryRunStore::new()),
//!         Arc::new(PdfExtractStage::new(objects.clone(), Arc::new(PdfiumReader::new()), &config)),
//!         Arc::new(ModelInferStage::new(objects.clone(), model, config.clone())),
//!         Arc::new(StoreResultSink::new(objects, &config)),
//!     );
//!
//!     let source = UploadObjectRef::pdf("uploads", "report.pdf");
//!     if let StartOutcome::Started(handle) =
//!         orchestrator.start(RunId::new("report.pdf"), source).await?
//!     {
//!         let run = handle.wait().await?;
//!         println!("{} → {}", run.run_id, run.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfvision` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdfvision = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod queue;
pub mod run;
pub mod service;
pub mod sink;
pub mod storage;
pub mod store;
pub mod upload;
pub mod watch;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{FailurePolicy, PipelineConfig, PipelineConfigBuilder, RetryPolicy, RunIdStrategy};
pub use dispatch::{derive_run_id, DispatchOutcome, DispatchReport, Dispatcher};
pub use error::{ImageError, PipelineError, StageError, StorageError};
pub use event::{parse_notification, RunId, UploadEvent, UploadObjectRef};
pub use orchestrator::{aggregate, Orchestrator, RunHandle, StartOutcome};
pub use output::{AggregatedOutput, ImageRef, InferenceResult, PageResults};
pub use pipeline::extract::{ExtractStage, PageImageReader, PdfExtractStage, PdfiumReader, ReadError};
pub use pipeline::infer::{InferStage, ModelInferStage};
pub use pipeline::llm::{
    classify_llm_error, DescribeOptions, Description, ModelError, ProviderVisionModel, VisionModel,
};
pub use pipeline::retry::{run_stage, StageOutcome};
pub use progress::{NoopObserver, PipelineObserver, ProgressObserver};
pub use queue::{EventQueue, MemoryQueue, QueueMessage};
pub use run::{PipelineRun, RunStatus};
pub use service::{Worker, WorkerSummary};
pub use sink::{ResultSink, StoreResultSink};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use store::{BeginOutcome, FileRunStore, MemoryRunStore, RunStore};
pub use upload::{UploadClient, UploadCredential};
pub use watch::InboxWatcher;
