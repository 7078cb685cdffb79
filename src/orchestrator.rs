//! Per-run state machine: Extract → fan-out Infer → fan-in → Aggregate.
//!
//! ## States
//!
//! ```text
//! Pending ──▶ Extracting ──▶ Inferring ──▶ Aggregating ──▶ Succeeded
//!                 │  └──(0 images)─────────────────────────▲
//!                 ▼              ▼               ▼
//!               Failed         Failed          Failed
//! ```
//!
//! Every transition is validated by [`RunStatus::can_transition_to`] and
//! persisted to the run store before the next stage starts, so the store
//! always shows where a run is.
//!
//! ## Fan-out / fan-in
//!
//! Each `ImageRef` becomes its own task, gated by a per-run semaphore of
//! `infer_concurrency` permits. Tasks report one [`InferenceResult`] each on
//! an mpsc channel; the fan-in loop waits for exactly K of them. Arrival
//! order is irrelevant: aggregation sorts by (page, image).

use crate::config::{FailurePolicy, PipelineConfig};
use crate::error::{ImageError, PipelineError, StageError};
use crate::event::{RunId, UploadObjectRef};
use crate::output::{AggregatedOutput, ImageRef, InferenceResult};
use crate::pipeline::extract::ExtractStage;
use crate::pipeline::infer::InferStage;
use crate::pipeline::retry::{run_stage, StageOutcome};
use crate::progress::PipelineObserver;
use crate::run::{PipelineRun, RunStatus};
use crate::sink::ResultSink;
use crate::store::{BeginOutcome, RunStore};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Result of [`Orchestrator::start`].
#[derive(Debug)]
pub enum StartOutcome {
    /// A Pending record was persisted and the run is executing.
    Started(RunHandle),
    /// A non-terminal or succeeded run already owns the id.
    Duplicate(PipelineRun),
}

/// Handle to a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    join: JoinHandle<PipelineRun>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<PipelineRun, PipelineError> {
        self.join
            .await
            .map_err(|e| PipelineError::Internal(format!("run '{}' task failed: {e}", self.run_id)))
    }
}

/// Drives runs through their states.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    store: Arc<dyn RunStore>,
    extract: Arc<dyn ExtractStage>,
    infer: Arc<dyn InferStage>,
    sink: Arc<dyn ResultSink>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn RunStore>,
        extract: Arc<dyn ExtractStage>,
        infer: Arc<dyn InferStage>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            store,
            extract,
            infer,
            sink,
        }
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    pub fn run_store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Persist a Pending run and spawn its execution.
    ///
    /// Returns once the Pending record is durable. Fails only when the run
    /// store does; the caller may then retry the same event.
    pub async fn start(
        &self,
        run_id: RunId,
        source: UploadObjectRef,
    ) -> Result<StartOutcome, PipelineError> {
        self.start_with_permit(run_id, source, None).await
    }

    /// Like [`Orchestrator::start`], but a started run holds `permit` until
    /// it is terminal. A duplicate releases it at once.
    pub async fn start_with_permit(
        &self,
        run_id: RunId,
        source: UploadObjectRef,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<StartOutcome, PipelineError> {
        let run = PipelineRun::new(run_id, source);
        match self.store.begin(run).await? {
            BeginOutcome::AlreadyExists(existing) => {
                info!(
                    "Run '{}' already {}; ignoring duplicate",
                    existing.run_id, existing.status
                );
                Ok(StartOutcome::Duplicate(existing))
            }
            BeginOutcome::Started(run) => {
                info!(
                    "Run '{}' pending (attempt {}) for {}",
                    run.run_id, run.attempt, run.source
                );
                let run_id = run.run_id.clone();
                let this = self.clone();
                let join = tokio::spawn(async move {
                    let _permit = permit;
                    this.execute(run).await
                });
                Ok(StartOutcome::Started(RunHandle { run_id, join }))
            }
        }
    }

    /// Drive `run` from Pending to a terminal state and return it.
    pub async fn execute(&self, mut run: PipelineRun) -> PipelineRun {
        if let Err(e) = self.drive(&mut run).await {
            error!("Run '{}': internal error: {}", run.run_id, e);
            if !run.is_terminal() && run.fail(format!("internal error: {e}")).is_ok() {
                if let Err(e) = self.store.update(&run).await {
                    error!("Run '{}': could not persist failure: {}", run.run_id, e);
                }
                self.notify(|o| o.on_run_complete(&run));
            }
        }
        run
    }

    async fn drive(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        let cfg = Arc::clone(&self.config);
        let run_id = run.run_id.clone();
        let source = run.source.clone();

        // ── Extract ──────────────────────────────────────────────────────
        self.advance(run, RunStatus::Extracting).await?;
        self.notify(|o| o.on_run_start(run_id.as_str()));

        let outcome = run_stage(
            &format!("{run_id}: extract"),
            &cfg.extract_retry,
            cfg.extract_timeout(),
            |_| {
                let stage = Arc::clone(&self.extract);
                let run_id = run_id.clone();
                let source = source.clone();
                async move { stage.extract(&run_id, &source).await }
            },
        )
        .await;

        let images = match outcome {
            StageOutcome::Success { value, .. } => value,
            StageOutcome::Failed { error, .. } => {
                return self.fail_run(run, format!("extract: {}", error.detail())).await;
            }
        };

        run.image_count = Some(images.len());
        self.notify(|o| o.on_extracted(run_id.as_str(), images.len()));

        if images.is_empty() {
            info!("Run '{}': no embedded images", run_id);
            let output = aggregate(run_id.clone(), source.clone(), Vec::new());
            return self.finish(run, output).await;
        }

        // ── Infer ────────────────────────────────────────────────────────
        self.advance(run, RunStatus::Inferring).await?;
        let results = match self.fan_out(&run_id, images).await {
            FanIn::Complete(results) => results,
            FanIn::Aborted(detail) => return self.fail_run(run, detail).await,
        };

        // ── Aggregate ────────────────────────────────────────────────────
        self.advance(run, RunStatus::Aggregating).await?;
        let output = aggregate(run_id, source, results);
        self.finish(run, output).await
    }

    /// Schedule one Infer task per image and wait for every result.
    async fn fan_out(&self, run_id: &RunId, images: Vec<ImageRef>) -> FanIn {
        let expected = images.len();
        let semaphore = Arc::new(Semaphore::new(self.config.infer_concurrency));
        let (tx, mut rx) = mpsc::channel::<InferenceResult>(expected);
        let mut tasks = JoinSet::new();

        for image in images {
            let semaphore = Arc::clone(&semaphore);
            let stage = Arc::clone(&self.infer);
            let config = Arc::clone(&self.config);
            let tx = tx.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = infer_one(stage, &config, image).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);
        debug!("Run '{}': {} infer task(s) scheduled", run_id, expected);

        let mut results = Vec::with_capacity(expected);
        while results.len() < expected {
            let Some(result) = rx.recv().await else {
                break;
            };
            let (page, image) = result.image.position();
            match &result.error {
                None => {
                    self.notify(|o| {
                        o.on_image_complete(run_id.as_str(), page, image, result.description.len())
                    });
                }
                Some(err) => {
                    warn!("Run '{}': {}", run_id, err);
                    self.notify(|o| o.on_image_error(run_id.as_str(), page, image, &err.to_string()));
                    if self.config.failure_policy == FailurePolicy::AbortOnImageFailure {
                        tasks.abort_all();
                        return FanIn::Aborted(format!("image failure aborted the run: {err}"));
                    }
                }
            }
            results.push(result);
        }

        if results.len() < expected {
            return FanIn::Aborted(format!(
                "{} of {} infer task(s) ended without a result",
                expected - results.len(),
                expected
            ));
        }
        FanIn::Complete(results)
    }

    /// Write the output and move to Succeeded, or to Failed when the sink
    /// exhausts its retries.
    async fn finish(
        &self,
        run: &mut PipelineRun,
        output: AggregatedOutput,
    ) -> Result<(), PipelineError> {
        let cfg = Arc::clone(&self.config);
        let run_id = run.run_id.clone();
        let output = Arc::new(output);

        let outcome = run_stage(
            &format!("{run_id}: write output"),
            &cfg.sink_retry,
            cfg.sink_timeout(),
            |_| {
                let sink = Arc::clone(&self.sink);
                let run_id = run_id.clone();
                let output = Arc::clone(&output);
                async move { sink.put(&run_id, &output).await }
            },
        )
        .await;

        if let StageOutcome::Failed { error, .. } = outcome {
            return self
                .fail_run(run, format!("result sink: {}", error.detail()))
                .await;
        }

        self.advance(run, RunStatus::Succeeded).await?;
        info!(
            "Run '{}' succeeded: {} image(s), {} failed",
            run_id, output.image_count, output.failed_count
        );
        self.notify(|o| o.on_run_complete(run));
        Ok(())
    }

    async fn fail_run(
        &self,
        run: &mut PipelineRun,
        detail: String,
    ) -> Result<(), PipelineError> {
        error!("Run '{}' failed: {}", run.run_id, detail);
        run.fail(detail)?;
        self.store.update(run).await?;

        if self.config.record_failures {
            let record = Arc::new(run.clone());
            let outcome = run_stage(
                &format!("{}: write failure record", run.run_id),
                &self.config.sink_retry,
                self.config.sink_timeout(),
                |_| {
                    let sink = Arc::clone(&self.sink);
                    let record = Arc::clone(&record);
                    async move { sink.put_failure(&record).await }
                },
            )
            .await;
            if let StageOutcome::Failed { error, .. } = outcome {
                warn!("Run '{}': failure record not written: {}", run.run_id, error);
            }
        }

        self.notify(|o| o.on_run_complete(run));
        Ok(())
    }

    async fn advance(&self, run: &mut PipelineRun, next: RunStatus) -> Result<(), PipelineError> {
        let from = run.status;
        run.transition(next)?;
        self.store.update(run).await?;
        info!("Run '{}': {} → {}", run.run_id, from, next);
        Ok(())
    }

    fn notify(&self, f: impl FnOnce(&dyn PipelineObserver)) {
        if let Some(observer) = &self.config.progress {
            f(observer.as_ref());
        }
    }
}

enum FanIn {
    Complete(Vec<InferenceResult>),
    Aborted(String),
}

/// Run the Infer stage for one image under the retry policy and turn the
/// outcome into a terminal per-image result.
async fn infer_one(
    stage: Arc<dyn InferStage>,
    config: &PipelineConfig,
    image: ImageRef,
) -> InferenceResult {
    let label = format!(
        "{}: page {} image {}",
        image.run_id, image.page_index, image.image_index
    );
    let outcome = run_stage(&label, &config.infer_retry, config.infer_timeout(), |_| {
        let stage = Arc::clone(&stage);
        let image = image.clone();
        async move { stage.infer(&image).await }
    })
    .await;

    match outcome {
        StageOutcome::Success {
            value,
            attempts,
            duration_ms,
        } => InferenceResult {
            image,
            description: value,
            error: None,
            attempts,
            duration_ms,
        },
        StageOutcome::Failed {
            error,
            attempts,
            timed_out,
            duration_ms,
        } => {
            let error = image_error(&image, &error, attempts, timed_out, config);
            InferenceResult {
                image,
                description: String::new(),
                error: Some(error),
                attempts,
                duration_ms,
            }
        }
    }
}

fn image_error(
    image: &ImageRef,
    error: &StageError,
    attempts: u32,
    timed_out: bool,
    config: &PipelineConfig,
) -> ImageError {
    let (page, img) = image.position();
    match error {
        _ if timed_out => ImageError::Timeout {
            page,
            image: img,
            secs: config.infer_timeout_secs,
        },
        StageError::Input(detail) => ImageError::Rejected {
            page,
            image: img,
            detail: detail.clone(),
        },
        StageError::Retryable(detail) | StageError::Fatal(detail) => ImageError::Failed {
            page,
            image: img,
            attempts,
            detail: detail.clone(),
        },
    }
}

/// Build the document-level output from terminal per-image results.
pub fn aggregate(
    run_id: RunId,
    source: UploadObjectRef,
    results: Vec<InferenceResult>,
) -> AggregatedOutput {
    AggregatedOutput::build(run_id, source, results)
}
