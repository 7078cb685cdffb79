//! Shared fakes for the integration tests: a PDF reader with a fixed page
//! layout, a scripted Infer stage and a run store that records every
//! persisted transition.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_pdfvision::{
    AggregatedOutput, BeginOutcome, Dispatcher, ImageRef, InferStage, MemoryObjectStore,
    MemoryQueue, MemoryRunStore, ObjectStore, Orchestrator, PageImageReader, PdfExtractStage,
    PipelineConfig, PipelineConfigBuilder, PipelineError, PipelineRun, ReadError, ResultSink,
    RetryPolicy, RunId, RunStatus, RunStore, StageError, StartOutcome, StoreResultSink,
    UploadObjectRef,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Pos = (usize, usize);

// ── PDF reader ───────────────────────────────────────────────────────────────

/// Returns `layout[p]` tiny images for page `p`, or a fixed error.
pub struct LayoutReader {
    layout: Result<Vec<usize>, ReadError>,
    pub reads: AtomicUsize,
}

impl LayoutReader {
    pub fn pages(layout: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            layout: Ok(layout.to_vec()),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn failing(err: ReadError) -> Arc<Self> {
        Arc::new(Self {
            layout: Err(err),
            reads: AtomicUsize::new(0),
        })
    }
}

impl PageImageReader for LayoutReader {
    fn read_images(
        &self,
        _bytes: &[u8],
        _password: Option<&str>,
    ) -> Result<Vec<Vec<DynamicImage>>, ReadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let layout = self.layout.clone()?;
        Ok(layout
            .into_iter()
            .enumerate()
            .map(|(page, n)| {
                (0..n)
                    .map(|i| {
                        DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                            3,
                            3,
                            Rgba([page as u8, i as u8, 0, 255]),
                        ))
                    })
                    .collect()
            })
            .collect())
    }
}

// ── Infer stage ──────────────────────────────────────────────────────────────

/// Infer stage whose latency and failures are scripted per image position.
#[derive(Default)]
pub struct ScriptedInfer {
    delays: HashMap<Pos, Duration>,
    transient_failures: Mutex<HashMap<Pos, u32>>,
    always_fail: HashSet<Pos>,
    rejected: HashSet<Pos>,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub completion_order: Mutex<Vec<Pos>>,
}

impl ScriptedInfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, pos: Pos, ms: u64) -> Self {
        self.delays.insert(pos, Duration::from_millis(ms));
        self
    }

    pub fn delay_all(mut self, positions: &[Pos], ms: u64) -> Self {
        for &p in positions {
            self.delays.insert(p, Duration::from_millis(ms));
        }
        self
    }

    /// Fail with a retryable error `times` times, then succeed.
    pub fn fail_times(self, pos: Pos, times: u32) -> Self {
        self.transient_failures.lock().unwrap().insert(pos, times);
        self
    }

    pub fn always_fail(mut self, pos: Pos) -> Self {
        self.always_fail.insert(pos);
        self
    }

    pub fn reject(mut self, pos: Pos) -> Self {
        self.rejected.insert(pos);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn description(pos: Pos) -> String {
        format!("description of page {} image {}", pos.0, pos.1)
    }
}

#[async_trait]
impl InferStage for ScriptedInfer {
    async fn infer(&self, image: &ImageRef) -> Result<String, StageError> {
        let pos = image.position();
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(d) = self.delays.get(&pos) {
            tokio::time::sleep(*d).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.rejected.contains(&pos) {
            return Err(StageError::Input("model rejected the input".into()));
        }
        if self.always_fail.contains(&pos) {
            return Err(StageError::Retryable("model unavailable".into()));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&pos) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StageError::Retryable("throttled".into()));
                }
            }
        }

        self.completion_order.lock().unwrap().push(pos);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Self::description(pos))
    }
}

// ── Run store ────────────────────────────────────────────────────────────────

/// Memory run store that records each persisted status together with how
/// many images had completed at that moment, and can refuse `begin`.
pub struct RecordingStore {
    inner: MemoryRunStore,
    infer: Option<Arc<ScriptedInfer>>,
    pub history: Mutex<Vec<(RunId, RunStatus, usize)>>,
    refuse_begins: AtomicUsize,
}

impl RecordingStore {
    pub fn new(infer: Option<Arc<ScriptedInfer>>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryRunStore::new(),
            infer,
            history: Mutex::new(Vec::new()),
            refuse_begins: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` calls to `begin` fail.
    pub fn refuse_next_begins(&self, n: usize) {
        self.refuse_begins.store(n, Ordering::SeqCst);
    }

    pub fn statuses(&self, run_id: &str) -> Vec<RunStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id.as_str() == run_id)
            .map(|(_, s, _)| *s)
            .collect()
    }

    fn record(&self, run: &PipelineRun) {
        let completed = self
            .infer
            .as_ref()
            .map(|i| i.completed.load(Ordering::SeqCst))
            .unwrap_or(0);
        self.history
            .lock()
            .unwrap()
            .push((run.run_id.clone(), run.status, completed));
    }
}

#[async_trait]
impl RunStore for RecordingStore {
    async fn begin(&self, run: PipelineRun) -> Result<BeginOutcome, PipelineError> {
        let refused = self
            .refuse_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PipelineError::RunStore("run table unavailable".into()));
        }
        let outcome = self.inner.begin(run).await?;
        if let BeginOutcome::Started(ref r) = outcome {
            self.record(r);
        }
        Ok(outcome)
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<PipelineRun>, PipelineError> {
        self.inner.get(run_id).await
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        self.inner.update(run).await?;
        self.record(run);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        self.inner.list().await
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

/// Route library logs through the test harness. `RUST_LOG=debug` shows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with millisecond backoffs so retry paths finish quickly.
pub fn fast_config() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .extract_retry(RetryPolicy::new(2, 1, 5))
        .infer_retry(RetryPolicy::new(3, 1, 5))
        .sink_retry(RetryPolicy::new(2, 1, 5))
        .infer_timeout_secs(5)
        .extract_timeout_secs(5)
        .sink_timeout_secs(5)
        .poll_interval_ms(5)
}

/// Result sink whose writes always fail with a retryable error.
#[derive(Default)]
pub struct FailingSink {
    pub puts: AtomicUsize,
}

#[async_trait]
impl ResultSink for FailingSink {
    async fn put(&self, _run_id: &RunId, _output: &AggregatedOutput) -> Result<(), StageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Err(StageError::Retryable("results bucket unavailable".into()))
    }

    async fn put_failure(&self, _run: &PipelineRun) -> Result<(), StageError> {
        Err(StageError::Retryable("results bucket unavailable".into()))
    }
}

pub struct Harness {
    pub config: Arc<PipelineConfig>,
    pub objects: Arc<MemoryObjectStore>,
    pub runs: Arc<RecordingStore>,
    pub reader: Arc<LayoutReader>,
    pub infer: Arc<ScriptedInfer>,
    pub sink: Arc<StoreResultSink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(config: PipelineConfig, reader: Arc<LayoutReader>, infer: ScriptedInfer) -> Self {
        Self::build(config, reader, infer, None)
    }

    /// Same as [`Harness::new`] but results go to `sink` instead of the
    /// object store.
    pub fn with_sink(
        config: PipelineConfig,
        reader: Arc<LayoutReader>,
        infer: ScriptedInfer,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self::build(config, reader, infer, Some(sink))
    }

    fn build(
        config: PipelineConfig,
        reader: Arc<LayoutReader>,
        infer: ScriptedInfer,
        custom_sink: Option<Arc<dyn ResultSink>>,
    ) -> Self {
        init_tracing();
        let config = Arc::new(config);
        let objects = Arc::new(MemoryObjectStore::new());
        let infer = Arc::new(infer);
        let runs = RecordingStore::new(Some(Arc::clone(&infer)));
        let sink = Arc::new(StoreResultSink::new(objects.clone(), &config));
        let active_sink: Arc<dyn ResultSink> = match custom_sink {
            Some(s) => s,
            None => sink.clone(),
        };

        let orchestrator = Orchestrator::new(
            Arc::clone(&config),
            runs.clone(),
            Arc::new(PdfExtractStage::new(objects.clone(), reader.clone(), &config)),
            infer.clone(),
            active_sink,
        );

        Self {
            config,
            objects,
            runs,
            reader,
            infer,
            sink,
            orchestrator,
        }
    }

    /// Put a fake PDF into the upload bucket and return its reference.
    pub async fn upload(&self, key: &str) -> UploadObjectRef {
        self.objects
            .put(&self.config.upload_bucket, key, b"%PDF-1.7 test".to_vec())
            .await
            .unwrap();
        UploadObjectRef::pdf(self.config.upload_bucket.clone(), key)
    }

    /// Start a run for `key` and wait for it to finish.
    pub async fn run_to_end(&self, key: &str) -> PipelineRun {
        let source = self.upload(key).await;
        match self.orchestrator.start(RunId::new(key), source).await.unwrap() {
            StartOutcome::Started(handle) => handle.wait().await.unwrap(),
            StartOutcome::Duplicate(run) => panic!("unexpected duplicate of {}", run.run_id),
        }
    }

    pub async fn output(&self, run_id: &str) -> Option<AggregatedOutput> {
        self.sink.load(&RunId::new(run_id)).await.unwrap()
    }

    pub fn dispatcher(&self, queue: Arc<MemoryQueue>) -> Dispatcher {
        Dispatcher::new(self.orchestrator.clone(), queue)
    }
}
