//! Configuration types for the image-description pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. One struct is shared (behind an `Arc`) by the
//! dispatcher, the orchestrator and every stage, so a run can always be
//! explained by the config it ran with.

use crate::error::PipelineError;
use crate::progress::ProgressObserver;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the pipeline.
///
/// # Example
/// ```rust
/// use edgequake_pdfvision::{FailurePolicy, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .infer_concurrency(4)
///     .failure_policy(FailurePolicy::AbortOnImageFailure)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.infer_concurrency, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Storage layout ───────────────────────────────────────────────────
    /// Bucket that receives uploaded PDFs. Default: "uploads".
    pub upload_bucket: String,

    /// Bucket that receives extracted images. Default: "images".
    pub image_bucket: String,

    /// Bucket that receives aggregated outputs. Default: "results".
    pub result_bucket: String,

    /// Key prefix for aggregated outputs. Default: "outputs".
    pub results_prefix: String,

    /// Key prefix for failure records. Default: "failures".
    pub failures_prefix: String,

    /// Write a failure record to the result sink when a run fails. Default: true.
    pub record_failures: bool,

    /// Only objects whose key ends with this suffix start a run. Default: ".pdf".
    pub suffix_filter: String,

    // ── Dispatch ─────────────────────────────────────────────────────────
    /// How a run id is derived from an upload event.
    pub run_id_strategy: RunIdStrategy,

    /// Seconds a received message stays invisible before redelivery. Default: 60.
    pub visibility_timeout_secs: u64,

    /// Delay between empty queue polls in milliseconds. Default: 500.
    pub poll_interval_ms: u64,

    /// Messages fetched per queue poll. Default: 10.
    pub receive_batch: usize,

    // ── Orchestration ────────────────────────────────────────────────────
    /// Maximum concurrent Infer invocations per run. Default: 8.
    ///
    /// Vision endpoints throttle aggressively; this is the backpressure knob.
    pub infer_concurrency: usize,

    /// Maximum runs executing at once in the worker service. Default: 4.
    pub max_concurrent_runs: usize,

    /// What a single exhausted image does to its run. Default: partial success.
    pub failure_policy: FailurePolicy,

    /// Retry policy for the Extract stage. Default: 2 attempts.
    ///
    /// Extraction failures are nearly always content errors (corrupt file),
    /// so a second attempt only covers storage blips.
    pub extract_retry: RetryPolicy,

    /// Retry policy for each Infer invocation. Default: 4 attempts.
    pub infer_retry: RetryPolicy,

    /// Retry policy for writes to the result sink. Default: 3 attempts.
    pub sink_retry: RetryPolicy,

    /// Per-attempt Extract timeout in seconds. Default: 300.
    pub extract_timeout_secs: u64,

    /// Per-attempt Infer timeout in seconds. Default: 60.
    pub infer_timeout_secs: u64,

    /// Per-attempt result-sink write timeout in seconds. Default: 30.
    pub sink_timeout_secs: u64,

    // ── Extraction ───────────────────────────────────────────────────────
    /// PDF user password for encrypted documents.
    pub pdf_password: Option<String>,

    // ── Vision model ─────────────────────────────────────────────────────
    /// Model identifier. If None, uses "gpt-4.1-nano".
    pub model: Option<String>,

    /// Provider name passed to `ProviderFactory` ("openai", "anthropic",
    /// "gemini", "ollama", "azure"). If None, detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-built provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per image. Default: 1024.
    pub max_tokens: usize,

    /// Custom instruction prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Optional observer notified about run and image progress.
    pub progress: Option<ProgressObserver>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_bucket: "uploads".to_string(),
            image_bucket: "images".to_string(),
            result_bucket: "results".to_string(),
            results_prefix: "outputs".to_string(),
            failures_prefix: "failures".to_string(),
            record_failures: true,
            suffix_filter: ".pdf".to_string(),
            run_id_strategy: RunIdStrategy::default(),
            visibility_timeout_secs: 60,
            poll_interval_ms: 500,
            receive_batch: 10,
            infer_concurrency: 8,
            max_concurrent_runs: 4,
            failure_policy: FailurePolicy::default(),
            extract_retry: RetryPolicy::new(2, 1_000, 10_000),
            infer_retry: RetryPolicy::new(4, 500, 8_000),
            sink_retry: RetryPolicy::new(3, 250, 4_000),
            extract_timeout_secs: 300,
            infer_timeout_secs: 60,
            sink_timeout_secs: 30,
            pdf_password: None,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 1024,
            system_prompt: None,
            progress: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("upload_bucket", &self.upload_bucket)
            .field("image_bucket", &self.image_bucket)
            .field("result_bucket", &self.result_bucket)
            .field("suffix_filter", &self.suffix_filter)
            .field("run_id_strategy", &self.run_id_strategy)
            .field("infer_concurrency", &self.infer_concurrency)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("failure_policy", &self.failure_policy)
            .field("extract_retry", &self.extract_retry)
            .field("infer_retry", &self.infer_retry)
            .field("sink_retry", &self.sink_retry)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("progress", &self.progress.as_ref().map(|_| "<dyn PipelineObserver>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn infer_timeout(&self) -> Duration {
        Duration::from_secs(self.infer_timeout_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Whether an object key passes the configured suffix filter.
    pub fn accepts_key(&self, key: &str) -> bool {
        key.to_ascii_lowercase()
            .ends_with(&self.suffix_filter.to_ascii_lowercase())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn upload_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.upload_bucket = bucket.into();
        self
    }

    pub fn image_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.image_bucket = bucket.into();
        self
    }

    pub fn result_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.result_bucket = bucket.into();
        self
    }

    pub fn results_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.results_prefix = prefix.into();
        self
    }

    pub fn failures_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.failures_prefix = prefix.into();
        self
    }

    pub fn record_failures(mut self, v: bool) -> Self {
        self.config.record_failures = v;
        self
    }

    pub fn suffix_filter(mut self, suffix: impl Into<String>) -> Self {
        self.config.suffix_filter = suffix.into();
        self
    }

    pub fn run_id_strategy(mut self, strategy: RunIdStrategy) -> Self {
        self.config.run_id_strategy = strategy;
        self
    }

    pub fn visibility_timeout_secs(mut self, secs: u64) -> Self {
        self.config.visibility_timeout_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn receive_batch(mut self, n: usize) -> Self {
        self.config.receive_batch = n.max(1);
        self
    }

    pub fn infer_concurrency(mut self, n: usize) -> Self {
        self.config.infer_concurrency = n.max(1);
        self
    }

    pub fn max_concurrent_runs(mut self, n: usize) -> Self {
        self.config.max_concurrent_runs = n.max(1);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn extract_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.extract_retry = policy;
        self
    }

    pub fn infer_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.infer_retry = policy;
        self
    }

    pub fn sink_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.sink_retry = policy;
        self
    }

    pub fn extract_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extract_timeout_secs = secs;
        self
    }

    pub fn infer_timeout_secs(mut self, secs: u64) -> Self {
        self.config.infer_timeout_secs = secs;
        self
    }

    pub fn sink_timeout_secs(mut self, secs: u64) -> Self {
        self.config.sink_timeout_secs = secs;
        self
    }

    pub fn pdf_password(mut self, pwd: impl Into<String>) -> Self {
        self.config.pdf_password = Some(pwd.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress(mut self, observer: ProgressObserver) -> Self {
        self.config.progress = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.infer_concurrency == 0 || c.max_concurrent_runs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency limits must be ≥ 1".into(),
            ));
        }
        for (stage, policy) in [
            ("extract", &c.extract_retry),
            ("infer", &c.infer_retry),
            ("sink", &c.sink_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{stage} retry policy needs at least one attempt"
                )));
            }
        }
        if !(0.0..=2.0).contains(&c.temperature) {
            return Err(PipelineError::InvalidConfig(format!(
                "Temperature must be within 0.0–2.0 (got {})",
                c.temperature
            )));
        }
        if c.suffix_filter.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Suffix filter must not be empty".into(),
            ));
        }
        if c.upload_bucket.is_empty() || c.image_bucket.is_empty() || c.result_bucket.is_empty()
        {
            return Err(PipelineError::InvalidConfig(
                "Bucket names must not be empty".into(),
            ));
        }
        if c.extract_timeout_secs == 0 || c.infer_timeout_secs == 0 || c.sink_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Stage timeouts must be ≥ 1s".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Policies ─────────────────────────────────────────────────────────────

/// Bounded exponential backoff for one stage invocation.
///
/// Attempt `n` (1-based) that fails with a retryable error sleeps
/// `initial_backoff_ms * 2^(n-1)`, capped at `max_backoff_ms`, before
/// attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Policy that never retries.
    pub const fn once() -> Self {
        Self::new(1, 0, 0)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// What happens to a run when one image exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Record the failure on that image and keep going. (default)
    #[default]
    PartialSuccess,
    /// Fail the whole run as soon as any image is terminally failed.
    AbortOnImageFailure,
}

/// How a run id is derived from an upload event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunIdStrategy {
    /// The decoded object key. Assumes keys are never reused. (default)
    #[default]
    ObjectKey,
    /// Object key plus the event timestamp; a re-upload under the same key
    /// starts a fresh run.
    KeyAndEventTime,
}
