//! Vision-model interaction: the [`VisionModel`] seam and its
//! implementation over an `edgequake_llm` provider.
//!
//! This module is intentionally thin. Prompt text lives in
//! [`crate::prompts`]; retries live in [`crate::pipeline::retry`]. What stays
//! here is the message shape and the mapping of provider failures onto
//! [`ModelError`], which decides whether the orchestrator retries.
//!
//! ## Error Mapping
//!
//! Providers report failures as text carrying the HTTP status and the
//! provider's message; [`classify_llm_error`] reads that text.
//!
//! | Provider failure                       | `ModelError`   | Retried |
//! |----------------------------------------|----------------|---------|
//! | 429, rate limit                        | `Throttled`    | yes     |
//! | 5xx, connect error, timeout, other     | `Unavailable`  | yes     |
//! | empty completion                       | `Unavailable`  | yes     |
//! | 400 / 413 / 422, invalid request       | `InvalidInput` | no      |
//! | 401 / 403, missing credentials         | `Rejected`     | no      |
//! | content filter                         | `Rejected`     | no      |

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::output::ImageRef;
use crate::prompts::{image_context, DEFAULT_DESCRIBE_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Per-call instruction and sampling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DescribeOptions {
    pub system_prompt: String,
    /// Text sent alongside the image in the user turn.
    pub context: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl DescribeOptions {
    pub fn for_image(config: &PipelineConfig, image: &ImageRef) -> Self {
        Self {
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_DESCRIBE_PROMPT.to_string()),
            context: image_context(image.page_index, image.image_index),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// A model's answer for one image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Description {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Typed inference failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model throttled the request: {0}")]
    Throttled(String),

    #[error("model rejected the input: {0}")]
    InvalidInput(String),

    #[error("model refused the request: {0}")]
    Rejected(String),

    #[error("model unavailable: {0}")]
    Unavailable(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Throttled(_) | ModelError::Unavailable(_))
    }
}

impl From<ModelError> for StageError {
    fn from(e: ModelError) -> Self {
        if e.is_retryable() {
            StageError::Retryable(e.to_string())
        } else {
            StageError::Input(e.to_string())
        }
    }
}

// ── Trait ────────────────────────────────────────────────────────────────

/// Describes one image.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    async fn describe(
        &self,
        image: ImageData,
        options: &DescribeOptions,
    ) -> Result<Description, ModelError>;
}

// ── Provider-backed model ────────────────────────────────────────────────

/// [`VisionModel`] over any `edgequake_llm` provider (OpenAI, Anthropic,
/// Gemini, Ollama, Azure, ...).
#[derive(Clone)]
pub struct ProviderVisionModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl std::fmt::Debug for ProviderVisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderVisionModel")
            .field("provider", &"<dyn LLMProvider>")
            .field("model", &self.model)
            .finish()
    }
}

impl ProviderVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Resolve the provider from `config`, most specific source first:
    ///
    /// 1. `config.provider`, used as-is.
    /// 2. `config.provider_name` with `config.model`.
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set.
    /// 4. `openai` when `OPENAI_API_KEY` is set.
    /// 5. Whatever `ProviderFactory::from_env` detects.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

        if let Some(ref provider) = config.provider {
            return Ok(Self::new(Arc::clone(provider), model));
        }

        if let Some(ref name) = config.provider_name {
            return create_vision_provider(name, model);
        }

        if let (Ok(provider), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !provider.is_empty() && !env_model.is_empty() {
                return create_vision_provider(&provider, &env_model);
            }
        }

        if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
            return create_vision_provider("openai", model);
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No LLM provider could be auto-detected from environment.\n\
                     Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                     Error: {e}"
                ),
            })?;
        Ok(Self::new(provider, model))
    }
}

fn create_vision_provider(name: &str, model: &str) -> Result<ProviderVisionModel, PipelineError> {
    let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    info!("Using {} model '{}'", name, model);
    Ok(ProviderVisionModel::new(provider, model))
}

#[async_trait]
impl VisionModel for ProviderVisionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn describe(
        &self,
        image: ImageData,
        options: &DescribeOptions,
    ) -> Result<Description, ModelError> {
        let messages = vec![
            ChatMessage::system(options.system_prompt.as_str()),
            ChatMessage::user_with_images(options.context.as_str(), vec![image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&build_options(options)))
            .await
            .map_err(|e| classify_llm_error(&e.to_string()))?;

        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(ModelError::Unavailable("empty completion".into()));
        }

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.model, response.prompt_tokens, response.completion_tokens
        );
        Ok(Description {
            text,
            prompt_tokens: response.prompt_tokens as usize,
            completion_tokens: response.completion_tokens as usize,
        })
    }
}

fn build_options(options: &DescribeOptions) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(options.temperature),
        max_tokens: Some(options.max_tokens),
        ..Default::default()
    }
}

/// Map a provider error message onto `ModelError`.
pub fn classify_llm_error(message: &str) -> ModelError {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let detail = message.to_string();

    if has(&["content_filter", "content filter"]) {
        ModelError::Rejected(detail)
    } else if has(&["429", "rate limit", "rate_limit", "too many requests"]) {
        ModelError::Throttled(detail)
    } else if has(&["401", "403", "unauthorized", "forbidden", "authentication", "api key"]) {
        ModelError::Rejected(detail)
    } else if has(&["400", "413", "422", "invalid_request", "invalid request", "bad request"]) {
        ModelError::InvalidInput(detail)
    } else {
        ModelError::Unavailable(detail)
    }
}
