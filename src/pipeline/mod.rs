//! Pipeline stages and the retry harness that drives them.
//!
//! Each submodule implements exactly one step; the orchestrator composes
//! them and only ever sees a [`retry::StageOutcome`].
//!
//! ## Data Flow
//!
//! ```text
//! UploadObjectRef ──▶ extract ──▶ [ImageRef; K] ──▶ infer ×K ──▶ [InferenceResult; K]
//!                    (pdfium)     (image bucket)    (VLM)
//! ```
//!
//! 1. [`extract`]: open the PDF, pull embedded raster images page by page,
//!    persist them under deterministic keys. Runs in `spawn_blocking`
//!    because pdfium is not async-safe.
//! 2. [`encode`]: PNG encoding of extracted images and base64 wrapping of
//!    stored images for the model request body.
//! 3. [`llm`]: the vision-model seam and its OpenAI-compatible client;
//!    the only stage with network I/O.
//! 4. [`infer`]: load one stored image, call the model, classify errors.
//! 5. [`retry`]: per-invocation timeout plus bounded exponential backoff.

pub mod encode;
pub mod extract;
pub mod infer;
pub mod llm;
pub mod retry;
