//! Infer stage: one stored image → one description.

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::output::ImageRef;
use crate::pipeline::encode::image_data;
use crate::pipeline::llm::{DescribeOptions, VisionModel};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Runs the Infer stage for one image. Must be safe to repeat.
#[async_trait]
pub trait InferStage: Send + Sync {
    async fn infer(&self, image: &ImageRef) -> Result<String, StageError>;
}

/// Infer stage that loads the image from an [`ObjectStore`] and asks a
/// [`VisionModel`] to describe it.
pub struct ModelInferStage {
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn VisionModel>,
    config: Arc<PipelineConfig>,
}

impl ModelInferStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn VisionModel>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            model,
            config,
        }
    }
}

#[async_trait]
impl InferStage for ModelInferStage {
    async fn infer(&self, image: &ImageRef) -> Result<String, StageError> {
        let bytes = self
            .store
            .get(&self.config.image_bucket, &image.location)
            .await?;
        let data = image_data(&bytes)?;
        let options = DescribeOptions::for_image(&self.config, image);

        let description = self.model.describe(data, &options).await?;
        debug!(
            "{} page {} image {}: {} chars from {}",
            image.run_id,
            image.page_index,
            image.image_index,
            description.text.len(),
            self.model.name()
        );
        Ok(description.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RunId;
    use crate::pipeline::encode::encode_png;
    use crate::pipeline::llm::{Description, ModelError};
    use edgequake_llm::ImageData;
    use crate::storage::MemoryObjectStore;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<Vec<Result<Description, ModelError>>>,
        seen_context: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<Description, ModelError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen_context: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn describe(
            &self,
            image: ImageData,
            options: &DescribeOptions,
        ) -> Result<Description, ModelError> {
            assert_eq!(image.mime_type, "image/png");
            self.seen_context.lock().unwrap().push(options.context.clone());
            self.replies.lock().unwrap().remove(0)
        }
    }

    async fn setup(model: ScriptedModel) -> (ModelInferStage, ImageRef, Arc<ScriptedModel>) {
        let store = Arc::new(MemoryObjectStore::new());
        let image = ImageRef::new(RunId::new("doc"), 0, 1);
        let png = encode_png(&DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            2,
            2,
            Rgba([1, 2, 3, 255]),
        )))
        .unwrap();
        store.put("images", &image.location, png).await.unwrap();
        let model = Arc::new(model);
        let stage = ModelInferStage::new(
            store,
            model.clone(),
            Arc::new(PipelineConfig::default()),
        );
        (stage, image, model)
    }

    #[tokio::test]
    async fn returns_model_description() {
        let (stage, image, model) = setup(ScriptedModel::new(vec![Ok(Description {
            text: "A logo.".into(),
            ..Default::default()
        })]))
        .await;

        assert_eq!(stage.infer(&image).await.unwrap(), "A logo.");
        assert_eq!(
            model.seen_context.lock().unwrap().as_slice(),
            ["Image 2 on page 1 of the document.".to_string()]
        );
    }

    #[tokio::test]
    async fn throttling_is_retryable() {
        let (stage, image, _) = setup(ScriptedModel::new(vec![Err(ModelError::Throttled(
            "429".into(),
        ))]))
        .await;
        assert!(stage.infer(&image).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn rejection_is_input_error() {
        let (stage, image, _) = setup(ScriptedModel::new(vec![Err(ModelError::InvalidInput(
            "bad image".into(),
        ))]))
        .await;
        assert!(matches!(
            stage.infer(&image).await.unwrap_err(),
            StageError::Input(_)
        ));
    }

    #[tokio::test]
    async fn missing_image_is_input_error() {
        let (stage, _, _) = setup(ScriptedModel::new(vec![])).await;
        let missing = ImageRef::new(RunId::new("doc"), 9, 9);
        assert!(matches!(
            stage.infer(&missing).await.unwrap_err(),
            StageError::Input(_)
        ));
    }
}
