//! Extract stage: uploaded PDF → ordered list of persisted images.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a synchronous C library. Parsing a large scanned document can
//! take seconds of CPU; running it on the async executor would stall every
//! other run's model calls. `tokio::task::spawn_blocking` moves the work onto
//! the dedicated blocking pool.
//!
//! ## Ordering
//!
//! Pages are visited in document order and, within a page, images in the
//! order the page's content stream draws them. The resulting `(page, image)`
//! indices are the only ordering the rest of the pipeline relies on.

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::event::{RunId, UploadObjectRef};
use crate::output::ImageRef;
use crate::pipeline::encode::encode_png;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Runs the Extract stage for one upload.
#[async_trait]
pub trait ExtractStage: Send + Sync {
    /// Persist every embedded image and return their refs in
    /// (page, image) order. An empty list is a valid result.
    async fn extract(
        &self,
        run_id: &RunId,
        source: &UploadObjectRef,
    ) -> Result<Vec<ImageRef>, StageError>;
}

// ── PDF reading ──────────────────────────────────────────────────────────

/// Why a document could not be read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("not a PDF document")]
    NotAPdf,

    #[error("corrupt PDF: {0}")]
    Corrupt(String),

    #[error("PDF is password-protected")]
    PasswordRequired,

    #[error("wrong PDF password")]
    WrongPassword,

    #[error("PDF engine unavailable: {0}")]
    Engine(String),
}

impl From<ReadError> for StageError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Engine(_) => StageError::Fatal(e.to_string()),
            _ => StageError::Input(e.to_string()),
        }
    }
}

/// Blocking PDF reader. Called from `spawn_blocking`.
pub trait PageImageReader: Send + Sync {
    /// Embedded raster images, one inner `Vec` per page in page order.
    ///
    /// Pages without images yield an empty inner `Vec`. Images that fail to
    /// decode individually are skipped.
    fn read_images(
        &self,
        bytes: &[u8],
        password: Option<&str>,
    ) -> Result<Vec<Vec<DynamicImage>>, ReadError>;
}

/// [`PageImageReader`] backed by pdfium.
///
/// The library is located via `PDFIUM_LIB_PATH` (a directory), then the
/// working directory, then the system library path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumReader {
    lib_dir: Option<PathBuf>,
}

impl PdfiumReader {
    pub fn new() -> Self {
        Self {
            lib_dir: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    /// Bind to the pdfium library in `dir`.
    pub fn with_library_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            lib_dir: Some(dir.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, ReadError> {
        let dir = self
            .lib_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./"));
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| ReadError::Engine(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PageImageReader for PdfiumReader {
    fn read_images(
        &self,
        bytes: &[u8],
        password: Option<&str>,
    ) -> Result<Vec<Vec<DynamicImage>>, ReadError> {
        if !looks_like_pdf(bytes) {
            return Err(ReadError::NotAPdf);
        }

        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_vec(bytes.to_vec(), password)
            .map_err(|e| classify_load_error(e, password.is_some()))?;

        let pages = document.pages();
        info!("PDF loaded: {} pages", pages.len());

        let mut out = Vec::with_capacity(pages.len() as usize);
        for (page_index, page) in pages.iter().enumerate() {
            let mut images = Vec::new();
            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                match image_object.get_raw_image() {
                    Ok(img) => images.push(img),
                    Err(e) => warn!(
                        "Page {}: skipping undecodable image: {:?}",
                        page_index + 1,
                        e
                    ),
                }
            }
            debug!("Page {}: {} image(s)", page_index + 1, images.len());
            out.push(images);
        }
        Ok(out)
    }
}

fn looks_like_pdf(bytes: &[u8]) -> bool {
    // The header may be preceded by junk bytes; readers accept it within 1 KiB.
    bytes
        .windows(5)
        .take(1024)
        .any(|w| w == b"%PDF-")
}

fn classify_load_error(e: PdfiumError, had_password: bool) -> ReadError {
    match e {
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
            if had_password {
                ReadError::WrongPassword
            } else {
                ReadError::PasswordRequired
            }
        }
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::FormatError) => {
            ReadError::Corrupt("format error".into())
        }
        other => ReadError::Corrupt(format!("{other:?}")),
    }
}

// ── Stage ────────────────────────────────────────────────────────────────

/// Extract stage over an [`ObjectStore`] and a [`PageImageReader`].
pub struct PdfExtractStage {
    store: Arc<dyn ObjectStore>,
    reader: Arc<dyn PageImageReader>,
    image_bucket: String,
    password: Option<String>,
}

impl PdfExtractStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reader: Arc<dyn PageImageReader>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            reader,
            image_bucket: config.image_bucket.clone(),
            password: config.pdf_password.clone(),
        }
    }
}

#[async_trait]
impl ExtractStage for PdfExtractStage {
    async fn extract(
        &self,
        run_id: &RunId,
        source: &UploadObjectRef,
    ) -> Result<Vec<ImageRef>, StageError> {
        let bytes = self.store.get(&source.bucket, &source.key).await?;
        debug!("{}: loaded {} bytes from {}", run_id, bytes.len(), source);

        let reader = Arc::clone(&self.reader);
        let password = self.password.clone();
        let encoded = tokio::task::spawn_blocking(move || {
            let pages = reader.read_images(&bytes, password.as_deref())?;
            let mut encoded = Vec::new();
            for (page_index, images) in pages.into_iter().enumerate() {
                for (image_index, img) in images.iter().enumerate() {
                    let png = encode_png(img).map_err(|e| {
                        StageError::Input(format!(
                            "page {} image {}: PNG encoding failed: {e}",
                            page_index + 1,
                            image_index + 1
                        ))
                    })?;
                    encoded.push((page_index, image_index, png));
                }
            }
            Ok::<_, StageError>(encoded)
        })
        .await
        .map_err(|e| StageError::Fatal(format!("extract task panicked: {e}")))??;

        let mut refs = Vec::with_capacity(encoded.len());
        for (page_index, image_index, png) in encoded {
            let image = ImageRef::new(run_id.clone(), page_index, image_index);
            self.store.put(&self.image_bucket, &image.location, png).await?;
            refs.push(image);
        }

        info!("{}: extracted {} image(s)", run_id, refs.len());
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use image::{Rgba, RgbaImage};

    /// Reader that ignores the bytes and returns a fixed layout.
    struct FixedLayout(Vec<usize>);

    impl PageImageReader for FixedLayout {
        fn read_images(
            &self,
            _bytes: &[u8],
            _password: Option<&str>,
        ) -> Result<Vec<Vec<DynamicImage>>, ReadError> {
            Ok(self
                .0
                .iter()
                .map(|&n| {
                    (0..n)
                        .map(|_| {
                            DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                                4,
                                4,
                                Rgba([0, 0, 255, 255]),
                            ))
                        })
                        .collect()
                })
                .collect())
        }
    }

    struct Failing(ReadError);

    impl PageImageReader for Failing {
        fn read_images(
            &self,
            _bytes: &[u8],
            _password: Option<&str>,
        ) -> Result<Vec<Vec<DynamicImage>>, ReadError> {
            Err(self.0.clone())
        }
    }

    async fn stage_with(reader: Arc<dyn PageImageReader>) -> (PdfExtractStage, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("uploads", "doc1.pdf", b"%PDF-1.7 fake".to_vec())
            .await
            .unwrap();
        let config = PipelineConfig::default();
        let stage = PdfExtractStage::new(store.clone(), reader, &config);
        (stage, store)
    }

    #[tokio::test]
    async fn images_are_persisted_in_page_order() {
        let (stage, store) = stage_with(Arc::new(FixedLayout(vec![1, 2]))).await;
        let run_id = RunId::new("doc1.pdf");
        let refs = stage
            .extract(&run_id, &UploadObjectRef::pdf("uploads", "doc1.pdf"))
            .await
            .unwrap();

        let positions: Vec<_> = refs.iter().map(ImageRef::position).collect();
        assert_eq!(positions, vec![(0, 0), (1, 0), (1, 1)]);
        for r in &refs {
            assert!(store.exists("images", &r.location).await.unwrap());
        }
        assert_eq!(refs[2].location, "doc1.pdf/page-0001/image-001.png");
    }

    #[tokio::test]
    async fn pages_without_images_yield_nothing() {
        let (stage, _) = stage_with(Arc::new(FixedLayout(vec![0, 0, 0]))).await;
        let refs = stage
            .extract(&RunId::new("d"), &UploadObjectRef::pdf("uploads", "doc1.pdf"))
            .await
            .unwrap();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn missing_upload_is_input_error() {
        let (stage, _) = stage_with(Arc::new(FixedLayout(vec![1]))).await;
        let err = stage
            .extract(&RunId::new("x"), &UploadObjectRef::pdf("uploads", "missing.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Input(_)));
    }

    #[tokio::test]
    async fn reader_errors_are_classified() {
        let (stage, _) = stage_with(Arc::new(Failing(ReadError::PasswordRequired))).await;
        let err = stage
            .extract(&RunId::new("x"), &UploadObjectRef::pdf("uploads", "doc1.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Input(_)));

        let (stage, _) = stage_with(Arc::new(Failing(ReadError::Engine("no lib".into())))).await;
        let err = stage
            .extract(&RunId::new("x"), &UploadObjectRef::pdf("uploads", "doc1.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Fatal(_)));
    }

    #[test]
    fn pdfium_reader_rejects_non_pdf_before_binding() {
        let reader = PdfiumReader::with_library_dir("/nonexistent");
        assert_eq!(
            reader.read_images(b"GIF89a....", None).unwrap_err(),
            ReadError::NotAPdf
        );
    }

    #[test]
    fn pdf_header_detection() {
        assert!(looks_like_pdf(b"%PDF-1.4\n..."));
        assert!(looks_like_pdf(b"\xEF\xBB\xBF%PDF-1.7"));
        assert!(!looks_like_pdf(b"PK\x03\x04"));
    }

    #[test]
    fn password_errors_depend_on_supplied_password() {
        let err = || PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError);
        assert_eq!(classify_load_error(err(), false), ReadError::PasswordRequired);
        assert_eq!(classify_load_error(err(), true), ReadError::WrongPassword);
    }
}
