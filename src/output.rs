//! Per-image and per-run output types.
//!
//! [`ImageRef`] is what the Extract stage hands to the Infer stage,
//! [`InferenceResult`] is what comes back, and [`AggregatedOutput`] is the
//! document-level record written to the result sink once every image has a
//! terminal result.

use crate::error::ImageError;
use crate::event::{RunId, UploadObjectRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One embedded image found by the Extract stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub run_id: RunId,
    /// 0-based page index.
    pub page_index: usize,
    /// 0-based position of the image within its page, in encoding order.
    pub image_index: usize,
    /// Object key of the persisted image in the image bucket.
    pub location: String,
}

impl ImageRef {
    /// Deterministic storage key for an image, so re-extraction overwrites
    /// rather than duplicates.
    pub fn location_for(run_id: &RunId, page_index: usize, image_index: usize) -> String {
        format!(
            "{}/page-{:04}/image-{:03}.png",
            run_id.as_str(),
            page_index,
            image_index
        )
    }

    pub fn new(run_id: RunId, page_index: usize, image_index: usize) -> Self {
        let location = Self::location_for(&run_id, page_index, image_index);
        Self {
            run_id,
            page_index,
            image_index,
            location,
        }
    }

    /// The (page, image) ordering key used by aggregation.
    pub fn position(&self) -> (usize, usize) {
        (self.page_index, self.image_index)
    }
}

/// Outcome of the Infer stage for a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub image: ImageRef,
    /// Description text; empty when `error` is set.
    pub description: String,
    pub error: Option<ImageError>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl InferenceResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// All results of one page, in image order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResults {
    pub page_index: usize,
    pub results: Vec<InferenceResult>,
}

/// The final output of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOutput {
    pub run_id: RunId,
    pub source: UploadObjectRef,
    /// Pages that contain at least one image, ordered by page index.
    pub pages: Vec<PageResults>,
    pub image_count: usize,
    pub failed_count: usize,
    pub completed_at: DateTime<Utc>,
}

impl AggregatedOutput {
    /// Group and order results by (page index, image index).
    ///
    /// Arrival order is irrelevant: the indices carried by each `ImageRef`
    /// decide placement.
    pub fn build(run_id: RunId, source: UploadObjectRef, mut results: Vec<InferenceResult>) -> Self {
        results.sort_by_key(|r| r.image.position());

        let image_count = results.len();
        let failed_count = results.iter().filter(|r| !r.is_success()).count();

        let mut pages: Vec<PageResults> = Vec::new();
        for result in results {
            match pages.last_mut() {
                Some(page) if page.page_index == result.image.page_index => {
                    page.results.push(result)
                }
                _ => pages.push(PageResults {
                    page_index: result.image.page_index,
                    results: vec![result],
                }),
            }
        }

        Self {
            run_id,
            source,
            pages,
            image_count,
            failed_count,
            completed_at: Utc::now(),
        }
    }

    /// Flat view over every result in (page, image) order.
    pub fn results(&self) -> impl Iterator<Item = &InferenceResult> {
        self.pages.iter().flat_map(|p| p.results.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.image_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(page: usize, image: usize, text: &str) -> InferenceResult {
        InferenceResult {
            image: ImageRef::new(RunId::new("doc"), page, image),
            description: text.to_string(),
            error: None,
            attempts: 1,
            duration_ms: 5,
        }
    }

    #[test]
    fn location_is_deterministic() {
        let a = ImageRef::new(RunId::new("in/doc1.pdf"), 3, 7);
        assert_eq!(a.location, "in/doc1.pdf/page-0003/image-007.png");
        assert_eq!(a, ImageRef::new(RunId::new("in/doc1.pdf"), 3, 7));
    }

    #[test]
    fn build_restores_page_image_order() {
        let out = AggregatedOutput::build(
            RunId::new("doc"),
            UploadObjectRef::pdf("uploads", "doc"),
            vec![result(1, 1, "c"), result(0, 0, "a"), result(1, 0, "b")],
        );
        let order: Vec<&str> = out.results().map(|r| r.description.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(out.pages.len(), 2);
        assert_eq!(out.pages[1].results.len(), 2);
        assert_eq!(out.image_count, 3);
        assert_eq!(out.failed_count, 0);
    }

    #[test]
    fn failed_results_are_counted() {
        let mut bad = result(2, 0, "");
        bad.error = Some(ImageError::Rejected {
            page: 2,
            image: 0,
            detail: "unreadable".into(),
        });
        let out = AggregatedOutput::build(
            RunId::new("doc"),
            UploadObjectRef::pdf("uploads", "doc"),
            vec![bad, result(0, 0, "a")],
        );
        assert_eq!(out.failed_count, 1);
        assert_eq!(out.pages[1].page_index, 2);
    }

    #[test]
    fn empty_output_serialises() {
        let out = AggregatedOutput::build(
            RunId::new("blank.pdf"),
            UploadObjectRef::pdf("uploads", "blank.pdf"),
            vec![],
        );
        assert!(out.is_empty());
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"pages\":[]"), "got: {json}");
    }
}
