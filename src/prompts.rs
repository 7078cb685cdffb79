//! Instruction prompts for describing extracted images.
//!
//! Kept in one place so prompt changes never touch retry or error-handling
//! logic, and so tests can assert on the prompt text directly.
//!
//! Callers can override the default via
//! [`crate::config::PipelineConfig::system_prompt`].

/// Default instruction sent with every image.
pub const DEFAULT_DESCRIBE_PROMPT: &str = r#"You are an expert document analyst. You receive one image that was embedded in a PDF document.

Describe the image so that someone who cannot see it understands what it conveys.

1. CONTENT
   - State what kind of image it is (photo, chart, diagram, table, scanned text, logo, …)
   - Transcribe any visible text faithfully, including handwritten text
   - For charts: name the axes, series and the main trend or takeaway
   - For tables: summarise the columns and the most important rows

2. STYLE
   - Be concise: a short paragraph, at most a few bullet points for structured content
   - Do not speculate beyond what is visible
   - Do not mention that you are looking at an image extracted from a PDF

3. OUTPUT FORMAT
   - Plain text only
   - No Markdown fences, no preamble, no closing remarks"#;

/// Short user-turn text accompanying the image.
///
/// Some OpenAI-compatible servers reject a user turn whose only content is
/// an image, so a minimal text part is always sent alongside it.
pub fn image_context(page_index: usize, image_index: usize) -> String {
    format!(
        "Image {} on page {} of the document.",
        image_index + 1,
        page_index + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_demands_plain_text() {
        assert!(DEFAULT_DESCRIBE_PROMPT.contains("Plain text only"));
    }

    #[test]
    fn context_is_one_based() {
        assert_eq!(image_context(0, 2), "Image 3 on page 1 of the document.");
    }
}
