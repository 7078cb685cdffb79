//! Image encoding: extracted `DynamicImage` → PNG bytes, stored bytes →
//! base64 `ImageData` for the model request.
//!
//! Vision APIs accept images as base64 data-URIs embedded in the JSON body.
//! Extracted images are normalised to PNG so every stored object has one
//! format regardless of how it was compressed inside the PDF (DCT, Flate,
//! JBIG2, …).

use crate::error::StageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Encode an extracted image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap stored image bytes for the vision model.
///
/// The MIME type is sniffed from the bytes, not trusted from the key. Bytes
/// that are not a recognisable raster format are an Input error: retrying
/// cannot make them readable.
pub fn image_data(bytes: &[u8]) -> Result<ImageData, StageError> {
    if bytes.is_empty() {
        return Err(StageError::Input("image object is empty".into()));
    }
    let format = image::guess_format(bytes)
        .map_err(|e| StageError::Input(format!("unreadable image: {e}")))?;
    let mime = match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        other => {
            return Err(StageError::Input(format!(
                "unsupported image format {other:?}"
            )))
        }
    };

    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64 ({})", b64.len(), mime);

    Ok(ImageData::new(b64, mime).with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red_square() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encoded_png_is_sniffed_as_png() {
        let png = encode_png(&red_square()).expect("encode should succeed");
        let data = image_data(&png).expect("png is accepted");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, png);
    }

    #[test]
    fn garbage_bytes_are_input_errors() {
        let err = image_data(b"definitely not an image").unwrap_err();
        assert!(matches!(err, StageError::Input(_)));
    }

    #[test]
    fn empty_object_is_input_error() {
        assert!(matches!(image_data(&[]), Err(StageError::Input(_))));
    }
}
