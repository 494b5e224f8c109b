//! Decode and re-encode report photos within a byte budget.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

/// Accepted upload formats. Everything else is rejected before decode.
const ALLOWED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported file type: {0}")]
    InvalidFileType(String),

    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),

    #[error("image encode failed: {0}")]
    Encode(#[source] image::ImageError),

    #[error("quality must be in (0, 1], got {0}")]
    InvalidQuality(f32),

    #[error("max width must be greater than zero")]
    InvalidWidth,
}

/// Decodes an uploaded or captured photo, enforcing the format allowlist.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
    let format = image::guess_format(bytes)
        .map_err(|_| CodecError::InvalidFileType("unrecognized image data".to_string()))?;
    if !ALLOWED_FORMATS.contains(&format) {
        return Err(CodecError::InvalidFileType(format!("{:?}", format)));
    }
    image::load_from_memory_with_format(bytes, format).map_err(CodecError::Decode)
}

/// Re-encodes `image` as JPEG at `quality` (0, 1], downscaling to at most
/// `max_width_px` while preserving aspect ratio. Never upscales: a source
/// already within the width bound keeps its dimensions.
pub fn compress(
    image: &DynamicImage,
    max_width_px: u32,
    quality: f32,
) -> Result<Vec<u8>, CodecError> {
    if !(quality > 0.0 && quality <= 1.0) {
        return Err(CodecError::InvalidQuality(quality));
    }
    if max_width_px == 0 {
        return Err(CodecError::InvalidWidth);
    }

    let (width, height) = (image.width(), image.height());
    let resized;
    let source = if width > max_width_px {
        let new_height = scaled_height(width, height, max_width_px);
        resized = image.resize_exact(max_width_px, new_height, FilterType::Triangle);
        &resized
    } else {
        image
    };

    // JPEG has no alpha channel.
    let rgb = source.to_rgb8();
    let jpeg_quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality);
    rgb.write_with_encoder(encoder).map_err(CodecError::Encode)?;
    Ok(buf.into_inner())
}

fn scaled_height(width: u32, height: u32, max_width_px: u32) -> u32 {
    let scaled = (height as u64 * max_width_px as u64 + width as u64 / 2) / width as u64;
    scaled.max(1) as u32
}
