//! Inline image optimization.
//!
//! Images travel as `data:` URLs. The pipeline decodes the base64 payload
//! under a size gate, fits the image inside a square bounding box without
//! enlargement, and re-encodes as progressive JPEG, which also strips any
//! embedded metadata. The caller correlates the result with the submitting
//! client through the placeholder id; the document itself is never touched
//! here.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use jpeg_encoder::{ColorType, Encoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid image data url")]
    InvalidDataUrl,

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("image too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),

    #[error("image decode failed: {0}")]
    Decode(image::ImageError),

    #[error("image encode failed: {0}")]
    Encode(#[from] jpeg_encoder::EncodingError),
}

/// Bounds and quality knobs for the optimization pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ImageLimits {
    /// Ceiling on the decoded payload, in bytes. A 5% tolerance is applied
    /// on top, matching what clients are told the limit is.
    pub max_payload_bytes: usize,
    /// Bounding box edge, in pixels.
    pub max_dimension: u32,
    /// JPEG re-encode quality (1-100).
    pub jpeg_quality: u8,
}

impl ImageLimits {
    fn payload_ceiling(&self) -> usize {
        self.max_payload_bytes.saturating_mul(21) / 20
    }
}

/// Run the full transform: data URL in, `data:image/jpeg;base64,...` out.
///
/// CPU-bound; callers run this on the blocking pool.
pub fn optimize_data_url(data_url: &str, limits: &ImageLimits) -> Result<String, MediaError> {
    let payload = parse_data_url(data_url)?;
    let bytes = BASE64.decode(payload)?;

    let ceiling = limits.payload_ceiling();
    if bytes.len() > ceiling {
        return Err(MediaError::TooLarge(bytes.len(), ceiling));
    }

    let img = image::load_from_memory(&bytes).map_err(MediaError::Decode)?;
    let img = if img.width() > limits.max_dimension || img.height() > limits.max_dimension {
        img.resize(limits.max_dimension, limits.max_dimension, FilterType::Lanczos3)
    } else {
        img
    };

    // JPEG carries no alpha; flattening to RGB also drops source metadata.
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = Encoder::new(&mut out, limits.jpeg_quality);
    encoder.set_progressive(true);
    encoder.encode(
        rgb.as_raw(),
        rgb.width() as u16,
        rgb.height() as u16,
        ColorType::Rgb,
    )?;

    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(&out)))
}

/// Split a `data:image/<subtype>;base64,<payload>` URL into its payload.
fn parse_data_url(data_url: &str) -> Result<&str, MediaError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or(MediaError::InvalidDataUrl)?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or(MediaError::InvalidDataUrl)?;
    match mime.strip_prefix("image/") {
        Some(subtype) if !subtype.is_empty() => Ok(payload),
        _ => Err(MediaError::UnsupportedMediaType(mime.to_string())),
    }
}
