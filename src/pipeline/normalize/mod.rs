//! Input normalization: raster or DICOM bytes → model-ready tensor.
//!
//! Pipeline flow:
//! 1. Validate bytes (size bounds)
//! 2. Detect format from magic bytes
//! 3. Decode (DICOM: modality rescale + windowing to 0–255)
//! 4. Convert to RGB (gray replicated, alpha dropped)
//! 5. Resize straight to the model input size (no aspect padding)
//! 6. Per-channel mean/std normalization from the model artifact

pub mod dicom;
pub mod format;
pub mod window;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array3;
use thiserror::Error;
use tracing::debug;

use self::dicom::{DicomError, DicomImage, Photometric};
use self::format::{detect_format, raster_format};
use crate::config::DEFAULT_MAX_IMAGE_BYTES;
use crate::pipeline::classifier::InputSpec;
use crate::pipeline::types::{CanonicalImage, RawImageInput, SourceFormat};

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt image data: {0}")]
    CorruptImage(String),

    #[error("Image too large ({size} bytes) — maximum is {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
}

impl From<DicomError> for NormalizeError {
    fn from(err: DicomError) -> Self {
        if err.is_unsupported() {
            Self::UnsupportedFormat(format!("DICOM: {err}"))
        } else {
            Self::CorruptImage(format!("DICOM: {err}"))
        }
    }
}

/// Converts one request payload into a `CanonicalImage`.
///
/// Pure transform: no I/O and no model calls. Normalization constants come
/// from the model artifact.
pub trait ImageNormalizer: Send + Sync {
    fn normalize(
        &self,
        input: &RawImageInput,
        spec: &InputSpec,
    ) -> Result<CanonicalImage, NormalizeError>;
}

/// Production normalizer.
pub struct StandardNormalizer {
    max_bytes: usize,
    filter: FilterType,
}

impl StandardNormalizer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            filter: FilterType::Triangle,
        }
    }
}

impl Default for StandardNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl ImageNormalizer for StandardNormalizer {
    fn normalize(
        &self,
        input: &RawImageInput,
        spec: &InputSpec,
    ) -> Result<CanonicalImage, NormalizeError> {
        let bytes = input.bytes();
        validate_payload(bytes, self.max_bytes)?;

        let format = detect_format(bytes).ok_or_else(|| {
            NormalizeError::UnsupportedFormat(
                "not a PNG, JPEG, TIFF, BMP or DICOM payload".to_string(),
            )
        })?;

        let original = match raster_format(format) {
            Some(image_format) => image::load_from_memory_with_format(bytes, image_format)
                .map_err(|e| NormalizeError::CorruptImage(format!("failed to decode image: {e}")))?
                .to_rgb8(),
            None => decode_dicom(input)?,
        };

        let (width, height) = original.dimensions();
        if width == 0 || height == 0 {
            return Err(NormalizeError::CorruptImage(format!(
                "zero-area image ({width}x{height})"
            )));
        }

        let resized = image::imageops::resize(&original, spec.size, spec.size, self.filter);
        let tensor = to_tensor(&resized, spec)?;

        debug!(
            format = ?format,
            original = format!("{width}x{height}"),
            input = spec.size,
            "Image normalized for classifier"
        );

        Ok(CanonicalImage {
            tensor,
            original,
            source_format: format,
        })
    }
}

fn validate_payload(bytes: &[u8], max_bytes: usize) -> Result<(), NormalizeError> {
    if bytes.is_empty() {
        return Err(NormalizeError::UnsupportedFormat("empty payload".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(NormalizeError::PayloadTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(())
}

/// Decode + window a DICOM payload into a display raster.
fn decode_dicom(input: &RawImageInput) -> Result<RgbImage, NormalizeError> {
    let dicom = DicomImage::parse(input.bytes())?;

    if let Some(rgb) = dicom.rgb_raster() {
        return Ok(rgb);
    }

    let values = dicom.modality_values();
    // Caller's hint first, then what the scanner recorded.
    let body_part = input.body_part().or(dicom.body_part.as_deref());
    let (chosen, source) =
        window::select_window(dicom.window, &values, input.modality(), body_part);

    let gray = window::apply_window(
        &values,
        chosen,
        dicom.photometric == Photometric::Monochrome1,
    )
    .ok_or_else(|| NormalizeError::CorruptImage("DICOM pixel data contains NaN".to_string()))?;

    debug!(
        rows = dicom.rows,
        columns = dicom.columns,
        center = chosen.center,
        width = chosen.width,
        source = ?source,
        "DICOM windowed"
    );

    let gray = GrayImage::from_raw(dicom.columns, dicom.rows, gray)
        .ok_or_else(|| NormalizeError::CorruptImage("DICOM frame size mismatch".to_string()))?;
    Ok(DynamicImage::ImageLuma8(gray).to_rgb8())
}

/// `[3, H, W]` tensor with `(x / 255 - mean[c]) / std[c]`.
fn to_tensor(image: &RgbImage, spec: &InputSpec) -> Result<Array3<f32>, NormalizeError> {
    let (width, height) = image.dimensions();
    let tensor = Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        let value = image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0;
        (value - spec.mean[c]) / spec.std[c]
    });

    if tensor.iter().any(|v| !v.is_finite()) {
        return Err(NormalizeError::CorruptImage(
            "normalized pixel data contains NaN".to_string(),
        ));
    }
    Ok(tensor)
}
