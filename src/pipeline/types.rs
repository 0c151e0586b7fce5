use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use image::RgbImage;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Fixed disclaimer attached to every outcome.
pub const DISCLAIMER: &str = "This is NOT a diagnostic tool. This is an educational pre-screen only. \
All medical imaging must be reviewed by a qualified radiologist. \
Do not make medical decisions based on this result.";

// ──────────────────────────────────────────────
// Request
// ──────────────────────────────────────────────

/// Caller-declared imaging modality. Trusted as a preprocessing hint only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageModality {
    #[serde(rename = "x-ray")]
    XRay,
    #[serde(rename = "ct")]
    Ct,
    #[serde(rename = "mri")]
    Mri,
}

impl ImageModality {
    pub const ALL: [ImageModality; 3] = [Self::XRay, Self::Ct, Self::Mri];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XRay => "x-ray",
            Self::Ct => "ct",
            Self::Mri => "mri",
        }
    }

    /// Human-readable name used in prompts and explanation text.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::XRay => "X-ray",
            Self::Ct => "CT scan",
            Self::Mri => "MRI scan",
        }
    }
}

impl fmt::Display for ImageModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid image_type '{0}'. Must be one of: x-ray, ct, mri")]
pub struct ParseModalityError(pub String);

impl FromStr for ImageModality {
    type Err = ParseModalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x-ray" | "xray" | "x_ray" | "radiograph" => Ok(Self::XRay),
            "ct" => Ok(Self::Ct),
            "mri" => Ok(Self::Mri),
            _ => Err(ParseModalityError(s.to_string())),
        }
    }
}

/// One uploaded image plus its declared context. Immutable once built.
#[derive(Debug, Clone)]
pub struct RawImageInput {
    bytes: Vec<u8>,
    modality: ImageModality,
    body_part: Option<String>,
}

impl RawImageInput {
    pub fn new(bytes: Vec<u8>, modality: ImageModality) -> Self {
        Self {
            bytes,
            modality,
            body_part: None,
        }
    }

    /// Blank body parts are treated as absent.
    pub fn with_body_part(mut self, body_part: impl Into<String>) -> Self {
        let body_part = body_part.into();
        let trimmed = body_part.trim();
        self.body_part = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn modality(&self) -> ImageModality {
        self.modality
    }

    pub fn body_part(&self) -> Option<&str> {
        self.body_part.as_deref()
    }
}

// ──────────────────────────────────────────────
// Pipeline intermediates
// ──────────────────────────────────────────────

/// Container format the payload was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
    Dicom,
}

impl SourceFormat {
    pub fn is_dicom(&self) -> bool {
        matches!(self, Self::Dicom)
    }
}

/// Model-ready tensor plus the untouched original raster.
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    /// Normalized pixels, channel-first `[3, size, size]`.
    pub tensor: Array3<f32>,
    /// Original-resolution RGB raster (DICOM: after windowing).
    pub original: RgbImage,
    pub source_format: SourceFormat,
}

impl CanonicalImage {
    /// Side length of the square model input.
    pub fn input_size(&self) -> usize {
        self.tensor.dim().1
    }

    /// `(width, height)` of the original raster.
    pub fn original_dimensions(&self) -> (u32, u32) {
        self.original.dimensions()
    }
}

/// Binary decision of the local classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionLabel {
    Normal,
    Abnormal,
}

impl PredictionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Abnormal => "abnormal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub label: PredictionLabel,
    /// Probability of the chosen label: always in `[0.5, 1.0]`.
    pub confidence: f32,
    /// Raw model probability for the abnormal class.
    pub abnormal_probability: f32,
    /// Channel-mean of the last convolutional activations.
    pub activation_map: Array2<f32>,
}

impl ClassificationResult {
    /// Build from the abnormal-class probability. Label flips at 0.5 inclusive.
    pub fn from_probability(abnormal_probability: f32, activation_map: Array2<f32>) -> Self {
        let label = if abnormal_probability >= 0.5 {
            PredictionLabel::Abnormal
        } else {
            PredictionLabel::Normal
        };
        let confidence = match label {
            PredictionLabel::Abnormal => abnormal_probability,
            PredictionLabel::Normal => 1.0 - abnormal_probability,
        };
        Self {
            label,
            confidence,
            abnormal_probability,
            activation_map,
        }
    }
}

// ──────────────────────────────────────────────
// Outcome
// ──────────────────────────────────────────────

/// Externally visible prediction.
///
/// `Uncertain` is only produced on the fallback path, when the vision model
/// declines to commit to either class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Normal,
    Abnormal,
    Uncertain,
}

impl From<PredictionLabel> for Prediction {
    fn from(label: PredictionLabel) -> Self {
        match label {
            PredictionLabel::Normal => Self::Normal,
            PredictionLabel::Abnormal => Self::Abnormal,
        }
    }
}

/// Final result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub request_id: Uuid,
    pub prediction: Prediction,
    pub confidence: f32,
    pub explanation: String,
    pub heatmap_available: bool,
    /// Base64 PNG overlay. Present iff `heatmap_available`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heatmap_image: Option<String>,
    pub model_used: String,
    pub fallback_used: bool,
    pub areas_of_interest: Vec<String>,
    pub recommended_next_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_specialist: Option<String>,
    /// Vision-model narrative requested alongside a local classification.
    /// Kept apart from `explanation`, which always comes from one source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    pub disclaimer: &'static str,
    pub processed_at: DateTime<Utc>,
}

/// Orchestrator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Normalized,
    Classified,
    ClassifierUnavailable,
    HeatmapGenerated,
    HeatmapSkipped,
    Explained,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Legal transitions. `Failed` is reachable from every non-terminal state.
    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Received, Normalized) => true,
            (Normalized, Classified | ClassifierUnavailable) => true,
            (Classified, HeatmapGenerated | HeatmapSkipped) => true,
            (HeatmapGenerated | HeatmapSkipped, Explained) => true,
            (ClassifierUnavailable, Explained) => true,
            (Explained, Done) => true,
            _ => false,
        }
    }
}
