//! Grad-CAM saliency over the classifier's last convolutional layer.
//!
//! Flow: capture `A` and `dlogit/dA` under the model lock → class activation
//! map at feature resolution → bilinear upsample to the original raster →
//! jet palette → alpha blend over the original.

pub mod colormap;
pub mod gradcam;

use std::io::Cursor;
use std::time::Instant;

use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, RgbImage};
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::{DEFAULT_HEATMAP_OPACITY, DEFAULT_UNCERTAINTY_THRESHOLD};
use crate::pipeline::classifier::{ClassifierError, ClassifierModel, GradientCapture};
use crate::pipeline::types::{CanonicalImage, ClassificationResult, PredictionLabel};

#[derive(Error, Debug)]
pub enum SaliencyError {
    #[error("Gradient shape {gradients:?} does not match activation shape {activations:?}")]
    ShapeMismatch {
        activations: (usize, usize, usize),
        gradients: (usize, usize, usize),
    },

    #[error("Saliency invariant violated: {0}")]
    Invariant(String),

    #[error("Gradient capture failed: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Heatmap encoding failed: {0}")]
    Encode(String),
}

/// Anything that can run the forward/backward pair Grad-CAM needs.
pub trait GradientSource {
    fn capture(
        &self,
        canonical: &CanonicalImage,
        target: PredictionLabel,
    ) -> Result<GradientCapture, ClassifierError>;
}

impl GradientSource for ClassifierModel {
    fn capture(
        &self,
        canonical: &CanonicalImage,
        target: PredictionLabel,
    ) -> Result<GradientCapture, ClassifierError> {
        ClassifierModel::capture(self, canonical, target)
    }
}

/// Heatmap aligned to the original (pre-resize) image.
#[derive(Debug, Clone)]
pub struct SaliencyHeatmap {
    /// `[height, width]` in `[0, 1]`.
    pub intensity: Array2<f32>,
    /// Jet overlay blended over the original raster.
    pub overlay: RgbImage,
    pub target: PredictionLabel,
}

impl SaliencyHeatmap {
    pub fn dimensions(&self) -> (u32, u32) {
        self.overlay.dimensions()
    }

    pub fn to_png_bytes(&self) -> Result<Vec<u8>, SaliencyError> {
        let mut cursor = Cursor::new(Vec::new());
        self.overlay
            .write_to(&mut cursor, ImageFormat::Png)
            .map_err(|e| SaliencyError::Encode(e.to_string()))?;
        Ok(cursor.into_inner())
    }

    pub fn to_base64_png(&self) -> Result<String, SaliencyError> {
        Ok(general_purpose::STANDARD.encode(self.to_png_bytes()?))
    }

    /// Names of the 3×3 regions whose mean intensity exceeds `threshold`,
    /// hottest first.
    pub fn regions_above(&self, threshold: f32) -> Vec<&'static str> {
        const NAMES: [[&str; 3]; 3] = [
            ["upper left", "upper central", "upper right"],
            ["middle left", "central", "middle right"],
            ["lower left", "lower central", "lower right"],
        ];
        let (h, w) = self.intensity.dim();
        if h < 3 || w < 3 {
            return Vec::new();
        }

        let mut hot: Vec<(f32, &'static str)> = Vec::new();
        for (row, names) in NAMES.iter().enumerate() {
            for (col, name) in names.iter().enumerate() {
                let cell = self.intensity.slice(ndarray::s![
                    row * h / 3..(row + 1) * h / 3,
                    col * w / 3..(col + 1) * w / 3
                ]);
                if let Some(mean) = cell.mean() {
                    if mean > threshold {
                        hot.push((mean, *name));
                    }
                }
            }
        }
        hot.sort_by(|a, b| b.0.total_cmp(&a.0));
        hot.into_iter().map(|(_, name)| name).collect()
    }
}

/// Renders Grad-CAM heatmaps at a fixed overlay opacity.
#[derive(Debug, Clone)]
pub struct SaliencyMapGenerator {
    opacity: f32,
}

impl Default for SaliencyMapGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_HEATMAP_OPACITY)
    }
}

impl SaliencyMapGenerator {
    pub fn new(opacity: f32) -> Self {
        Self {
            opacity: opacity.clamp(0.0, 1.0),
        }
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Steps 1–8 of Grad-CAM for `target` on one image.
    pub fn generate(
        &self,
        source: &dyn GradientSource,
        canonical: &CanonicalImage,
        target: PredictionLabel,
    ) -> Result<SaliencyHeatmap, SaliencyError> {
        let start = Instant::now();
        let capture = source.capture(canonical, target)?;
        let heatmap = self.render(&capture, canonical)?;
        debug!(
            target = target.as_str(),
            features = ?capture.activations.dim(),
            size = ?heatmap.dimensions(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Saliency heatmap generated"
        );
        Ok(heatmap)
    }

    /// Steps 3–8 from an existing capture.
    pub fn render(
        &self,
        capture: &GradientCapture,
        canonical: &CanonicalImage,
    ) -> Result<SaliencyHeatmap, SaliencyError> {
        let cam = gradcam::class_activation_map(&capture.activations, &capture.gradients)
            .inspect_err(|e| {
                error!(
                    activations = ?capture.activations.dim(),
                    gradients = ?capture.gradients.dim(),
                    error = %e,
                    "Grad-CAM invariant violated"
                )
            })?;

        let (width, height) = canonical.original_dimensions();
        let intensity = gradcam::upsample_bilinear(&cam, width, height);
        let overlay = colormap::blend_overlay(&canonical.original, &intensity, self.opacity)
            .ok_or_else(|| {
                SaliencyError::Invariant(format!(
                    "upsampled map {:?} does not cover original {width}x{height}",
                    intensity.dim()
                ))
            })?;

        Ok(SaliencyHeatmap {
            intensity,
            overlay,
            target: capture.target,
        })
    }
}

/// When to pay for the backward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatmapPolicy {
    pub uncertainty_threshold: f32,
    pub always_generate: bool,
}

impl Default for HeatmapPolicy {
    fn default() -> Self {
        Self {
            uncertainty_threshold: DEFAULT_UNCERTAINTY_THRESHOLD,
            always_generate: false,
        }
    }
}

impl HeatmapPolicy {
    /// Abnormal results always get a heatmap; low-confidence results get one
    /// only when the caller asked for an explanation regardless of label.
    pub fn should_generate(&self, result: &ClassificationResult, explain_regardless: bool) -> bool {
        self.always_generate
            || result.label == PredictionLabel::Abnormal
            || (explain_regardless && result.confidence < self.uncertainty_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::model::test_support::model_with_probability;
    use crate::pipeline::types::SourceFormat;
    use image::Rgb;
    use ndarray::Array3;

    fn canonical(width: u32, height: u32) -> CanonicalImage {
        CanonicalImage {
            tensor: Array3::zeros((3, 224, 224)),
            original: RgbImage::from_pixel(width, height, Rgb([0, 0, 0])),
            source_format: SourceFormat::Png,
        }
    }

    struct MismatchedSource;

    impl GradientSource for MismatchedSource {
        fn capture(
            &self,
            _canonical: &CanonicalImage,
            target: PredictionLabel,
        ) -> Result<GradientCapture, ClassifierError> {
            Ok(GradientCapture {
                activations: Array3::zeros((4, 7, 7)),
                gradients: Array3::zeros((4, 14, 14)),
                target,
            })
        }
    }

    #[test]
    fn heatmap_matches_original_dimensions() {
        let model = model_with_probability(0.81, 224);
        let generator = SaliencyMapGenerator::default();
        for (w, h) in [(224, 224), (640, 480), (97, 311)] {
            let heatmap = generator
                .generate(&model, &canonical(w, h), PredictionLabel::Abnormal)
                .unwrap();
            assert_eq!(heatmap.dimensions(), (w, h));
            assert_eq!(heatmap.intensity.dim(), (h as usize, w as usize));
        }
    }

    #[test]
    fn hot_spot_lands_in_upper_left() {
        let model = model_with_probability(0.81, 224);
        let heatmap = SaliencyMapGenerator::default()
            .generate(&model, &canonical(210, 210), PredictionLabel::Abnormal)
            .unwrap();
        assert!(heatmap.intensity[[10, 10]] > 0.9);
        assert!(heatmap.intensity[[200, 200]] < 0.1);
        assert_eq!(heatmap.regions_above(0.5).first(), Some(&"upper left"));
    }

    #[test]
    fn shape_mismatch_surfaces_as_error() {
        let err = SaliencyMapGenerator::default()
            .generate(&MismatchedSource, &canonical(10, 10), PredictionLabel::Abnormal)
            .unwrap_err();
        assert!(matches!(err, SaliencyError::ShapeMismatch { .. }));
    }

    #[test]
    fn encodes_png_and_base64() {
        let model = model_with_probability(0.81, 224);
        let heatmap = SaliencyMapGenerator::default()
            .generate(&model, &canonical(32, 16), PredictionLabel::Abnormal)
            .unwrap();
        let png = heatmap.to_png_bytes().unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        assert!(!heatmap.to_base64_png().unwrap().is_empty());
    }

    #[test]
    fn policy_skips_confident_normal() {
        let policy = HeatmapPolicy::default();
        let normal = ClassificationResult::from_probability(0.03, Array2::zeros((1, 1)));
        assert!(!policy.should_generate(&normal, false));
        assert!(!policy.should_generate(&normal, true));
    }

    #[test]
    fn policy_generates_for_abnormal() {
        let policy = HeatmapPolicy::default();
        let abnormal = ClassificationResult::from_probability(0.81, Array2::zeros((1, 1)));
        assert!(policy.should_generate(&abnormal, false));
    }

    #[test]
    fn policy_uncertain_normal_needs_explicit_request() {
        let policy = HeatmapPolicy::default();
        let unsure = ClassificationResult::from_probability(0.45, Array2::zeros((1, 1)));
        assert!(unsure.confidence < 0.6);
        assert!(!policy.should_generate(&unsure, false));
        assert!(policy.should_generate(&unsure, true));
    }

    #[test]
    fn policy_always_mode() {
        let policy = HeatmapPolicy {
            always_generate: true,
            ..HeatmapPolicy::default()
        };
        let normal = ClassificationResult::from_probability(0.01, Array2::zeros((1, 1)));
        assert!(policy.should_generate(&normal, false));
    }
}
