use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use ndarray::{Array3, Axis};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::backbone::{Backbone, NativeConvBackbone};
use super::head::LinearHead;
use super::manifest::{BackboneSpec, InputSpec, ModelManifest};
use super::ClassifierError;
use crate::pipeline::types::{CanonicalImage, ClassificationResult, ImageModality, PredictionLabel};

/// Backbone plus the activations captured during the current Grad-CAM pass.
struct ModelState {
    backbone: Box<dyn Backbone>,
    captured: Option<Array3<f32>>,
}

/// Loaded binary classifier. Inference-only; one instance per process.
pub struct ClassifierModel {
    manifest: ModelManifest,
    head: LinearHead,
    state: Mutex<ModelState>,
}

/// Last-conv activations and the target logit's gradient with respect to them.
#[derive(Debug, Clone)]
pub struct GradientCapture {
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
    pub target: PredictionLabel,
}

impl ClassifierModel {
    /// Load manifest + backbone from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ClassifierError> {
        let start = Instant::now();
        let manifest = ModelManifest::load(model_dir)?;
        let weights_path = manifest.weights_path(model_dir);
        if !weights_path.exists() {
            return Err(ClassifierError::WeightsNotFound(weights_path));
        }

        if let Some(expected) = &manifest.weights_sha256 {
            verify_checksum(&weights_path, expected)?;
        }

        let backbone: Box<dyn Backbone> = match &manifest.backbone {
            BackboneSpec::Native { .. } => Box::new(NativeConvBackbone::load(&weights_path)?),
            #[cfg(feature = "onnx")]
            BackboneSpec::Onnx { intra_threads, .. } => Box::new(
                super::onnx::OnnxBackbone::load(&weights_path, *intra_threads)?,
            ),
            #[cfg(not(feature = "onnx"))]
            BackboneSpec::Onnx { .. } => {
                return Err(ClassifierError::Artifact(
                    "ONNX backbone requires the `onnx` feature".into(),
                ))
            }
        };

        let model = Self::from_parts(manifest, backbone)?;
        info!(
            model = %model.id(),
            backbone = model.backbone_name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Classifier loaded"
        );
        Ok(model)
    }

    pub fn from_parts(
        manifest: ModelManifest,
        backbone: Box<dyn Backbone>,
    ) -> Result<Self, ClassifierError> {
        manifest.validate()?;
        let head = LinearHead::from_spec(&manifest.head)?;
        Ok(Self {
            manifest,
            head,
            state: Mutex::new(ModelState {
                backbone,
                captured: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.manifest.label()
    }

    pub fn input_spec(&self) -> &InputSpec {
        &self.manifest.input
    }

    pub fn serves(&self, modality: ImageModality) -> bool {
        self.manifest.serves(modality)
    }

    fn backbone_name(&self) -> String {
        self.lock()
            .map(|s| s.backbone.name().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ModelState>, ClassifierError> {
        self.state
            .lock()
            .map_err(|_| ClassifierError::Inference("Model lock poisoned".into()))
    }

    fn check_input(&self, canonical: &CanonicalImage) -> Result<(), ClassifierError> {
        let size = self.manifest.input.size as usize;
        if canonical.tensor.dim() != (3, size, size) {
            return Err(ClassifierError::Invariant(format!(
                "input tensor {:?} does not match model input [3, {size}, {size}]",
                canonical.tensor.dim()
            )));
        }
        Ok(())
    }

    /// Classify one canonical image. Deterministic for a given model.
    pub fn predict(&self, canonical: &CanonicalImage) -> Result<ClassificationResult, ClassifierError> {
        self.check_input(canonical)?;
        let start = Instant::now();

        let activations = {
            let mut state = self.lock()?;
            state.backbone.forward(canonical.tensor.view())?
        };
        let logits = self.head.logits(&activations)?;
        let probability = self.head.abnormal_probability(&logits);
        if !probability.is_finite() {
            return Err(ClassifierError::Invariant(format!(
                "non-finite probability from logits {logits:?}"
            )));
        }

        let activation_map = activations
            .mean_axis(Axis(0))
            .ok_or_else(|| ClassifierError::Invariant("activation tensor has no channels".into()))?;
        let result = ClassificationResult::from_probability(probability, activation_map);

        debug!(
            model = %self.id(),
            label = result.label.as_str(),
            confidence = result.confidence,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prediction"
        );
        Ok(result)
    }

    /// Forward + backward for Grad-CAM, holding the model lock for the whole
    /// sequence. Captured buffers are cleared on every exit path.
    pub fn capture(
        &self,
        canonical: &CanonicalImage,
        target: PredictionLabel,
    ) -> Result<GradientCapture, ClassifierError> {
        self.check_input(canonical)?;
        let mut guard = self.lock()?;
        let scope = CaptureScope { state: &mut guard };

        let activations = scope.state.backbone.forward(canonical.tensor.view())?;
        scope.state.captured = Some(activations);

        let captured = scope
            .state
            .captured
            .as_ref()
            .ok_or_else(|| ClassifierError::Invariant("activation capture missing".into()))?;
        let gradients = self.head.logit_gradient(target, captured)?;

        if gradients.dim() != captured.dim() {
            return Err(ClassifierError::Invariant(format!(
                "gradient shape {:?} differs from activation shape {:?}",
                gradients.dim(),
                captured.dim()
            )));
        }

        Ok(GradientCapture {
            activations: captured.clone(),
            gradients,
            target,
        })
    }

    #[cfg(test)]
    fn has_captured_state(&self) -> bool {
        self.lock().map(|s| s.captured.is_some()).unwrap_or(true)
    }
}

/// Releases captured activations when dropped.
struct CaptureScope<'a> {
    state: &'a mut ModelState,
}

impl Drop for CaptureScope<'_> {
    fn drop(&mut self) {
        self.state.captured = None;
    }
}

fn verify_checksum(path: &Path, expected: &str) -> Result<(), ClassifierError> {
    let bytes = std::fs::read(path)?;
    let actual = format!("{:x}", Sha256::digest(&bytes));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(ClassifierError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
