use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ClassifierError;
use crate::pipeline::types::ImageModality;

/// Manifest file name inside a model directory.
pub const MANIFEST_FILE: &str = "model.json";

/// ImageNet statistics, the usual pretraining distribution.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// Preprocessing constants the classifier was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(default = "default_input_size")]
    pub size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_input_size() -> u32 {
    DEFAULT_INPUT_SIZE
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            size: DEFAULT_INPUT_SIZE,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl InputSpec {
    /// Range a normalized value of channel `c` can take for 0–255 input.
    pub fn value_range(&self, channel: usize) -> (f32, f32) {
        let lo = (0.0 - self.mean[channel]) / self.std[channel];
        let hi = (1.0 - self.mean[channel]) / self.std[channel];
        (lo.min(hi), lo.max(hi))
    }
}

/// Where the last-convolutional-layer features come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackboneSpec {
    /// Convolution stack stored as JSON, evaluated in-process.
    Native { file: String },
    /// ONNX graph whose single output is the `[1, C, h, w]` feature map.
    Onnx {
        file: String,
        #[serde(default)]
        intra_threads: Option<usize>,
    },
}

impl BackboneSpec {
    pub fn file(&self) -> &str {
        match self {
            Self::Native { file } | Self::Onnx { file, .. } => file,
        }
    }
}

/// Global-average-pool + linear decision head.
///
/// One row: sigmoid of the abnormal logit. Two rows: softmax over
/// `[normal, abnormal]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_modalities")]
    pub modalities: Vec<ImageModality>,
    #[serde(default)]
    pub input: InputSpec,
    pub backbone: BackboneSpec,
    pub head: HeadSpec,
    /// Hex SHA-256 of the backbone file, checked at load.
    #[serde(default)]
    pub weights_sha256: Option<String>,
}

fn default_modalities() -> Vec<ImageModality> {
    vec![ImageModality::XRay]
}

impl ModelManifest {
    /// Read and validate `model.json` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ClassifierError> {
        let path = model_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ClassifierError::WeightsNotFound(path));
        }
        let text = std::fs::read_to_string(&path)?;
        let manifest: Self = serde_json::from_str(&text)
            .map_err(|e| ClassifierError::Artifact(format!("{}: {e}", path.display())))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.model_id.trim().is_empty() {
            return Err(ClassifierError::Artifact("model_id is empty".into()));
        }
        if self.modalities.is_empty() {
            return Err(ClassifierError::Artifact("no modalities listed".into()));
        }
        if self.input.size == 0 {
            return Err(ClassifierError::Artifact("input size is zero".into()));
        }
        if self.input.std.iter().any(|s| *s == 0.0 || !s.is_finite())
            || self.input.mean.iter().any(|m| !m.is_finite())
        {
            return Err(ClassifierError::Artifact(
                "input mean/std must be finite with non-zero std".into(),
            ));
        }
        Ok(())
    }

    pub fn weights_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(self.backbone.file())
    }

    pub fn serves(&self, modality: ImageModality) -> bool {
        self.modalities.contains(&modality)
    }

    /// Identifier reported as `modelUsed`.
    pub fn label(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "model_id": "xray-mnv2-1.0",
        "backbone": { "kind": "native", "file": "backbone.json" },
        "head": { "weight": [[0.5, -0.5]], "bias": [0.1] }
    }"#;

    #[test]
    fn minimal_manifest_gets_defaults() {
        let manifest: ModelManifest = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(manifest.input, InputSpec::default());
        assert_eq!(manifest.modalities, vec![ImageModality::XRay]);
        assert!(manifest.serves(ImageModality::XRay));
        assert!(!manifest.serves(ImageModality::Ct));
        assert_eq!(manifest.backbone.file(), "backbone.json");
        manifest.validate().unwrap();
    }

    #[test]
    fn onnx_backbone_parses() {
        let json = r#"{
            "model_id": "m",
            "modalities": ["x-ray", "ct"],
            "input": { "size": 256 },
            "backbone": { "kind": "onnx", "file": "features.onnx", "intra_threads": 4 },
            "head": { "weight": [[1.0], [-1.0]], "bias": [0.0, 0.0] }
        }"#;
        let manifest: ModelManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.input.size, 256);
        assert_eq!(manifest.input.mean, IMAGENET_MEAN);
        assert!(manifest.serves(ImageModality::Ct));
        assert!(matches!(
            manifest.backbone,
            BackboneSpec::Onnx { intra_threads: Some(4), .. }
        ));
    }

    #[test]
    fn missing_manifest_is_weights_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelManifest::load(dir.path()).unwrap_err();
        assert!(err.is_missing_artifact());
    }

    #[test]
    fn malformed_manifest_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
        let err = ModelManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::Artifact(_)));
    }

    #[test]
    fn zero_std_rejected() {
        let mut manifest: ModelManifest = serde_json::from_str(MINIMAL).unwrap();
        manifest.input.std = [0.2, 0.0, 0.2];
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn value_range_brackets_normalized_pixels() {
        let spec = InputSpec::default();
        let (lo, hi) = spec.value_range(0);
        assert!((lo - (-0.485 / 0.229)).abs() < 1e-5);
        assert!((hi - (0.515 / 0.229)).abs() < 1e-5);
    }
}
