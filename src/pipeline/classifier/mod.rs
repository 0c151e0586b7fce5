pub mod backbone;
pub mod head;
pub mod manifest;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod service;

use std::path::PathBuf;

use thiserror::Error;

pub use backbone::{Backbone, MockBackbone, NativeConvBackbone};
pub use head::LinearHead;
pub use manifest::{BackboneSpec, HeadSpec, InputSpec, ModelManifest, MANIFEST_FILE};
pub use model::{ClassifierModel, GradientCapture};
pub use service::{ClassificationAttempt, ClassifierService, UnavailableReason};

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Classifier weights not found: {0}")]
    WeightsNotFound(PathBuf),

    #[error("Invalid model artifact: {0}")]
    Artifact(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Classifier invariant violated: {0}")]
    Invariant(String),
}

impl ClassifierError {
    /// Absent artifact, as opposed to a present-but-broken one.
    pub fn is_missing_artifact(&self) -> bool {
        matches!(self, Self::WeightsNotFound(_))
    }
}
