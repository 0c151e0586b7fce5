//! ONNX Runtime backbone, behind the `onnx` feature.
//!
//! The exported graph must end at the last convolutional block: a single
//! input `[1, 3, size, size]` and a single output `[1, C, h, w]`. The decision
//! head stays in the manifest so Grad-CAM gradients can be taken analytically.

use std::path::Path;

use ndarray::{Array3, ArrayView3, Axis};
use ort::session::Session;

use super::backbone::Backbone;
use super::ClassifierError;

const DEFAULT_INTRA_THREADS: usize = 2;

pub struct OnnxBackbone {
    session: Session,
}

impl OnnxBackbone {
    pub fn load(model_path: &Path, intra_threads: Option<usize>) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::WeightsNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| ClassifierError::Artifact(e.to_string()))?
            .with_intra_threads(intra_threads.unwrap_or(DEFAULT_INTRA_THREADS))
            .map_err(|e: ort::Error| ClassifierError::Artifact(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e: ort::Error| ClassifierError::Artifact(format!("ONNX load failed: {e}")))?;

        tracing::info!(path = %model_path.display(), "ONNX backbone loaded");
        Ok(Self { session })
    }
}

impl Backbone for OnnxBackbone {
    fn forward(&mut self, input: ArrayView3<f32>) -> Result<Array3<f32>, ClassifierError> {
        use ort::value::TensorRef;

        let batched = input.insert_axis(Axis(0));
        let tensor = TensorRef::from_array_view(&batched)
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| ClassifierError::Inference(format!("ONNX inference failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("Output extraction: {e}")))?;

        // Expect [1, C, h, w].
        if shape.len() != 4 || shape[0] != 1 || shape[1..].iter().any(|d| *d <= 0) {
            return Err(ClassifierError::Invariant(format!(
                "unexpected backbone output shape {shape:?}, expected [1, C, h, w]"
            )));
        }
        let dims = (shape[1] as usize, shape[2] as usize, shape[3] as usize);
        Array3::from_shape_vec(dims, data.to_vec())
            .map_err(|e| ClassifierError::Invariant(e.to_string()))
    }

    fn name(&self) -> &str {
        "onnx"
    }
}
