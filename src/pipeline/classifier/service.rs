//! Process-wide classifier lifecycle.
//!
//! The model directory is read once, on first use or on an explicit
//! `warm_up()`. A missing or unusable artifact is remembered as
//! `Unavailable` for the life of the service and routes every request to
//! the fallback tier; it is never retried per request.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{error, info, warn};

use super::manifest::InputSpec;
use super::model::ClassifierModel;
use super::ClassifierError;
use crate::pipeline::types::{CanonicalImage, ClassificationResult, ImageModality};

enum LoadState {
    Loaded(Arc<ClassifierModel>),
    Unavailable(String),
}

/// Why the local classifier did not run for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum UnavailableReason {
    /// No usable model was loaded at startup.
    NotLoaded(String),
    /// The model exists but is not trained for this modality.
    ModalityNotServed(ImageModality),
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded(reason) => write!(f, "classifier not loaded: {reason}"),
            Self::ModalityNotServed(m) => write!(f, "classifier does not serve {m}"),
        }
    }
}

/// Outcome of the single classification step. The orchestrator branches on
/// this exhaustively: there is no other way forward.
pub enum ClassificationAttempt {
    Classified {
        model: Arc<ClassifierModel>,
        result: ClassificationResult,
    },
    Unavailable(UnavailableReason),
}

pub struct ClassifierService {
    model_dir: PathBuf,
    state: OnceLock<LoadState>,
}

impl ClassifierService {
    /// Lazy service: loads from `model_dir` on first use.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            state: OnceLock::new(),
        }
    }

    /// Service around an already-built model.
    pub fn with_model(model: ClassifierModel) -> Self {
        Self {
            model_dir: PathBuf::new(),
            state: OnceLock::from(LoadState::Loaded(Arc::new(model))),
        }
    }

    /// Service pinned to the unloaded state.
    pub fn unloaded(reason: impl Into<String>) -> Self {
        Self {
            model_dir: PathBuf::new(),
            state: OnceLock::from(LoadState::Unavailable(reason.into())),
        }
    }

    fn state(&self) -> &LoadState {
        self.state.get_or_init(|| load(&self.model_dir))
    }

    /// Force the one-time load. Returns whether a model is available.
    pub fn warm_up(&self) -> bool {
        self.is_loaded()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), LoadState::Loaded(_))
    }

    pub fn model(&self) -> Option<Arc<ClassifierModel>> {
        match self.state() {
            LoadState::Loaded(model) => Some(Arc::clone(model)),
            LoadState::Unavailable(_) => None,
        }
    }

    /// Preprocessing constants: the model's when loaded, defaults otherwise
    /// (the fallback tier consumes the original bytes, not the tensor).
    pub fn input_spec(&self) -> InputSpec {
        match self.state() {
            LoadState::Loaded(model) => model.input_spec().clone(),
            LoadState::Unavailable(_) => InputSpec::default(),
        }
    }

    pub fn serves(&self, modality: ImageModality) -> bool {
        match self.state() {
            LoadState::Loaded(model) => model.serves(modality),
            LoadState::Unavailable(_) => false,
        }
    }

    /// Run the local classifier if it is loaded and applicable.
    ///
    /// Errors are request-time inference failures only; an absent or
    /// inapplicable model is `Ok(Unavailable)`.
    pub fn attempt(
        &self,
        canonical: &CanonicalImage,
        modality: ImageModality,
    ) -> Result<ClassificationAttempt, ClassifierError> {
        let model = match self.state() {
            LoadState::Loaded(model) => Arc::clone(model),
            LoadState::Unavailable(reason) => {
                return Ok(ClassificationAttempt::Unavailable(UnavailableReason::NotLoaded(
                    reason.clone(),
                )))
            }
        };

        if !model.serves(modality) {
            return Ok(ClassificationAttempt::Unavailable(
                UnavailableReason::ModalityNotServed(modality),
            ));
        }

        let result = model.predict(canonical)?;
        Ok(ClassificationAttempt::Classified { model, result })
    }
}

fn load(model_dir: &Path) -> LoadState {
    match ClassifierModel::load(model_dir) {
        Ok(model) => LoadState::Loaded(Arc::new(model)),
        Err(e) if e.is_missing_artifact() => {
            warn!(
                model_dir = %model_dir.display(),
                error = %e,
                "Classifier weights absent, requests will use the fallback explainer"
            );
            LoadState::Unavailable(e.to_string())
        }
        Err(e) => {
            error!(
                model_dir = %model_dir.display(),
                error = %e,
                "Classifier artifact unusable, requests will use the fallback explainer"
            );
            LoadState::Unavailable(e.to_string())
        }
    }
}

impl Drop for ClassifierService {
    fn drop(&mut self) {
        if let Some(LoadState::Loaded(model)) = self.state.get() {
            info!(model = %model.id(), "Classifier service shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::model::test_support::{model_with_probability, TEST_MODEL_ID};
    use crate::pipeline::types::{PredictionLabel, SourceFormat};
    use image::RgbImage;
    use ndarray::Array3;

    fn canonical() -> CanonicalImage {
        CanonicalImage {
            tensor: Array3::zeros((3, 224, 224)),
            original: RgbImage::new(224, 224),
            source_format: SourceFormat::Png,
        }
    }

    #[test]
    fn missing_directory_is_unavailable_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = ClassifierService::new(dir.path().join("absent"));
        assert!(!service.warm_up());
        let attempt = service.attempt(&canonical(), ImageModality::XRay).unwrap();
        assert!(matches!(
            attempt,
            ClassificationAttempt::Unavailable(UnavailableReason::NotLoaded(_))
        ));
        assert_eq!(service.input_spec(), InputSpec::default());
    }

    #[test]
    fn corrupt_artifact_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(super::super::MANIFEST_FILE), "garbage").unwrap();
        let service = ClassifierService::new(dir.path());
        assert!(!service.is_loaded());
    }

    #[test]
    fn loaded_model_classifies() {
        let service = ClassifierService::with_model(model_with_probability(0.81, 224));
        assert!(service.is_loaded());
        match service.attempt(&canonical(), ImageModality::XRay).unwrap() {
            ClassificationAttempt::Classified { model, result } => {
                assert_eq!(model.id(), TEST_MODEL_ID);
                assert_eq!(result.label, PredictionLabel::Abnormal);
            }
            ClassificationAttempt::Unavailable(reason) => panic!("unexpected {reason}"),
        }
    }

    #[test]
    fn unserved_modality_is_unavailable() {
        let service = ClassifierService::with_model(model_with_probability(0.81, 224));
        let attempt = service.attempt(&canonical(), ImageModality::Mri).unwrap();
        assert!(matches!(
            attempt,
            ClassificationAttempt::Unavailable(UnavailableReason::ModalityNotServed(ImageModality::Mri))
        ));
        assert!(!service.serves(ImageModality::Ct));
    }

    #[test]
    fn model_is_shared_not_reloaded() {
        let service = ClassifierService::with_model(model_with_probability(0.3, 224));
        let a = service.model().unwrap();
        let b = service.model().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn forced_unloaded_state_sticks() {
        let service = ClassifierService::unloaded("disabled for test");
        assert!(!service.is_loaded());
        assert!(service.model().is_none());
    }
}
