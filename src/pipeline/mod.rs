pub mod types;
pub mod normalize;
pub mod classifier;
pub mod saliency;
pub mod fallback;
pub mod explanation;
pub mod orchestrator; // RECEIVED → … → DONE | FAILED
pub mod diagnostic; // Per-request dump (TRICARE_DUMP_DIR)

use serde::Serialize;
use thiserror::Error;

use self::classifier::ClassifierError;
use self::fallback::FallbackError;
use self::normalize::NormalizeError;
use self::saliency::SaliencyError;

/// Message shown to callers for any service-side failure.
pub const GENERIC_SERVICE_MESSAGE: &str = "Failed to process medical image. Please try again.";
const FALLBACK_UNAVAILABLE_MESSAGE: &str =
    "Image analysis is temporarily unavailable. Please try again later.";

/// Who is at fault, for the calling layer's status mapping (4xx vs 5xx).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    ClientFault,
    ServiceFault,
}

/// Failure of one pipeline run.
#[derive(Error, Debug)]
pub enum ImagingError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    /// The only fallback tier failed. There is no further tier.
    #[error("Fallback explainer unavailable: {0}")]
    FallbackUnavailable(#[source] FallbackError),

    #[error("Classifier failure: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Saliency failure: {0}")]
    Saliency(#[from] SaliencyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImagingError {
    pub fn category(&self) -> FaultCategory {
        match self {
            Self::Normalize(_) => FaultCategory::ClientFault,
            Self::FallbackUnavailable(_)
            | Self::Classifier(_)
            | Self::Saliency(_)
            | Self::Internal(_) => FaultCategory::ServiceFault,
        }
    }

    /// Text safe to hand to the caller. Input errors are returned verbatim;
    /// service faults never leak internals.
    pub fn public_message(&self) -> String {
        match self {
            Self::Normalize(e) => e.to_string(),
            Self::FallbackUnavailable(_) => FALLBACK_UNAVAILABLE_MESSAGE.to_string(),
            Self::Classifier(_) | Self::Saliency(_) | Self::Internal(_) => {
                GENERIC_SERVICE_MESSAGE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_client_faults_and_verbatim() {
        let err = ImagingError::from(NormalizeError::UnsupportedFormat("empty payload".into()));
        assert_eq!(err.category(), FaultCategory::ClientFault);
        assert_eq!(err.public_message(), "Unsupported image format: empty payload");
    }

    #[test]
    fn service_faults_do_not_leak() {
        let err = ImagingError::from(ClassifierError::Invariant("tensor [3, 64, 64] vs /opt/models".into()));
        assert_eq!(err.category(), FaultCategory::ServiceFault);
        assert_eq!(err.public_message(), GENERIC_SERVICE_MESSAGE);
        assert!(!err.public_message().contains("/opt"));

        let err = ImagingError::FallbackUnavailable(FallbackError::Connection("http://10.0.0.5:11434".into()));
        assert_eq!(err.category(), FaultCategory::ServiceFault);
        assert!(!err.public_message().contains("10.0.0.5"));
    }

    #[test]
    fn fault_category_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FaultCategory::ClientFault).unwrap(),
            "\"client_fault\""
        );
    }
}
