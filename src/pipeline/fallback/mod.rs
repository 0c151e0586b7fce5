//! Fallback tier: a vision-capable generative model that explains the image
//! when the local classifier cannot. Exactly one tier, no retries.

pub mod ollama;

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::types::{ImageModality, Prediction};

pub use ollama::OllamaVisionExplainer;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("Fallback explainer timed out after {0}s")]
    Timeout(u64),

    #[error("Cannot reach fallback explainer at {0}")]
    Connection(String),

    #[error("Fallback explainer returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse fallback response: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    Http(String),
}

/// What the fallback sees: the displayable image plus declared context.
#[derive(Debug, Clone)]
pub struct FallbackRequest<'a> {
    /// PNG/JPEG bytes. DICOM input is sent as a windowed PNG.
    pub image_bytes: &'a [u8],
    pub modality: ImageModality,
    pub body_part: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackExplanation {
    pub prediction_guess: Prediction,
    /// Self-reported, `[0, 1]` when present.
    pub confidence: Option<f32>,
    pub explanation_text: String,
    pub observations: Vec<String>,
    pub recommended_next_steps: Vec<String>,
    pub recommended_specialist: Option<String>,
}

/// Narrow contract the orchestrator depends on.
pub trait FallbackExplainer: Send + Sync {
    /// Identifier reported as `modelUsed`.
    fn id(&self) -> String;

    /// One blocking call with a bounded timeout.
    fn explain(&self, request: &FallbackRequest<'_>) -> Result<FallbackExplanation, FallbackError>;
}

// ──────────────────────────────────────────────
// Structured answer parsing
// ──────────────────────────────────────────────

#[derive(Deserialize)]
struct AssessmentJson {
    assessment: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    observations: Vec<String>,
    explanation: String,
    #[serde(default)]
    recommended_next_steps: Vec<String>,
    #[serde(default)]
    recommended_specialist: Option<String>,
}

/// Parse the model's JSON answer. Markdown code fences and prose around the
/// object are tolerated; an unknown assessment becomes `Uncertain`.
pub fn parse_assessment(raw: &str) -> Result<FallbackExplanation, FallbackError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| FallbackError::ResponseParsing("no JSON object in response".into()))?;
    let parsed: AssessmentJson =
        serde_json::from_str(json).map_err(|e| FallbackError::ResponseParsing(e.to_string()))?;

    let explanation_text = parsed.explanation.trim().to_string();
    if explanation_text.is_empty() {
        return Err(FallbackError::ResponseParsing("empty explanation".into()));
    }
    if let Some(c) = parsed.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(FallbackError::ResponseParsing(format!(
                "confidence {c} outside [0, 1]"
            )));
        }
    }

    let prediction_guess = match parsed.assessment.trim().to_ascii_lowercase().as_str() {
        "normal" => Prediction::Normal,
        "abnormal" => Prediction::Abnormal,
        _ => Prediction::Uncertain,
    };

    Ok(FallbackExplanation {
        prediction_guess,
        confidence: parsed.confidence,
        explanation_text,
        observations: non_blank(parsed.observations),
        recommended_next_steps: non_blank(parsed.recommended_next_steps),
        recommended_specialist: parsed
            .recommended_specialist
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })
}

fn non_blank(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Outermost `{ ... }` span.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

// ──────────────────────────────────────────────
// Mock
// ──────────────────────────────────────────────

/// Test explainer with a fixed answer or a fixed failure. Counts calls.
pub struct MockFallbackExplainer {
    id: String,
    answer: Option<FallbackExplanation>,
    calls: AtomicUsize,
}

impl MockFallbackExplainer {
    pub fn new(answer: FallbackExplanation) -> Self {
        Self {
            id: "mock-vision".to_string(),
            answer: Some(answer),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with a timeout.
    pub fn failing() -> Self {
        Self {
            id: "mock-vision".to_string(),
            answer: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn abnormal() -> Self {
        Self::new(FallbackExplanation {
            prediction_guess: Prediction::Abnormal,
            confidence: Some(0.78),
            explanation_text: "Patchy opacity in the right lower zone.".into(),
            observations: vec!["Right lower zone opacity".into()],
            recommended_next_steps: vec!["Radiologist review".into()],
            recommended_specialist: Some("Pulmonologist".into()),
        })
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FallbackExplainer for MockFallbackExplainer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn explain(&self, _request: &FallbackRequest<'_>) -> Result<FallbackExplanation, FallbackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().ok_or(FallbackError::Timeout(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let raw = r#"{"assessment": "abnormal", "confidence": 0.82,
            "observations": ["Opacity in left upper lobe", "  "],
            "explanation": "There is an opacity.",
            "recommended_next_steps": ["See a radiologist"],
            "recommended_specialist": "Pulmonologist"}"#;
        let parsed = parse_assessment(raw).unwrap();
        assert_eq!(parsed.prediction_guess, Prediction::Abnormal);
        assert_eq!(parsed.confidence, Some(0.82));
        assert_eq!(parsed.observations, vec!["Opacity in left upper lobe"]);
        assert_eq!(parsed.recommended_specialist.as_deref(), Some("Pulmonologist"));
    }

    #[test]
    fn tolerates_code_fences() {
        let raw = "Here you go:\n```json\n{\"assessment\": \"Normal\", \"explanation\": \"Clear lungs.\"}\n```";
        let parsed = parse_assessment(raw).unwrap();
        assert_eq!(parsed.prediction_guess, Prediction::Normal);
        assert!(parsed.confidence.is_none());
        assert!(parsed.recommended_next_steps.is_empty());
    }

    #[test]
    fn uncertain_and_unknown_assessments_are_uncertain() {
        for label in ["uncertain", "indeterminate"] {
            let raw = format!(r#"{{"assessment": "{label}", "explanation": "Limited view."}}"#);
            assert_eq!(parse_assessment(&raw).unwrap().prediction_guess, Prediction::Uncertain);
        }
    }

    #[test]
    fn rejects_missing_or_empty_explanation() {
        assert!(parse_assessment(r#"{"assessment": "normal"}"#).is_err());
        assert!(parse_assessment(r#"{"assessment": "normal", "explanation": "  "}"#).is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let raw = r#"{"assessment": "normal", "confidence": 85, "explanation": "ok"}"#;
        assert!(matches!(parse_assessment(raw), Err(FallbackError::ResponseParsing(_))));
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_assessment("I cannot help with that.").is_err());
    }

    #[test]
    fn mock_counts_calls() {
        let mock = MockFallbackExplainer::abnormal();
        let request = FallbackRequest {
            image_bytes: &[1, 2, 3],
            modality: ImageModality::Ct,
            body_part: None,
        };
        mock.explain(&request).unwrap();
        mock.explain(&request).unwrap();
        assert_eq!(mock.call_count(), 2);

        let failing = MockFallbackExplainer::failing();
        assert!(matches!(failing.explain(&request), Err(FallbackError::Timeout(_))));
        assert_eq!(failing.call_count(), 1);
    }
}
