//! Templated explanation for results produced by the local classifier.

use super::saliency::SaliencyHeatmap;
use super::types::{ClassificationResult, ImageModality, PredictionLabel};

/// Heatmap cells hotter than this are reported as areas of interest.
const AREA_OF_INTEREST_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalExplanation {
    pub text: String,
    pub areas_of_interest: Vec<String>,
    pub recommended_next_steps: Vec<String>,
    pub recommended_specialist: Option<String>,
}

pub fn explain_classification(
    result: &ClassificationResult,
    modality: ImageModality,
    body_part: Option<&str>,
    heatmap: Option<&SaliencyHeatmap>,
    uncertainty_threshold: f32,
) -> LocalExplanation {
    let subject = match body_part {
        Some(part) => format!("{} of the {part}", modality.display_name()),
        None => modality.display_name().to_string(),
    };
    let percent = (result.confidence * 100.0).round() as u32;

    let areas: Vec<String> = heatmap
        .map(|h| {
            h.regions_above(AREA_OF_INTEREST_THRESHOLD)
                .into_iter()
                .map(|r| format!("{r} region"))
                .collect()
        })
        .unwrap_or_default();

    let mut text = match result.label {
        PredictionLabel::Abnormal => format!(
            "The screening model flagged this {subject} as potentially abnormal \
             ({percent}% confidence). This does not identify a specific condition; \
             it indicates the image differs from the normal studies the model was trained on."
        ),
        PredictionLabel::Normal => format!(
            "The screening model found no abnormal pattern in this {subject} \
             ({percent}% confidence)."
        ),
    };
    if !areas.is_empty() {
        text.push_str(&format!(
            " The highlighted overlay shows where the model focused most: {}.",
            areas.join(", ")
        ));
    }
    if result.confidence < uncertainty_threshold {
        text.push_str(" Confidence is low, so this result should be treated as inconclusive.");
    }
    text.push_str(" A qualified radiologist must review the image.");

    let mut steps = vec!["Professional radiologist interpretation (mandatory)".to_string()];
    match result.label {
        PredictionLabel::Abnormal => {
            steps.push("Consult the recommended specialist about the flagged findings".into());
            steps.push("Correlate with symptoms and clinical examination".into());
        }
        PredictionLabel::Normal if result.confidence < uncertainty_threshold => {
            steps.push("Consider repeat or additional imaging if symptoms persist".into());
        }
        PredictionLabel::Normal => {
            steps.push("Discuss any ongoing symptoms with your doctor".into());
        }
    }

    LocalExplanation {
        text,
        areas_of_interest: areas,
        recommended_next_steps: steps,
        recommended_specialist: Some(specialist_for(modality, body_part).to_string()),
    }
}

fn specialist_for(modality: ImageModality, body_part: Option<&str>) -> &'static str {
    let part = body_part.unwrap_or_default().to_ascii_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| part.contains(k));
    if has(&["chest", "lung", "thorax"]) {
        "Pulmonologist or Radiologist"
    } else if modality == ImageModality::XRay && has(&["bone", "knee", "hip", "spine", "wrist", "ankle", "shoulder"]) {
        "Orthopedist or Radiologist"
    } else if has(&["brain", "head"]) {
        "Neurologist or Radiologist"
    } else {
        "Radiologist"
    }
}
