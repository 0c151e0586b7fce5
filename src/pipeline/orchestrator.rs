//! Imaging pipeline orchestrator.
//!
//! One synchronous request cycle:
//! normalize → attempt classification → (heatmap | skip) → explain → outcome,
//! or normalize → classifier unavailable → fallback explainer → outcome.
//!
//! Collaborators are injected (classifier service, fallback explainer,
//! normalizer) so the whole state machine is testable with mocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::classifier::{ClassificationAttempt, ClassifierModel, ClassifierService};
use super::diagnostic::DiagnosticDump;
use super::explanation::explain_classification;
use super::fallback::{FallbackError, FallbackExplainer, FallbackExplanation, FallbackRequest};
use super::normalize::{ImageNormalizer, StandardNormalizer};
use super::saliency::{HeatmapPolicy, SaliencyMapGenerator};
use super::types::{
    AnalysisOutcome, CanonicalImage, ClassificationResult, ImageModality, PipelineState,
    RawImageInput, DISCLAIMER,
};
use super::{FaultCategory, ImagingError};
use crate::config::ImagingSettings;

/// Accepted upload extensions. Detection itself goes by magic bytes.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "dcm"];

/// Per-request caller options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisOptions {
    /// Generate a heatmap for low-confidence results even when normal.
    pub explain_regardless: bool,
    /// Also ask the fallback explainer for a narrative when the local
    /// classifier ran. Returned separately, never merged.
    pub narrative: bool,
}

/// Outcome plus the states the request went through.
#[derive(Debug)]
pub struct PipelineReport {
    pub request_id: Uuid,
    pub trace: Vec<PipelineState>,
    pub result: Result<AnalysisOutcome, ImagingError>,
}

impl PipelineReport {
    pub fn final_state(&self) -> Option<PipelineState> {
        self.trace.last().copied()
    }

    pub fn reached(&self, state: PipelineState) -> bool {
        self.trace.contains(&state)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalitySupport {
    pub modality: ImageModality,
    /// Served by the local classifier; otherwise by the fallback explainer.
    pub local_model: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedFormats {
    pub formats: Vec<&'static str>,
    pub max_file_size_bytes: usize,
    pub modalities: Vec<ModalitySupport>,
    pub fallback_model: String,
}

/// Records state transitions for one request.
struct Trace {
    states: Vec<PipelineState>,
}

impl Trace {
    fn new() -> Self {
        Self {
            states: vec![PipelineState::Received],
        }
    }

    fn enter(&mut self, next: PipelineState) {
        let current = self.current();
        debug_assert!(
            current.can_advance_to(next),
            "illegal transition {current:?} → {next:?}"
        );
        debug!(from = ?current, to = ?next, "Pipeline transition");
        self.states.push(next);
    }

    fn current(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Received)
    }
}

pub struct ImagingPipelineOrchestrator {
    classifier: Arc<ClassifierService>,
    fallback: Arc<dyn FallbackExplainer>,
    normalizer: Box<dyn ImageNormalizer>,
    saliency: SaliencyMapGenerator,
    policy: HeatmapPolicy,
    max_image_bytes: usize,
    dump_dir: Option<PathBuf>,
}

impl ImagingPipelineOrchestrator {
    pub fn new(
        classifier: Arc<ClassifierService>,
        fallback: Arc<dyn FallbackExplainer>,
        settings: &ImagingSettings,
    ) -> Self {
        Self {
            classifier,
            fallback,
            normalizer: Box::new(StandardNormalizer::new(settings.max_image_bytes)),
            saliency: SaliencyMapGenerator::new(settings.heatmap_opacity),
            policy: HeatmapPolicy {
                uncertainty_threshold: settings.uncertainty_threshold,
                always_generate: settings.always_generate_heatmap,
            },
            max_image_bytes: settings.max_image_bytes,
            dump_dir: settings.dump_dir.clone(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Box<dyn ImageNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Analyze one image. See [`run`](Self::run) for the state trace.
    pub fn analyze(
        &self,
        input: &RawImageInput,
        options: AnalysisOptions,
    ) -> Result<AnalysisOutcome, ImagingError> {
        self.run(input, options).result
    }

    /// Analyze one image and report every state entered.
    pub fn run(&self, input: &RawImageInput, options: AnalysisOptions) -> PipelineReport {
        let request_id = Uuid::new_v4();
        let _span = tracing::info_span!(
            "imaging_analysis",
            request_id = %request_id,
            modality = %input.modality(),
        )
        .entered();
        let start = Instant::now();

        let dump = DiagnosticDump::open(self.dump_dir.as_deref(), &request_id);
        let mut trace = Trace::new();
        let result = self.drive(input, options, request_id, &mut trace, dump.as_ref());

        match &result {
            Ok(outcome) => {
                trace.enter(PipelineState::Done);
                info!(
                    prediction = ?outcome.prediction,
                    confidence = outcome.confidence,
                    model = %outcome.model_used,
                    fallback_used = outcome.fallback_used,
                    heatmap = outcome.heatmap_available,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Imaging analysis complete"
                );
            }
            Err(e) => {
                let failed_at = trace.current();
                trace.enter(PipelineState::Failed);
                match e.category() {
                    FaultCategory::ClientFault => {
                        warn!(state = ?failed_at, error = %e, "Imaging analysis rejected input")
                    }
                    FaultCategory::ServiceFault => {
                        error!(state = ?failed_at, error = ?e, "Imaging analysis failed")
                    }
                }
            }
        }

        if let Some(dump) = &dump {
            if let Ok(outcome) = &result {
                dump.json("05-outcome.json", outcome);
            }
            dump.json("06-trace.json", &trace.states);
        }

        PipelineReport {
            request_id,
            trace: trace.states,
            result,
        }
    }

    fn drive(
        &self,
        input: &RawImageInput,
        options: AnalysisOptions,
        request_id: Uuid,
        trace: &mut Trace,
        dump: Option<&DiagnosticDump>,
    ) -> Result<AnalysisOutcome, ImagingError> {
        let spec = self.classifier.input_spec();
        let canonical = self.normalizer.normalize(input, &spec)?;
        trace.enter(PipelineState::Normalized);

        if let Some(dump) = dump {
            let (width, height) = canonical.original_dimensions();
            dump.json(
                "00-request.json",
                &serde_json::json!({
                    "modality": input.modality(),
                    "bodyPart": input.body_part(),
                    "bytes": input.bytes().len(),
                    "sourceFormat": canonical.source_format,
                    "width": width,
                    "height": height,
                    "inputSize": spec.size,
                }),
            );
            dump.png("01-original.png", &canonical.original);
        }

        match self.classifier.attempt(&canonical, input.modality())? {
            ClassificationAttempt::Classified { model, result } => {
                trace.enter(PipelineState::Classified);
                self.explain_locally(input, options, request_id, trace, dump, &canonical, &model, result)
            }
            ClassificationAttempt::Unavailable(reason) => {
                trace.enter(PipelineState::ClassifierUnavailable);
                info!(reason = %reason, fallback = %self.fallback.id(), "Routing to fallback explainer");

                let explanation = self
                    .request_fallback(input, &canonical)?
                    .map_err(ImagingError::FallbackUnavailable)?;
                if let Some(dump) = dump {
                    dump.json("04-fallback.json", &explanation);
                }
                trace.enter(PipelineState::Explained);
                Ok(self.fallback_outcome(request_id, explanation))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn explain_locally(
        &self,
        input: &RawImageInput,
        options: AnalysisOptions,
        request_id: Uuid,
        trace: &mut Trace,
        dump: Option<&DiagnosticDump>,
        canonical: &CanonicalImage,
        model: &ClassifierModel,
        result: ClassificationResult,
    ) -> Result<AnalysisOutcome, ImagingError> {
        if let Some(dump) = dump {
            dump.json(
                "02-classification.json",
                &serde_json::json!({
                    "model": model.id(),
                    "label": result.label,
                    "confidence": result.confidence,
                    "abnormalProbability": result.abnormal_probability,
                    "activationShape": result.activation_map.shape(),
                }),
            );
        }

        let heatmap = if self.policy.should_generate(&result, options.explain_regardless) {
            let heatmap = self.saliency.generate(model, canonical, result.label)?;
            trace.enter(PipelineState::HeatmapGenerated);
            if let Some(dump) = dump {
                dump.png("03-heatmap.png", &heatmap.overlay);
            }
            Some(heatmap)
        } else {
            trace.enter(PipelineState::HeatmapSkipped);
            None
        };
        let heatmap_image = heatmap.as_ref().map(|h| h.to_base64_png()).transpose()?;

        let local = explain_classification(
            &result,
            input.modality(),
            input.body_part(),
            heatmap.as_ref(),
            self.policy.uncertainty_threshold,
        );

        let narrative = if options.narrative {
            self.narrative(input, canonical)
        } else {
            None
        };
        trace.enter(PipelineState::Explained);

        Ok(AnalysisOutcome {
            request_id,
            prediction: result.label.into(),
            confidence: result.confidence,
            explanation: local.text,
            heatmap_available: heatmap_image.is_some(),
            heatmap_image,
            model_used: model.id().to_string(),
            fallback_used: false,
            areas_of_interest: local.areas_of_interest,
            recommended_next_steps: local.recommended_next_steps,
            recommended_specialist: local.recommended_specialist,
            narrative,
            disclaimer: DISCLAIMER,
            processed_at: Utc::now(),
        })
    }

    /// Optional narrative next to a local result. Failure only drops the
    /// narrative; the local classification stands.
    fn narrative(&self, input: &RawImageInput, canonical: &CanonicalImage) -> Option<String> {
        match self.request_fallback(input, canonical) {
            Ok(Ok(explanation)) => Some(explanation.explanation_text),
            Ok(Err(e)) => {
                warn!(error = %e, fallback = %self.fallback.id(), "Narrative unavailable, returning local result only");
                None
            }
            Err(e) => {
                warn!(error = %e, "Narrative image encoding failed");
                None
            }
        }
    }

    /// Outer error: we could not build the request. Inner: the explainer failed.
    fn request_fallback(
        &self,
        input: &RawImageInput,
        canonical: &CanonicalImage,
    ) -> Result<Result<FallbackExplanation, FallbackError>, ImagingError> {
        let encoded;
        let image_bytes: &[u8] = if canonical.source_format.is_dicom() {
            encoded = encode_png(&canonical.original)?;
            &encoded
        } else {
            input.bytes()
        };

        let request = FallbackRequest {
            image_bytes,
            modality: input.modality(),
            body_part: input.body_part(),
        };
        Ok(self.fallback.explain(&request))
    }

    fn fallback_outcome(&self, request_id: Uuid, explanation: FallbackExplanation) -> AnalysisOutcome {
        let steps = if explanation.recommended_next_steps.is_empty() {
            vec!["Professional radiologist interpretation (mandatory)".to_string()]
        } else {
            explanation.recommended_next_steps
        };

        AnalysisOutcome {
            request_id,
            prediction: explanation.prediction_guess,
            // Not self-reported: no calibrated confidence to give.
            confidence: explanation.confidence.unwrap_or(0.0),
            explanation: explanation.explanation_text,
            heatmap_available: false,
            heatmap_image: None,
            model_used: self.fallback.id(),
            fallback_used: true,
            areas_of_interest: explanation.observations,
            recommended_next_steps: steps,
            recommended_specialist: explanation
                .recommended_specialist
                .or_else(|| Some("Radiologist".to_string())),
            narrative: None,
            disclaimer: DISCLAIMER,
            processed_at: Utc::now(),
        }
    }

    /// Formats, size limit and per-modality routing.
    pub fn supported_formats(&self) -> SupportedFormats {
        SupportedFormats {
            formats: SUPPORTED_EXTENSIONS.to_vec(),
            max_file_size_bytes: self.max_image_bytes,
            modalities: ImageModality::ALL
                .iter()
                .map(|m| ModalitySupport {
                    modality: *m,
                    local_model: self.classifier.serves(*m),
                })
                .collect(),
            fallback_model: self.fallback.id(),
        }
    }
}

fn encode_png(image: &image::RgbImage) -> Result<Vec<u8>, ImagingError> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(|e| ImagingError::Internal(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}
