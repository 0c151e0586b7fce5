use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{parse_assessment, FallbackError, FallbackExplainer, FallbackExplanation, FallbackRequest};
use crate::pipeline::types::ImageModality;

const SYSTEM_PROMPT: &str = "You are an educational medical imaging assistant producing \
preliminary, non-diagnostic observations. Professional radiologist review is always mandatory. \
Answer with a single JSON object and nothing else.";

/// Vision explainer backed by an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaVisionExplainer {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaVisionExplainer {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, FallbackError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FallbackError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> FallbackError {
        if e.is_timeout() {
            FallbackError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            FallbackError::Connection(self.base_url.clone())
        } else {
            FallbackError::Http(e.to_string())
        }
    }
}

/// Request body for Ollama /api/chat
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

/// Response body from Ollama /api/chat
#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl FallbackExplainer for OllamaVisionExplainer {
    fn id(&self) -> String {
        format!("ollama:{}", self.model)
    }

    fn explain(&self, request: &FallbackRequest<'_>) -> Result<FallbackExplanation, FallbackError> {
        let start = Instant::now();
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(request.modality, request.body_part),
                    images: vec![general_purpose::STANDARD.encode(request.image_bytes)],
                },
            ],
            stream: false,
            format: "json",
            options: ChatOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            warn!(status = status.as_u16(), model = %self.model, "Fallback explainer returned error");
            return Err(FallbackError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                FallbackError::Timeout(self.timeout_secs)
            } else {
                FallbackError::ResponseParsing(e.to_string())
            }
        })?;

        let explanation = parse_assessment(&parsed.message.content)?;
        info!(
            model = %self.model,
            assessment = ?explanation.prediction_guess,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fallback explanation received"
        );
        Ok(explanation)
    }
}

/// User prompt: systematic review, confidence rubric, exact JSON schema.
pub fn build_prompt(modality: ImageModality, body_part: Option<&str>) -> String {
    let subject = match body_part {
        Some(part) => format!("{} of the {part}", modality.display_name()),
        None => modality.display_name().to_string(),
    };
    let inventory = match modality {
        ImageModality::XRay => {
            "bones (cortical margins, alignment, joint spaces), soft tissues and gas patterns, \
             organs in view (cardiac silhouette, lung fields, diaphragm)"
        }
        ImageModality::Ct | ImageModality::Mri => {
            "parenchymal organs (density or signal, size, contours), vascular structures, \
             soft tissue planes, bone (cortical integrity, marrow)"
        }
    };

    format!(
        "Provide a pre-screening review of this {subject}.\n\
         \n\
         1. Image quality: resolution, contrast, positioning, artifacts, limitations.\n\
         2. Anatomy: catalogue visible structures: {inventory}.\n\
         3. Findings: for each, location, size, shape and characteristics; normal variant or \
            potential pathology.\n\
         4. Assessment: normal, abnormal, or uncertain when the image does not allow a call.\n\
         5. Confidence: 0.90-0.95 unambiguous, 0.80-0.89 clear, 0.70-0.79 notable uncertainty. \
            Use \"uncertain\" instead of a confidence below 0.70.\n\
         6. Recommendations in priority order: professional review, specialist, additional \
            imaging, clinical correlation, follow-up timeframe.\n\
         \n\
         Respond with exactly this JSON:\n\
         {{\n\
           \"assessment\": \"normal|abnormal|uncertain\",\n\
           \"confidence\": 0.70,\n\
           \"observations\": [\"finding with location and significance\"],\n\
           \"explanation\": \"plain-language explanation, 6-10 sentences\",\n\
           \"recommended_next_steps\": [\"Professional radiologist interpretation (mandatory)\"],\n\
           \"recommended_specialist\": \"Radiologist\"\n\
         }}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_includes_model_name() {
        let explainer = OllamaVisionExplainer::new("http://localhost:11434/", "medgemma:4b", 30).unwrap();
        assert_eq!(explainer.id(), "ollama:medgemma:4b");
        assert_eq!(explainer.base_url, "http://localhost:11434");
    }

    #[test]
    fn prompt_mentions_modality_and_body_part() {
        let prompt = build_prompt(ImageModality::Ct, Some("abdomen"));
        assert!(prompt.contains("CT scan of the abdomen"));
        assert!(prompt.contains("\"assessment\": \"normal|abnormal|uncertain\""));
        assert!(prompt.contains("vascular structures"));

        let prompt = build_prompt(ImageModality::XRay, None);
        assert!(prompt.contains("review of this X-ray."));
        assert!(prompt.contains("cardiac silhouette"));
    }

    #[test]
    fn chat_request_serializes_images_only_for_user() {
        let body = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "s".into(),
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user",
                    content: "u".into(),
                    images: vec!["AAAA".into()],
                },
            ],
            stream: false,
            format: "json",
            options: ChatOptions { temperature: 0.0 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["messages"][0].get("images").is_none());
        assert_eq!(json["messages"][1]["images"][0], "AAAA");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn unreachable_server_is_connection_or_timeout() {
        // Port 9 (discard) on localhost is closed in test environments.
        let explainer = OllamaVisionExplainer::new("http://127.0.0.1:9", "m", 2).unwrap();
        let request = FallbackRequest {
            image_bytes: &[0x89, b'P', b'N', b'G'],
            modality: ImageModality::XRay,
            body_part: None,
        };
        let err = explainer.explain(&request).unwrap_err();
        assert!(matches!(
            err,
            FallbackError::Connection(_) | FallbackError::Timeout(_) | FallbackError::Http(_)
        ));
    }
}
