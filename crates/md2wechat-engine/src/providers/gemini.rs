use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md2wechat_contracts::errors::{GenerationError, GenerationErrorCode};
use md2wechat_contracts::images::{resolve_size, GenerationResult, ProviderKind, SizeResolution};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{
    classify_error_text, network_error, save_generated_image, ImageBytes, ImageProvider,
    ProviderSettings,
};
use crate::truncate_text;

const PROVIDER: &str = "Gemini";
const SAFETY_FINISH_REASONS: [&str; 3] = ["SAFETY", "PROHIBITED_CONTENT", "IMAGE_SAFETY"];

/// Google Gemini image generation over the REST `generateContent` endpoint.
pub struct GeminiProvider {
    settings: ProviderSettings,
    size: SizeResolution,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        let size = resolve_size(&settings.size, ProviderKind::Gemini);
        Self {
            settings,
            size,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!(
            "{}/{}:generateContent",
            self.settings.api_base.trim_end_matches('/'),
            model_path
        )
    }

    fn build_payload(&self, prompt: &str) -> Value {
        let mut image_config = Map::new();
        image_config.insert(
            "aspectRatio".to_string(),
            Value::String(self.size.aspect_ratio.clone()),
        );
        if let Some(image_size) = self.size.image_size.as_ref() {
            image_config.insert("imageSize".to_string(), Value::String(image_size.clone()));
        }
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": Value::Object(image_config),
            },
        })
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn generate(&self, prompt: &str) -> Result<GenerationResult, GenerationError> {
        let endpoint = self.endpoint_for_model(&self.settings.model);
        let payload = self.build_payload(prompt);
        debug!(%endpoint, aspect_ratio = %self.size.aspect_ratio, "gemini generate request");

        let response = self
            .http
            .post(&endpoint)
            .timeout(self.settings.request_timeout)
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&payload)
            .send()
            .map_err(|err| network_error(PROVIDER, err, &endpoint))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| network_error(PROVIDER, err, &endpoint))?;
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            GenerationError::new(
                PROVIDER,
                GenerationErrorCode::Unknown,
                "Gemini returned an invalid JSON payload",
            )
            .with_cause(err.to_string())
        })?;
        let image = extract_inline_image(&parsed)?;
        let path = save_generated_image(PROVIDER, &self.settings.output_dir, &image)?;

        Ok(GenerationResult {
            provider: PROVIDER.to_string(),
            path,
            model: self.settings.model.clone(),
            size: self.size.aspect_ratio.clone(),
            image_size: self.size.image_size.clone(),
        })
    }
}

/// First inline image across all candidates.
fn extract_inline_image(payload: &Value) -> Result<ImageBytes, GenerationError> {
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(safety_blocked(format!("prompt blocked: {reason}")));
    }

    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut blocked_reason = None;
    for candidate in &candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or("");
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let bytes = BASE64.decode(data.trim().as_bytes()).map_err(|err| {
                GenerationError::new(
                    PROVIDER,
                    GenerationErrorCode::Unknown,
                    "inline image data could not be decoded",
                )
                .with_cause(err.to_string())
            })?;
            return Ok(ImageBytes { bytes, mime_type });
        }
        if blocked_reason.is_none() {
            blocked_reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .filter(|reason| SAFETY_FINISH_REASONS.contains(reason))
                .map(str::to_string);
        }
    }

    if let Some(reason) = blocked_reason {
        return Err(safety_blocked(format!("generation stopped: {reason}")));
    }
    Err(GenerationError::new(
        PROVIDER,
        GenerationErrorCode::NoImage,
        "response contained no image",
    )
    .with_hint("the model may have answered with text only; use an image-capable model"))
}

fn safety_blocked(cause: String) -> GenerationError {
    GenerationError::new(
        PROVIDER,
        GenerationErrorCode::SafetyBlocked,
        "content was blocked by the safety filter",
    )
    .with_hint("the prompt may contain sensitive content; rephrase it and retry")
    .with_cause(cause)
}

fn classify_failure(status: u16, body: &str) -> GenerationError {
    let api_message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate_text(body.trim(), 512));
    let code = classify_error_text(&format!("{status} {body}"));
    let (message, hint) = match code {
        GenerationErrorCode::Unauthorized => (
            "Google API key is invalid or lacks permission".to_string(),
            "check IMAGE_API_KEY or GEMINI_API_KEY; keys are issued at https://aistudio.google.com/apikey",
        ),
        GenerationErrorCode::RateLimit => (
            "too many requests or quota exhausted".to_string(),
            "wait and retry, or check quota usage in Google AI Studio",
        ),
        GenerationErrorCode::BadRequest => (
            format!("invalid request: {api_message}"),
            "check the model name and size; supported model: gemini-3-pro-image-preview",
        ),
        GenerationErrorCode::NotFound => (
            "model not found".to_string(),
            "check the model name, e.g. gemini-3-pro-image-preview",
        ),
        GenerationErrorCode::SafetyBlocked => (
            "content was blocked by the safety filter".to_string(),
            "the prompt may contain sensitive content; rephrase it and retry",
        ),
        _ => (
            format!("Gemini API error: {api_message}"),
            "retry later, or see https://ai.google.dev/gemini-api/docs",
        ),
    };
    GenerationError::new(PROVIDER, code, message)
        .with_hint(hint)
        .with_status(status)
        .with_cause(format!("status {status}: {}", truncate_text(body.trim(), 512)))
}
