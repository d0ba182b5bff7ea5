use md2wechat_contracts::errors::{GenerationError, GenerationErrorCode};
use md2wechat_contracts::images::{resolve_size, GenerationResult, ProviderKind, SizeResolution};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{
    classify_error_text, decode_data_url, network_error, save_generated_image, ImageProvider,
    ProviderSettings,
};
use crate::truncate_text;

const PROVIDER: &str = "OpenRouter";
const HTTP_REFERER: &str = "https://md2wechat.cn";
const X_TITLE: &str = "md2wechat";

/// OpenRouter chat-completions with image output; the image arrives as a
/// base64 data URL.
pub struct OpenRouterProvider {
    settings: ProviderSettings,
    size: SizeResolution,
    http: HttpClient,
}

impl OpenRouterProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        let size = resolve_size(&settings.size, ProviderKind::OpenRouter);
        Self {
            settings,
            size,
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.api_base.trim_end_matches('/')
        )
    }

    fn build_payload(&self, prompt: &str) -> Value {
        let mut image_config = Map::new();
        image_config.insert(
            "aspect_ratio".to_string(),
            Value::String(self.size.aspect_ratio.clone()),
        );
        if let Some(image_size) = self.size.image_size.as_ref() {
            image_config.insert("image_size".to_string(), Value::String(image_size.clone()));
        }
        json!({
            "model": self.settings.model,
            "messages": [{ "role": "user", "content": prompt }],
            "modalities": ["image"],
            "image_config": Value::Object(image_config),
        })
    }
}

impl ImageProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
    }

    fn generate(&self, prompt: &str) -> Result<GenerationResult, GenerationError> {
        let endpoint = self.endpoint();
        let payload = self.build_payload(prompt);
        debug!(%endpoint, model = %self.settings.model, "openrouter generate request");

        let response = self
            .http
            .post(&endpoint)
            .timeout(self.settings.request_timeout)
            .header(AUTHORIZATION, format!("Bearer {}", self.settings.api_key))
            .header("HTTP-Referer", HTTP_REFERER)
            .header("X-Title", X_TITLE)
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
                "OpenRouter returned an invalid JSON payload",
            )
            .with_cause(err.to_string())
        })?;
        let data_url = first_image_url(&parsed)?;
        let image = decode_data_url(data_url).map_err(|err| {
            GenerationError::new(
                PROVIDER,
                GenerationErrorCode::Unknown,
                "image data URL could not be parsed",
            )
            .with_cause_chain(&err)
        })?;
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

/// `choices[0].message.images[0].image_url.url`
fn first_image_url(payload: &Value) -> Result<&str, GenerationError> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("images"))
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(|image| image.get("image_url"))
        .and_then(|image_url| image_url.get("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GenerationError::new(PROVIDER, GenerationErrorCode::NoImage, "no image was generated")
                .with_hint("the prompt may violate the content policy; try rewording it")
        })
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
        .unwrap_or_default();
    let (code, message, hint) = match status {
        401 => (
            GenerationErrorCode::Unauthorized,
            "OpenRouter API key is invalid or expired".to_string(),
            "check IMAGE_API_KEY or OPENROUTER_API_KEY, or create a new key at openrouter.ai",
        ),
        402 | 403 => (
            GenerationErrorCode::Unauthorized,
            "OpenRouter account balance is insufficient or access is restricted".to_string(),
            "check the account balance and API permissions at openrouter.ai",
        ),
        429 => (
            GenerationErrorCode::RateLimit,
            "too many requests, retry later".to_string(),
            "OpenRouter applies rate limits; wait before retrying",
        ),
        400 => (
            GenerationErrorCode::BadRequest,
            format!("invalid request: {api_message}"),
            "check the model name and aspect ratio; supported model: google/gemini-3-pro-image-preview",
        ),
        404 => (
            GenerationErrorCode::NotFound,
            "model not found".to_string(),
            "check the model name, e.g. google/gemini-3-pro-image-preview",
        ),
        _ if classify_error_text(body) == GenerationErrorCode::SafetyBlocked => (
            GenerationErrorCode::SafetyBlocked,
            "content was blocked by the safety filter".to_string(),
            "the prompt may contain sensitive content; rephrase it and retry",
        ),
        _ => (
            GenerationErrorCode::Unknown,
            if api_message.is_empty() {
                format!("OpenRouter API returned an error (HTTP {status})")
            } else {
                format!("OpenRouter API returned an error (HTTP {status}): {api_message}")
            },
            "retry later, or check service status at openrouter.ai",
        ),
    };
    GenerationError::new(PROVIDER, code, message)
        .with_hint(hint)
        .with_status(status)
        .with_cause(format!("status {status}: {}", truncate_text(body.trim(), 512)))
}
