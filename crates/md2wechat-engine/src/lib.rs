mod config;
mod convert;
mod pipeline;
mod providers;
mod wechat;

use std::path::Path;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Response as HttpResponse;
use serde_json::Value;

pub use config::{Config, WechatCredentials, DEFAULT_WECHAT_API_BASE};
pub use convert::{ConvertClient, ConvertRequest, DEFAULT_CONVERT_BASE_URL};
pub use pipeline::{
    probe_image, DryRunPublisher, ImagePostPipeline, MaterialPublisher, UPLOAD_MAX_ATTEMPTS,
};
pub use providers::{
    build_provider, decode_data_url, extension_for_mime, GeminiProvider, ImageBytes,
    ImageProvider, OpenRouterProvider, ProviderSettings,
};
pub use wechat::{MaterialUpload, WechatClient, DRAFT_CONSOLE_URL};

/// `abcd***wxyz` for log lines; short ids are fully hidden.
pub fn mask_media_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() < 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{service} returned invalid JSON payload"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}
