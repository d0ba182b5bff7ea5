use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::truncate_text;

pub const DEFAULT_CONVERT_BASE_URL: &str = "https://www.md2wechat.cn/api/convert";

const CONVERT_PATH: &str = "/api/convert";
const CONVERT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    pub markdown: String,
    pub theme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<String>,
    /// `default`, `grid` or `none`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConvertEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<ConvertData>,
}

#[derive(Debug, Deserialize)]
struct ConvertData {
    #[serde(default)]
    html: String,
}

/// Markdown to WeChat-styled HTML through the hosted conversion API.
pub struct ConvertClient {
    endpoint: String,
    api_key: String,
    http: HttpClient,
}

impl ConvertClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: convert_endpoint(base_url),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn convert(&self, request: &ConvertRequest) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(CONVERT_TIMEOUT)
            .header("X-API-Key", &self.api_key)
            .json(request)
            .send()
            .with_context(|| format!("convert request failed ({})", self.endpoint))?;
        let status = response.status().as_u16();
        let body = response.text().context("convert response body read failed")?;
        let html = parse_convert_response(status, &body)?;
        info!(theme = %request.theme, html_chars = html.chars().count(), "markdown converted");
        Ok(html)
    }
}

/// Appends `/api/convert` unless the base already ends with it.
fn convert_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return DEFAULT_CONVERT_BASE_URL.to_string();
    }
    if trimmed.ends_with(CONVERT_PATH) {
        return trimmed.to_string();
    }
    format!("{}{CONVERT_PATH}", trimmed.trim_end_matches('/'))
}

fn parse_convert_response(status: u16, body: &str) -> Result<String> {
    let envelope: ConvertEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            let shape = serde_json::from_str::<Value>(body).is_ok();
            bail!(
                "convert API returned an unreadable response ({status}, {}): {}",
                if shape { err.to_string() } else { "not JSON".to_string() },
                truncate_text(body.trim(), 256)
            );
        }
    };
    if envelope.code != 0 {
        bail!(
            "convert API returned error code {}: {}",
            envelope.code,
            envelope.msg
        );
    }
    Ok(envelope.data.map(|data| data.html).unwrap_or_default())
}
