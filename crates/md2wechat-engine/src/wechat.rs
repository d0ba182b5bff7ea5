use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use md2wechat_contracts::posts::news::NewsDraft;
use md2wechat_contracts::posts::{DraftResult, NewspicArticle};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::WechatCredentials;
use crate::pipeline::MaterialPublisher;
use crate::providers::extension_for_mime;
use crate::{mask_media_id, mime_for_path, response_json_or_error};

/// The draft API returns no per-draft link; drafts are managed from the
/// official account console.
pub const DRAFT_CONSOLE_URL: &str = "https://mp.weixin.qq.com/";

const SERVICE: &str = "WeChat";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterialUpload {
    pub media_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Blocking client for the official-account material and draft APIs.
///
/// The access token is fetched on first use and kept for the life of the
/// client.
pub struct WechatClient {
    credentials: WechatCredentials,
    api_base: String,
    http: HttpClient,
    token: Mutex<Option<String>>,
}

impl WechatClient {
    pub fn new(credentials: WechatCredentials, api_base: impl Into<String>) -> Self {
        Self {
            credentials,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
            token: Mutex::new(None),
        }
    }

    fn access_token(&self) -> Result<String> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| anyhow!("access token lock poisoned"))?;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let endpoint = format!("{}/cgi-bin/token", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.credentials.app_id.as_str()),
                ("secret", self.credentials.secret.as_str()),
            ])
            .send()
            .with_context(|| format!("WeChat token request failed ({endpoint})"))?;
        let payload = response_json_or_error(SERVICE, response)?;
        let token = parse_access_token(&payload)?;
        debug!("wechat access token acquired");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Uploads a local image as permanent material.
    pub fn upload_image(&self, path: &Path) -> Result<MaterialUpload> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("image not found: {}", path.display()))?;
        if !metadata.is_file() {
            bail!("not a regular file: {}", path.display());
        }
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image.png")
            .to_string();
        let mut part = MultipartPart::bytes(bytes).file_name(file_name);
        if let Some(mime) = mime_for_path(path) {
            part = part
                .mime_str(mime)
                .with_context(|| format!("invalid mime '{mime}' for {}", path.display()))?;
        }
        let form = MultipartForm::new().part("media", part);

        let token = self.access_token()?;
        let endpoint = format!("{}/cgi-bin/material/add_material", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("access_token", token.as_str()), ("type", "image")])
            .multipart(form)
            .send()
            .with_context(|| format!("upload image material failed ({})", path.display()))?;
        let payload = response_json_or_error(SERVICE, response)?;
        let upload = parse_material_upload(&payload)?;
        info!(path = %path.display(), media_id = %mask_media_id(&upload.media_id), "material uploaded");
        Ok(upload)
    }

    /// Downloads an online image to a temp file and uploads it as permanent
    /// material. The temp file is removed either way.
    pub fn upload_remote_image(&self, url: &str) -> Result<MaterialUpload> {
        let downloaded = self.download_image(url)?;
        self.upload_image(downloaded.path())
    }

    fn download_image(&self, url: &str) -> Result<NamedTempFile> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("only http and https image URLs are supported: {url}");
        }
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .with_context(|| format!("download image failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download image failed ({}): {url}", status.as_u16());
        }
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());
        if let Some(mime) = mime.as_deref() {
            if !mime.starts_with("image/") {
                bail!("URL did not return an image ({mime}): {url}");
            }
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("download image body read failed ({url})"))?;
        if bytes.is_empty() {
            bail!("downloaded image is empty: {url}");
        }

        let mut file = tempfile::Builder::new()
            .prefix("md2wechat-download-")
            .suffix(extension_for_mime(mime.as_deref()))
            .tempfile()
            .context("failed to create temp file for download")?;
        file.write_all(&bytes)
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to write {}", file.path().display()))?;
        debug!(%url, bytes = bytes.len(), path = %file.path().display(), "image downloaded");
        Ok(file)
    }

    pub fn create_draft(&self, article: &NewspicArticle) -> Result<DraftResult> {
        self.submit_draft(&draft_payload(article))
    }

    /// Regular article draft from a validated [`NewsDraft`].
    pub fn create_news_draft(&self, draft: &NewsDraft) -> Result<DraftResult> {
        draft.validate()?;
        let payload = serde_json::to_value(draft.normalized())?;
        let result = self.submit_draft(&payload)?;
        info!(
            articles = draft.articles.len(),
            media_id = %mask_media_id(&result.media_id),
            "news draft created"
        );
        Ok(result)
    }

    fn submit_draft(&self, payload: &Value) -> Result<DraftResult> {
        let token = self.access_token()?;
        let endpoint = format!("{}/cgi-bin/draft/add", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("access_token", token.as_str())])
            .json(payload)
            .send()
            .context("WeChat draft request failed")?;
        let payload = response_json_or_error(SERVICE, response)?;
        parse_draft(&payload)
    }
}

impl MaterialPublisher for WechatClient {
    fn upload_material(&self, path: &Path) -> Result<String> {
        Ok(self.upload_image(path)?.media_id)
    }

    fn create_newspic_draft(&self, article: &NewspicArticle) -> Result<DraftResult> {
        self.create_draft(article)
    }
}

fn draft_payload(article: &NewspicArticle) -> Value {
    json!({ "articles": [article] })
}

/// Fails on a non-zero `errcode`; success envelopes may omit it.
fn check_errcode(payload: &Value) -> Result<()> {
    let errcode = payload.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if errcode != 0 {
        let errmsg = payload
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("WeChat API error {errcode}: {errmsg}");
    }
    Ok(())
}

fn required_str(payload: &Value, key: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("WeChat response missing '{key}'"))
}

fn parse_access_token(payload: &Value) -> Result<String> {
    check_errcode(payload)?;
    required_str(payload, "access_token")
}

fn parse_material_upload(payload: &Value) -> Result<MaterialUpload> {
    check_errcode(payload)?;
    Ok(MaterialUpload {
        media_id: required_str(payload, "media_id")?,
        url: payload
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn parse_draft(payload: &Value) -> Result<DraftResult> {
    check_errcode(payload)?;
    Ok(DraftResult {
        media_id: required_str(payload, "media_id")?,
        draft_url: DRAFT_CONSOLE_URL.to_string(),
    })
}
