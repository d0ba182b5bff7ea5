use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Normalized failure classes shared by every image-generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorCode {
    Unauthorized,
    RateLimit,
    BadRequest,
    NotFound,
    SafetyBlocked,
    NetworkError,
    NoImage,
    EmptyData,
    WriteError,
    Unknown,
}

impl GenerationErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimit => "rate_limit",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::SafetyBlocked => "safety_blocked",
            Self::NetworkError => "network_error",
            Self::NoImage => "no_image",
            Self::EmptyData => "empty_data",
            Self::WriteError => "write_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for GenerationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error shape that leaves a generation provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{provider}] {code}: {message}")]
pub struct GenerationError {
    pub provider: String,
    pub code: GenerationErrorCode,
    pub message: String,
    pub hint: Option<String>,
    pub status: Option<u16>,
    pub causes: Vec<String>,
}

impl GenerationError {
    pub fn new(
        provider: impl Into<String>,
        code: GenerationErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            code,
            message: message.into(),
            hint: None,
            status: None,
            causes: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        if !hint.trim().is_empty() {
            self.hint = Some(hint);
        }
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        let trimmed = cause.trim();
        if !trimmed.is_empty() && self.causes.last().map(String::as_str) != Some(trimmed) {
            self.causes.push(trimmed.to_string());
        }
        self
    }

    /// Records every layer of an `anyhow` chain, skipping adjacent duplicates.
    pub fn with_cause_chain(mut self, err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            self = self.with_cause(cause.to_string());
        }
        self
    }

    pub fn to_json(&self) -> Value {
        json!({
            "provider": self.provider,
            "code": self.code,
            "message": self.message,
            "hint": self.hint,
            "status": self.status,
            "causes": self.causes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title is required")]
    MissingTitle,
    #[error("no images provided")]
    NoImages,
    #[error("too many images: {count} (max {max})")]
    TooManyImages { count: usize, max: usize },
    #[error("no articles in request")]
    NoArticles,
    /// `index` is 1-based.
    #[error("article {index}: {field} is required")]
    MissingArticleField { index: usize, field: &'static str },
}

/// A single image exhausted its upload attempts; nothing was published.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upload image {index} ({}): {message}", path.display())]
pub struct UploadError {
    /// 1-based position in the resolved image list.
    pub index: usize,
    pub path: PathBuf,
    pub attempts: u32,
    pub message: String,
    pub uploaded_media_ids: Vec<String>,
}

/// Draft creation failed after every image was uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("create draft: {message}")]
pub struct PublishError {
    pub message: String,
    pub uploaded_media_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImagePostError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl ImagePostError {
    /// Media that already landed in the remote library before the failure.
    pub fn uploaded_media_ids(&self) -> &[String] {
        match self {
            Self::Validation(_) => &[],
            Self::Upload(err) => &err.uploaded_media_ids,
            Self::Publish(err) => &err.uploaded_media_ids,
        }
    }
}
