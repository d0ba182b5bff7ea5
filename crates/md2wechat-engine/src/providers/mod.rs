mod gemini;
mod openrouter;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md2wechat_contracts::errors::{GenerationError, GenerationErrorCode};
use md2wechat_contracts::images::{GenerationResult, ProviderKind};

pub use gemini::GeminiProvider;
pub use openrouter::OpenRouterProvider;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A text-to-image backend. Every failure is a [`GenerationError`].
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn generate(&self, prompt: &str) -> Result<GenerationResult, GenerationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    /// Raw size token, `WIDTHxHEIGHT` or `W:H`.
    pub size: String,
    pub request_timeout: Duration,
    pub output_dir: PathBuf,
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            api_key: api_key.into(),
            api_base: kind.default_api_base().to_string(),
            model: kind.default_model().to_string(),
            size: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            output_dir: env::temp_dir(),
        }
    }
}

pub fn build_provider(settings: ProviderSettings) -> Box<dyn ImageProvider> {
    match settings.kind {
        ProviderKind::Gemini => Box::new(GeminiProvider::new(settings)),
        ProviderKind::OpenRouter => Box::new(OpenRouterProvider::new(settings)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// File extension (with dot) for a declared image MIME type; PNG otherwise.
pub fn extension_for_mime(mime: Option<&str>) -> &'static str {
    let Some(mime) = mime else {
        return ".png";
    };
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return ".jpg";
    }
    if lowered.contains("gif") {
        return ".gif";
    }
    if lowered.contains("webp") {
        return ".webp";
    }
    ".png"
}

/// Decodes `data:<mime>;base64,<payload>`.
pub fn decode_data_url(value: &str) -> Result<ImageBytes> {
    let trimmed = value.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        bail!("invalid data URL: missing 'data:' prefix");
    };
    let Some((meta, payload)) = rest.split_once(',') else {
        bail!("invalid data URL: no comma separator found");
    };
    let mut meta_parts = meta.split(';').map(str::trim);
    let mime = meta_parts
        .next()
        .filter(|item| !item.is_empty())
        .map(str::to_string);
    if !meta_parts.any(|item| item.eq_ignore_ascii_case("base64")) {
        bail!("invalid data URL: payload is not base64 encoded");
    }
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .context("data URL base64 decode failed")?;
    Ok(ImageBytes {
        bytes,
        mime_type: mime,
    })
}

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing nanosecond stamp, unique within this process.
fn unique_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Writes generated bytes to `md2wechat_<provider>_<stamp><ext>` in `dir`.
fn save_generated_image(
    provider: &str,
    dir: &Path,
    image: &ImageBytes,
) -> Result<PathBuf, GenerationError> {
    if image.bytes.is_empty() {
        return Err(GenerationError::new(
            provider,
            GenerationErrorCode::EmptyData,
            "image data is empty",
        )
        .with_hint("the model returned an image envelope without bytes; retry the request"));
    }
    let ext = extension_for_mime(image.mime_type.as_deref());
    let path = dir.join(format!(
        "md2wechat_{}_{}{}",
        provider.to_ascii_lowercase(),
        unique_stamp(),
        ext
    ));
    fs::write(&path, &image.bytes).map_err(|err| {
        GenerationError::new(provider, GenerationErrorCode::WriteError, "failed to save image")
            .with_hint(format!("check that {} is writable", dir.display()))
            .with_cause(format!("failed to write {}: {err}", path.display()))
    })?;
    Ok(path)
}

/// Substring classification shared by both backends' error texts.
fn classify_error_text(text: &str) -> GenerationErrorCode {
    let upper = text.to_ascii_uppercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| upper.contains(needle));
    if has(&["PERMISSION_DENIED", "PERMISSION DENIED", "UNAUTHENTICATED", "401", "403"]) {
        return GenerationErrorCode::Unauthorized;
    }
    if has(&["RESOURCE_EXHAUSTED", "QUOTA", "RATE LIMIT", "429"]) {
        return GenerationErrorCode::RateLimit;
    }
    if has(&["INVALID_ARGUMENT", "INVALID ARGUMENT", "400"]) {
        return GenerationErrorCode::BadRequest;
    }
    if has(&["NOT_FOUND", "NOT FOUND", "404"]) {
        return GenerationErrorCode::NotFound;
    }
    if has(&["SAFETY", "BLOCKED"]) {
        return GenerationErrorCode::SafetyBlocked;
    }
    GenerationErrorCode::Unknown
}

fn network_error(provider: &str, err: reqwest::Error, endpoint: &str) -> GenerationError {
    let err = anyhow::Error::new(err).context(format!("{provider} request failed ({endpoint})"));
    GenerationError::new(
        provider,
        GenerationErrorCode::NetworkError,
        "network request failed, check your connection",
    )
    .with_hint("confirm the network is reachable and the API base URL is correct")
    .with_cause_chain(&err)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use base64::Engine as _;
    use md2wechat_contracts::errors::GenerationErrorCode;
    use md2wechat_contracts::images::ProviderKind;

    use super::*;

    #[test]
    fn extension_follows_declared_mime() {
        assert_eq!(extension_for_mime(Some("image/jpeg")), ".jpg");
        assert_eq!(extension_for_mime(Some("IMAGE/JPG")), ".jpg");
        assert_eq!(extension_for_mime(Some("image/gif")), ".gif");
        assert_eq!(extension_for_mime(Some("image/webp")), ".webp");
        assert_eq!(extension_for_mime(Some("image/png")), ".png");
        assert_eq!(extension_for_mime(Some("application/octet-stream")), ".png");
        assert_eq!(extension_for_mime(None), ".png");
    }

    #[test]
    fn data_url_decodes_exact_bytes_and_mime() -> anyhow::Result<()> {
        let original = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F'];
        let url = format!("data:image/jpeg;base64,{}", BASE64.encode(&original));
        let decoded = decode_data_url(&url)?;
        assert_eq!(decoded.bytes, original);
        assert_eq!(decoded.mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(extension_for_mime(decoded.mime_type.as_deref()), ".jpg");
        Ok(())
    }

    #[test]
    fn malformed_data_urls_fail_deterministically() {
        let cases = [
            ("https://h/y.png", "missing 'data:' prefix"),
            ("data:image/png;base64", "no comma separator"),
            ("data:image/png;base64,@@not-base64@@", "base64 decode failed"),
            ("data:image/png,rawbytes", "not base64 encoded"),
        ];
        for (url, expected) in cases {
            let err = decode_data_url(url)
                .err()
                .map(|err| format!("{err:#}"))
                .unwrap_or_default();
            assert!(err.contains(expected), "{url}: {err}");
        }
    }

    #[test]
    fn save_generated_image_names_file_by_provider_and_extension() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = ImageBytes {
            bytes: b"gif-bytes".to_vec(),
            mime_type: Some("image/gif".to_string()),
        };
        let first = save_generated_image("OpenRouter", temp.path(), &image)?;
        let second = save_generated_image("OpenRouter", temp.path(), &image)?;
        assert_ne!(first, second);
        let name = first
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or_default();
        assert!(name.starts_with("md2wechat_openrouter_"));
        assert!(name.ends_with(".gif"));
        assert_eq!(fs::read(&first)?, b"gif-bytes");
        Ok(())
    }

    #[test]
    fn empty_image_bytes_are_rejected_without_writing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = ImageBytes {
            bytes: Vec::new(),
            mime_type: None,
        };
        let err = save_generated_image("Gemini", temp.path(), &image)
            .err()
            .map(|err| err.code);
        assert_eq!(err, Some(GenerationErrorCode::EmptyData));
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn unwritable_directory_maps_to_write_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("does-not-exist");
        let image = ImageBytes {
            bytes: b"png".to_vec(),
            mime_type: None,
        };
        let err = save_generated_image("Gemini", &missing, &image).err();
        assert_eq!(
            err.map(|err| err.code),
            Some(GenerationErrorCode::WriteError)
        );
        Ok(())
    }

    #[test]
    fn error_text_classifier_covers_taxonomy() {
        let cases = [
            ("403 PERMISSION_DENIED: key revoked", GenerationErrorCode::Unauthorized),
            ("RESOURCE_EXHAUSTED: quota exceeded", GenerationErrorCode::RateLimit),
            ("INVALID_ARGUMENT: bad aspect", GenerationErrorCode::BadRequest),
            ("models/x is NOT_FOUND", GenerationErrorCode::NotFound),
            ("candidate blocked by SAFETY", GenerationErrorCode::SafetyBlocked),
            ("upstream exploded", GenerationErrorCode::Unknown),
        ];
        for (text, expected) in cases {
            assert_eq!(classify_error_text(text), expected, "{text}");
        }
    }

    #[test]
    fn unique_stamps_strictly_increase() {
        let first = unique_stamp();
        let second = unique_stamp();
        assert!(second > first);
    }

    #[test]
    fn build_provider_dispatches_on_kind() {
        for kind in ProviderKind::ALL {
            let provider = build_provider(ProviderSettings::new(kind, "key"));
            assert_eq!(provider.kind(), kind);
            assert_eq!(provider.name(), kind.display_name());
        }
    }
}
