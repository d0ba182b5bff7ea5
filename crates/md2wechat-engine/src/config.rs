use std::env;
use std::time::Duration;

use anyhow::{bail, Result};
use md2wechat_contracts::images::ProviderKind;

use crate::convert::DEFAULT_CONVERT_BASE_URL;
use crate::providers::ProviderSettings;

pub const DEFAULT_WECHAT_API_BASE: &str = "https://api.weixin.qq.com";

const DEFAULT_IMAGE_REQUEST_TIMEOUT_S: f64 = 120.0;
const MIN_IMAGE_REQUEST_TIMEOUT_S: f64 = 15.0;
const MAX_IMAGE_REQUEST_TIMEOUT_S: f64 = 300.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WechatCredentials {
    pub app_id: String,
    pub secret: String,
}

/// Process configuration read once from the environment and passed down
/// explicitly to every client that needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub wechat_app_id: Option<String>,
    pub wechat_secret: Option<String>,
    pub wechat_api_base: String,
    /// Raw `IMAGE_PROVIDER`; parsed only by commands that generate images.
    pub image_provider: Option<String>,
    pub image_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub image_api_base: Option<String>,
    pub image_model: Option<String>,
    pub image_size: String,
    pub image_request_timeout: Duration,
    pub convert_api_key: Option<String>,
    pub convert_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    /// Builds a config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let image_request_timeout = get("IMAGE_REQUEST_TIMEOUT")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_IMAGE_REQUEST_TIMEOUT_S)
            .clamp(MIN_IMAGE_REQUEST_TIMEOUT_S, MAX_IMAGE_REQUEST_TIMEOUT_S);

        Ok(Self {
            wechat_app_id: get("WECHAT_APPID"),
            wechat_secret: get("WECHAT_SECRET"),
            wechat_api_base: get("WECHAT_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_WECHAT_API_BASE.to_string()),
            image_provider: get("IMAGE_PROVIDER"),
            image_api_key: get("IMAGE_API_KEY"),
            gemini_api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            image_api_base: get("IMAGE_API_BASE"),
            image_model: get("IMAGE_MODEL"),
            image_size: get("IMAGE_SIZE").unwrap_or_default(),
            image_request_timeout: Duration::from_secs_f64(image_request_timeout),
            convert_api_key: get("MD2WECHAT_API_KEY"),
            convert_base_url: get("MD2WECHAT_BASE_URL")
                .unwrap_or_else(|| DEFAULT_CONVERT_BASE_URL.to_string()),
        })
    }

    pub fn wechat_credentials(&self) -> Result<WechatCredentials> {
        match (self.wechat_app_id.as_ref(), self.wechat_secret.as_ref()) {
            (Some(app_id), Some(secret)) => Ok(WechatCredentials {
                app_id: app_id.clone(),
                secret: secret.clone(),
            }),
            _ => bail!("WECHAT_APPID and WECHAT_SECRET must be set"),
        }
    }

    /// The provider the `IMAGE_*` settings were written for; OpenRouter when
    /// unset.
    pub fn configured_provider(&self) -> Result<ProviderKind> {
        match self.image_provider.as_deref() {
            None => Ok(ProviderKind::OpenRouter),
            Some(raw) => match ProviderKind::parse(raw) {
                Some(kind) => Ok(kind),
                None => bail!("unsupported IMAGE_PROVIDER '{raw}' (expected gemini or openrouter)"),
            },
        }
    }

    /// `IMAGE_API_KEY` for the configured provider, otherwise the
    /// provider's own key.
    pub fn image_api_key_for(&self, kind: ProviderKind) -> Option<String> {
        let generic = self
            .configured_provider()
            .ok()
            .filter(|configured| *configured == kind)
            .and_then(|_| self.image_api_key.clone());
        generic.or_else(|| match kind {
            ProviderKind::Gemini => self.gemini_api_key.clone(),
            ProviderKind::OpenRouter => self.openrouter_api_key.clone(),
        })
    }

    /// Provider settings with optional per-invocation overrides.
    ///
    /// `IMAGE_API_KEY`, `IMAGE_API_BASE` and `IMAGE_MODEL` belong to the
    /// configured provider; an explicit `kind` naming another provider gets
    /// that provider's key and defaults instead.
    pub fn provider_settings(
        &self,
        kind: Option<ProviderKind>,
        model: Option<&str>,
        size: Option<&str>,
    ) -> Result<ProviderSettings> {
        let (kind, configured) = match kind {
            Some(kind) => (kind, self.configured_provider().ok() == Some(kind)),
            None => (self.configured_provider()?, true),
        };
        let Some(api_key) = self.image_api_key_for(kind) else {
            let fallback = match kind {
                ProviderKind::Gemini => "GEMINI_API_KEY or GOOGLE_API_KEY",
                ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            };
            if configured {
                bail!("IMAGE_API_KEY or {fallback} must be set for {}", kind.display_name());
            }
            bail!("{fallback} must be set for {}", kind.display_name());
        };

        let mut settings = ProviderSettings::new(kind, api_key);
        if configured {
            if let Some(base) = self.image_api_base.as_deref() {
                settings.api_base = base.trim_end_matches('/').to_string();
            }
        }
        let configured_model = self.image_model.as_deref().filter(|_| configured);
        if let Some(model) = model
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or(configured_model)
        {
            settings.model = model.to_string();
        }
        settings.size = size
            .map(str::to_string)
            .unwrap_or_else(|| self.image_size.clone());
        settings.request_timeout = self.image_request_timeout;
        Ok(settings)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
