mod size;

use std::path::PathBuf;

use serde::Serialize;

pub use size::{
    resolve_size, SizeResolution, DEFAULT_ASPECT_RATIO, DEFAULT_OPENROUTER_IMAGE_SIZE,
    RESOLUTION_TIERS, SUPPORTED_ASPECT_RATIOS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenRouter,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Gemini, ProviderKind::OpenRouter];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Some(Self::Gemini),
            "openrouter" | "open-router" | "open_router" => Some(Self::OpenRouter),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Gemini => "Gemini",
            Self::OpenRouter => "OpenRouter",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => "gemini-3-pro-image-preview",
            Self::OpenRouter => "google/gemini-3-pro-image-preview",
        }
    }

    pub fn default_api_base(self) -> &'static str {
        match self {
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    pub fn supported_models(self) -> &'static [&'static str] {
        match self {
            Self::Gemini => &[
                "gemini-3-pro-image-preview",
                "gemini-2.5-flash-preview-image",
                "gemini-2.0-flash-exp-image-generation",
            ],
            Self::OpenRouter => &[
                "google/gemini-3-pro-image-preview",
                "google/gemini-2.5-flash-image-preview",
                "black-forest-labs/flux.2-pro",
                "black-forest-labs/flux.2-flex",
                "sourceful/riverflow-v2-standard-preview",
                "sourceful/riverflow-v2-fast",
                "sourceful/riverflow-v2-pro",
            ],
        }
    }
}

/// A generated image saved to local disk. The caller owns the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub provider: String,
    pub path: PathBuf,
    pub model: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
}
