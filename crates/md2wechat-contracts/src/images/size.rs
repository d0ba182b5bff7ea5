use serde::Serialize;

use super::ProviderKind;

pub const SUPPORTED_ASPECT_RATIOS: [&str; 10] = [
    "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];

pub const RESOLUTION_TIERS: [&str; 3] = ["1K", "2K", "4K"];

pub const DEFAULT_ASPECT_RATIO: &str = "1:1";

pub const DEFAULT_OPENROUTER_IMAGE_SIZE: &str = "2K";

/// (pixels, aspect ratio, resolution tier)
type SizeRow = (&'static str, &'static str, &'static str);

const GEMINI_SIZES: &[SizeRow] = &[
    ("1024x1024", "1:1", "1K"),
    ("2048x2048", "1:1", "2K"),
    ("4096x4096", "1:1", "4K"),
    ("848x1264", "2:3", "1K"),
    ("1696x2528", "2:3", "2K"),
    ("3392x5056", "2:3", "4K"),
    ("1264x848", "3:2", "1K"),
    ("2528x1696", "3:2", "2K"),
    ("5056x3392", "3:2", "4K"),
    ("896x1200", "3:4", "1K"),
    ("1792x2400", "3:4", "2K"),
    ("3584x4800", "3:4", "4K"),
    ("1200x896", "4:3", "1K"),
    ("2400x1792", "4:3", "2K"),
    ("4800x3584", "4:3", "4K"),
    ("928x1152", "4:5", "1K"),
    ("1856x2304", "4:5", "2K"),
    ("3712x4608", "4:5", "4K"),
    ("1152x928", "5:4", "1K"),
    ("2304x1856", "5:4", "2K"),
    ("4608x3712", "5:4", "4K"),
    ("768x1376", "9:16", "1K"),
    ("1536x2752", "9:16", "2K"),
    ("3072x5504", "9:16", "4K"),
    ("1376x768", "16:9", "1K"),
    ("2752x1536", "16:9", "2K"),
    ("5504x3072", "16:9", "4K"),
    ("1584x672", "21:9", "1K"),
    ("3168x1344", "21:9", "2K"),
    ("6336x2688", "21:9", "4K"),
];

const OPENROUTER_SIZES: &[SizeRow] = &[
    ("1024x1024", "1:1", "1K"),
    ("2048x2048", "1:1", "2K"),
    ("4096x4096", "1:1", "4K"),
    ("832x1248", "2:3", "1K"),
    ("1200x1800", "2:3", "2K"),
    ("2048x3072", "2:3", "4K"),
    ("1248x832", "3:2", "1K"),
    ("1800x1200", "3:2", "2K"),
    ("3072x2048", "3:2", "4K"),
    ("864x1184", "3:4", "1K"),
    ("1200x1600", "3:4", "2K"),
    ("1536x2048", "3:4", "2K"),
    ("3072x4096", "3:4", "4K"),
    ("1184x864", "4:3", "1K"),
    ("1600x1200", "4:3", "2K"),
    ("2048x1536", "4:3", "2K"),
    ("4096x3072", "4:3", "4K"),
    ("896x1152", "4:5", "1K"),
    ("1792x2240", "4:5", "2K"),
    ("3584x4480", "4:5", "4K"),
    ("1152x896", "5:4", "1K"),
    ("2240x1792", "5:4", "2K"),
    ("4480x3584", "5:4", "4K"),
    ("768x1344", "9:16", "1K"),
    ("1080x1920", "9:16", "2K"),
    ("1440x2560", "9:16", "2K"),
    ("2160x3840", "9:16", "4K"),
    ("1344x768", "16:9", "1K"),
    ("1920x1080", "16:9", "2K"),
    ("2560x1440", "16:9", "2K"),
    ("3840x2160", "16:9", "4K"),
    ("1536x672", "21:9", "1K"),
    ("3072x1344", "21:9", "2K"),
    ("6144x2688", "21:9", "4K"),
];

/// Provider-facing size parameters derived from a user size token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeResolution {
    pub aspect_ratio: String,
    pub image_size: Option<String>,
}

impl SizeResolution {
    fn new(aspect_ratio: &str, image_size: Option<&str>) -> Self {
        Self {
            aspect_ratio: aspect_ratio.to_string(),
            image_size: image_size.map(str::to_string),
        }
    }

    fn default_for(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Gemini => Self::new(DEFAULT_ASPECT_RATIO, None),
            ProviderKind::OpenRouter => {
                Self::new(DEFAULT_ASPECT_RATIO, Some(DEFAULT_OPENROUTER_IMAGE_SIZE))
            }
        }
    }
}

/// Maps `WIDTHxHEIGHT` or `W:H` onto a provider's aspect ratio and tier.
///
/// Total: tokens that match neither a canonical ratio nor a table row
/// resolve to the provider default instead of failing.
pub fn resolve_size(token: &str, kind: ProviderKind) -> SizeResolution {
    let normalized = token.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return SizeResolution::default_for(kind);
    }

    if let Some(ratio) = SUPPORTED_ASPECT_RATIOS
        .iter()
        .find(|ratio| **ratio == normalized)
    {
        return match kind {
            ProviderKind::Gemini => SizeResolution::new(ratio, None),
            ProviderKind::OpenRouter => {
                SizeResolution::new(ratio, Some(DEFAULT_OPENROUTER_IMAGE_SIZE))
            }
        };
    }

    let table = match kind {
        ProviderKind::Gemini => GEMINI_SIZES,
        ProviderKind::OpenRouter => OPENROUTER_SIZES,
    };
    table
        .iter()
        .find(|(pixels, _, _)| *pixels == normalized)
        .map(|(_, ratio, tier)| SizeResolution::new(ratio, Some(*tier)))
        .unwrap_or_else(|| SizeResolution::default_for(kind))
}
