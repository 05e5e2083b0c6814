use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait3x4,
    #[serde(rename = "4:3")]
    Landscape4x3,
    #[serde(rename = "9:16")]
    Portrait9x16,
    #[serde(rename = "16:9")]
    Landscape16x9,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Portrait9x16,
        AspectRatio::Landscape16x9,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Portrait9x16 => "9:16",
            AspectRatio::Landscape16x9 => "16:9",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().replace('/', ":").replace(' ', "");
        Self::ALL
            .into_iter()
            .find(|ratio| ratio.as_str() == normalized)
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw).ok_or_else(|| format!("Unsupported aspect ratio '{raw}'."))
    }
}

/// Parses any positive `W:H` (or `W/H`) pair, not only the fixed set.
pub fn parse_ratio_pair(raw: &str) -> Option<(f64, f64)> {
    let value = raw.trim().replace('/', ":");
    let (left, right) = value.split_once(':')?;
    let left = left.trim().parse::<f64>().ok()?;
    let right = right.trim().parse::<f64>().ok()?;
    if !left.is_finite() || !right.is_finite() || left <= 0.0 || right <= 0.0 {
        return None;
    }
    Some((left, right))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Style {
    #[default]
    None,
    Photorealistic,
    Cinematic,
    Anime,
    Watercolor,
    OilPainting,
    PixelArt,
    Sketch,
    #[serde(rename = "3d-render")]
    Render3d,
}

impl Style {
    pub const ALL: [Style; 9] = [
        Style::None,
        Style::Photorealistic,
        Style::Cinematic,
        Style::Anime,
        Style::Watercolor,
        Style::OilPainting,
        Style::PixelArt,
        Style::Sketch,
        Style::Render3d,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Style::None => "none",
            Style::Photorealistic => "photorealistic",
            Style::Cinematic => "cinematic",
            Style::Anime => "anime",
            Style::Watercolor => "watercolor",
            Style::OilPainting => "oil-painting",
            Style::PixelArt => "pixel-art",
            Style::Sketch => "sketch",
            Style::Render3d => "3d-render",
        }
    }

    /// Phrase prepended to the user prompt for text-to-image requests.
    pub fn prefix(self) -> &'static str {
        match self {
            Style::None => "",
            Style::Photorealistic => "A photorealistic, highly detailed photograph of ",
            Style::Cinematic => "A cinematic film still with dramatic lighting of ",
            Style::Anime => "An anime-style illustration of ",
            Style::Watercolor => "A soft watercolor painting of ",
            Style::OilPainting => "A textured oil painting of ",
            Style::PixelArt => "A retro pixel art image of ",
            Style::Sketch => "A pencil sketch of ",
            Style::Render3d => "A polished 3D render of ",
        }
    }

    pub fn apply(self, prompt: &str) -> String {
        format!("{}{}", self.prefix(), prompt.trim())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|style| style.key() == normalized)
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageModel {
    #[default]
    #[serde(rename = "imagen-4")]
    Imagen4,
    #[serde(rename = "imagen-4-ultra")]
    Imagen4Ultra,
    #[serde(rename = "gemini-2.5-flash-image")]
    GeminiFlashImage,
    #[serde(rename = "gemini-3-pro-image")]
    GeminiProImage,
}

impl ImageModel {
    pub const ALL: [ImageModel; 4] = [
        ImageModel::Imagen4,
        ImageModel::Imagen4Ultra,
        ImageModel::GeminiFlashImage,
        ImageModel::GeminiProImage,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ImageModel::Imagen4 => "imagen-4",
            ImageModel::Imagen4Ultra => "imagen-4-ultra",
            ImageModel::GeminiFlashImage => "gemini-2.5-flash-image",
            ImageModel::GeminiProImage => "gemini-3-pro-image",
        }
    }

    pub fn api_name(self) -> &'static str {
        match self {
            ImageModel::Imagen4 => "imagen-4.0-generate-001",
            ImageModel::Imagen4Ultra => "imagen-4.0-ultra-generate-001",
            ImageModel::GeminiFlashImage => "gemini-2.5-flash-image",
            ImageModel::GeminiProImage => "gemini-3-pro-image-preview",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImageModel::Imagen4 => "Imagen 4",
            ImageModel::Imagen4Ultra => "Imagen 4 Ultra",
            ImageModel::GeminiFlashImage => "Gemini 2.5 Flash Image",
            ImageModel::GeminiProImage => "Gemini 3 Pro Image",
        }
    }

    /// Batch models return up to four images per call and take no image inputs.
    pub fn is_batch(self) -> bool {
        matches!(self, ImageModel::Imagen4 | ImageModel::Imagen4Ultra)
    }

    pub fn requires_brokered_key(self) -> bool {
        matches!(self, ImageModel::GeminiProImage)
    }

    /// Model used for image-plus-text requests when `self` is selected.
    pub fn multimodal_target(self) -> ImageModel {
        if self.is_batch() {
            ImageModel::GeminiFlashImage
        } else {
            self
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().trim_start_matches("models/").to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|model| model.key() == normalized || model.api_name() == normalized)
    }
}

impl fmt::Display for ImageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextModel {
    #[default]
    #[serde(rename = "gemini-2.5-flash")]
    GeminiFlash,
    #[serde(rename = "gemini-2.5-pro")]
    GeminiPro,
}

impl TextModel {
    pub const ALL: [TextModel; 2] = [TextModel::GeminiFlash, TextModel::GeminiPro];

    pub fn key(self) -> &'static str {
        match self {
            TextModel::GeminiFlash => "gemini-2.5-flash",
            TextModel::GeminiPro => "gemini-2.5-pro",
        }
    }

    pub fn api_name(self) -> &'static str {
        self.key()
    }

    pub fn label(self) -> &'static str {
        match self {
            TextModel::GeminiFlash => "Gemini 2.5 Flash",
            TextModel::GeminiPro => "Gemini 2.5 Pro",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().trim_start_matches("models/").to_ascii_lowercase();
        Self::ALL.into_iter().find(|model| model.key() == normalized)
    }
}

impl fmt::Display for TextModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratio_parses_colon_and_slash_forms() {
        assert_eq!(AspectRatio::parse("16:9"), Some(AspectRatio::Landscape16x9));
        assert_eq!(AspectRatio::parse(" 9/16 "), Some(AspectRatio::Portrait9x16));
        assert_eq!(AspectRatio::parse("21:9"), None);
        assert_eq!("4:3".parse::<AspectRatio>(), Ok(AspectRatio::Landscape4x3));
    }

    #[test]
    fn aspect_ratio_serializes_as_ratio_string() -> anyhow::Result<()> {
        let raw = serde_json::to_string(&AspectRatio::Landscape16x9)?;
        assert_eq!(raw, "\"16:9\"");
        Ok(())
    }

    #[test]
    fn ratio_pair_accepts_arbitrary_positive_ratios() {
        assert_eq!(parse_ratio_pair("21:9"), Some((21.0, 9.0)));
        assert_eq!(parse_ratio_pair("3/2"), Some((3.0, 2.0)));
        assert_eq!(parse_ratio_pair("0:1"), None);
        assert_eq!(parse_ratio_pair("wide"), None);
    }

    #[test]
    fn style_prefix_is_prepended_to_prompt() {
        assert_eq!(Style::None.apply("  a fox "), "a fox");
        assert_eq!(
            Style::Photorealistic.apply("a red fox in snow"),
            "A photorealistic, highly detailed photograph of a red fox in snow"
        );
        assert_eq!(Style::parse("oil_painting"), Some(Style::OilPainting));
        assert_eq!(Style::parse("3D-Render"), Some(Style::Render3d));
    }

    #[test]
    fn image_model_capabilities() {
        assert!(ImageModel::Imagen4.is_batch());
        assert!(!ImageModel::GeminiFlashImage.is_batch());
        assert!(ImageModel::GeminiProImage.requires_brokered_key());
        assert_eq!(
            ImageModel::Imagen4Ultra.multimodal_target(),
            ImageModel::GeminiFlashImage
        );
        assert_eq!(
            ImageModel::GeminiProImage.multimodal_target(),
            ImageModel::GeminiProImage
        );
    }

    #[test]
    fn model_parse_accepts_keys_and_api_names() {
        assert_eq!(
            ImageModel::parse("models/gemini-3-pro-image-preview"),
            Some(ImageModel::GeminiProImage)
        );
        assert_eq!(ImageModel::parse("Imagen-4"), Some(ImageModel::Imagen4));
        assert_eq!(TextModel::parse("gemini-2.5-pro"), Some(TextModel::GeminiPro));
        assert_eq!(TextModel::parse("gpt-5"), None);
    }
}
