use anyhow::Result;
use async_trait::async_trait;
use fable_contracts::data_url::data_url_from_base64;
use fable_contracts::models::AspectRatio;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Image,
}

impl ResponseModality {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseModality::Text => "TEXT",
            ResponseModality::Image => "IMAGE",
        }
    }
}

/// A multi-part `generateContent` call. An empty modality list leaves the
/// backend default (text) in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRequest {
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub response_modalities: Vec<ResponseModality>,
    pub aspect_ratio: Option<AspectRatio>,
}

impl ContentRequest {
    pub fn text(model: &str, parts: Vec<ContentPart>) -> Self {
        Self {
            model: model.to_string(),
            parts,
            response_modalities: Vec::new(),
            aspect_ratio: None,
        }
    }

    pub fn image(model: &str, parts: Vec<ContentPart>, aspect_ratio: Option<AspectRatio>) -> Self {
        Self {
            model: model.to_string(),
            parts,
            response_modalities: vec![ResponseModality::Image],
            aspect_ratio,
        }
    }

    pub fn image_part_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, ContentPart::InlineImage { .. }))
            .count()
    }
}

/// A batch image `predict` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictRequest {
    pub model: String,
    pub prompt: String,
    pub sample_count: u32,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendResponse {
    pub parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedOutput {
    Images(Vec<String>),
    Text(String),
    Empty,
}

impl BackendResponse {
    /// Inline images win over text; text parts are joined and trimmed.
    pub fn decode(&self) -> DecodedOutput {
        let images = self
            .parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::InlineImage { mime_type, data } if !data.is_empty() => {
                    Some(data_url_from_base64(mime_type, data))
                }
                _ => None,
            })
            .collect::<Vec<String>>();
        if !images.is_empty() {
            return DecodedOutput::Images(images);
        }
        let text = self
            .parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<&str>>()
            .join("");
        let text = text.trim();
        if text.is_empty() {
            return DecodedOutput::Empty;
        }
        DecodedOutput::Text(text.to_string())
    }
}

/// The remote generative service. Implementations make exactly one
/// request per call; no retries.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_content(
        &self,
        api_key: &str,
        request: &ContentRequest,
    ) -> Result<BackendResponse>;

    async fn predict_images(
        &self,
        api_key: &str,
        request: &PredictRequest,
    ) -> Result<BackendResponse>;
}
