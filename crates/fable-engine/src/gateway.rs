use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fable_contracts::credentials::CredentialHolder;
use fable_contracts::data_url::DataUrlPolicy;
use fable_contracts::models::{AspectRatio, ImageModel, Style, TextModel};
use fable_contracts::session::{GenerationResult, MAX_BATCH_COUNT};
use tracing::debug;

use crate::backend::{
    BackendResponse, ContentPart, ContentRequest, DecodedOutput, GenerativeBackend, PredictRequest,
};
use crate::compositor::pad_to_aspect_ratio;
use crate::prompts;

pub const NO_IMAGE_PRODUCED: &str = "The model returned no image. This usually means the API key is invalid or the selected model cannot produce images.";
pub const NO_TEXT_PRODUCED: &str = "The model returned no text.";

/// One backend call, carrying exactly the inputs that operation needs.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationRequest {
    TextToImage {
        prompt: String,
        count: u32,
        aspect_ratio: AspectRatio,
        style: Style,
        model: ImageModel,
    },
    EditImages {
        prompt: String,
        references: Vec<String>,
        model: ImageModel,
        aspect_ratio: Option<AspectRatio>,
    },
    Describe {
        image: String,
        model: TextModel,
    },
    Caption {
        image: String,
        model: TextModel,
        max_len: u32,
    },
    Enhance {
        prompt: String,
        model: TextModel,
    },
    Concept {
        prompt: String,
        model: TextModel,
    },
    Expand {
        image: String,
        target: (f64, f64),
        model: ImageModel,
    },
    NextSentence {
        story: String,
        model: TextModel,
    },
    Summarize {
        story: String,
        model: TextModel,
        max_len: u32,
    },
    Polish {
        story: String,
        model: TextModel,
    },
    Translate {
        story: String,
        language: String,
        model: TextModel,
    },
    DesignFromStory {
        story: String,
        model: TextModel,
    },
}

impl GenerationRequest {
    /// Image model the request will produce images with, if any.
    pub fn image_model(&self) -> Option<ImageModel> {
        match self {
            GenerationRequest::TextToImage { model, .. } => Some(*model),
            GenerationRequest::EditImages { model, .. }
            | GenerationRequest::Expand { model, .. } => Some(model.multimodal_target()),
            _ => None,
        }
    }

    pub fn model_key(&self) -> &'static str {
        match self {
            GenerationRequest::TextToImage { model, .. } => model.key(),
            GenerationRequest::EditImages { model, .. }
            | GenerationRequest::Expand { model, .. } => model.multimodal_target().key(),
            GenerationRequest::Describe { model, .. }
            | GenerationRequest::Caption { model, .. }
            | GenerationRequest::Enhance { model, .. }
            | GenerationRequest::Concept { model, .. }
            | GenerationRequest::NextSentence { model, .. }
            | GenerationRequest::Summarize { model, .. }
            | GenerationRequest::Polish { model, .. }
            | GenerationRequest::Translate { model, .. }
            | GenerationRequest::DesignFromStory { model, .. } => model.key(),
        }
    }
}

/// Stateless request builders over a [`GenerativeBackend`].
///
/// The active credential is read from the holder on every call.
#[derive(Clone)]
pub struct Gateway {
    backend: Arc<dyn GenerativeBackend>,
    credentials: CredentialHolder,
    data_urls: DataUrlPolicy,
}

impl Gateway {
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        credentials: CredentialHolder,
        data_urls: DataUrlPolicy,
    ) -> Self {
        Self {
            backend,
            credentials,
            data_urls,
        }
    }

    pub fn credentials(&self) -> &CredentialHolder {
        &self.credentials
    }

    pub fn data_urls(&self) -> &DataUrlPolicy {
        &self.data_urls
    }

    pub async fn execute(&self, request: GenerationRequest) -> Result<GenerationResult> {
        match request {
            GenerationRequest::TextToImage {
                prompt,
                count,
                aspect_ratio,
                style,
                model,
            } => {
                self.text_to_image(&prompt, count, aspect_ratio, style, model)
                    .await
            }
            GenerationRequest::EditImages {
                prompt,
                references,
                model,
                aspect_ratio,
            } => self.edit_images(&prompt, &references, model, aspect_ratio).await,
            GenerationRequest::Describe { image, model } => self.describe(&image, model).await,
            GenerationRequest::Caption {
                image,
                model,
                max_len,
            } => self.caption(&image, model, max_len).await,
            GenerationRequest::Enhance { prompt, model } => {
                self.text(model, prompts::enhance_instruction(&prompt)).await
            }
            GenerationRequest::Concept { prompt, model } => {
                self.text(model, prompts::concept_instruction(&prompt)).await
            }
            GenerationRequest::Expand {
                image,
                target,
                model,
            } => self.expand(&image, target, model).await,
            GenerationRequest::NextSentence { story, model } => {
                self.text(model, prompts::next_sentence_instruction(&story))
                    .await
            }
            GenerationRequest::Summarize {
                story,
                model,
                max_len,
            } => {
                self.text(model, prompts::summarize_instruction(&story, max_len))
                    .await
            }
            GenerationRequest::Polish { story, model } => {
                self.text(model, prompts::polish_instruction(&story)).await
            }
            GenerationRequest::Translate {
                story,
                language,
                model,
            } => {
                self.text(model, prompts::translate_instruction(&story, &language))
                    .await
            }
            GenerationRequest::DesignFromStory { story, model } => {
                self.text(model, prompts::design_from_story_instruction(&story))
                    .await
            }
        }
    }

    /// Batch models get one `predict` call for `count` images; multimodal
    /// models get one `generateContent` call.
    pub async fn text_to_image(
        &self,
        prompt: &str,
        count: u32,
        aspect_ratio: AspectRatio,
        style: Style,
        model: ImageModel,
    ) -> Result<GenerationResult> {
        let styled = style.apply(prompt);
        let api_key = self.credentials.get();
        let response = if model.is_batch() {
            let request = PredictRequest {
                model: model.api_name().to_string(),
                prompt: styled,
                sample_count: count.clamp(1, MAX_BATCH_COUNT),
                aspect_ratio,
            };
            debug!(
                backend = self.backend.name(),
                model = model.key(),
                count = request.sample_count,
                "text-to-image batch request"
            );
            self.backend.predict_images(&api_key, &request).await?
        } else {
            let request = ContentRequest::image(
                model.api_name(),
                vec![ContentPart::Text(styled)],
                Some(aspect_ratio),
            );
            debug!(
                backend = self.backend.name(),
                model = model.key(),
                "text-to-image request"
            );
            self.backend.generate_content(&api_key, &request).await?
        };
        expect_images(&response)
    }

    /// References are attached in order, followed by the prompt.
    pub async fn edit_images(
        &self,
        prompt: &str,
        references: &[String],
        model: ImageModel,
        aspect_ratio: Option<AspectRatio>,
    ) -> Result<GenerationResult> {
        let target = model.multimodal_target();
        let mut parts = references
            .iter()
            .map(|reference| self.inline_image(reference))
            .collect::<Vec<ContentPart>>();
        parts.push(ContentPart::Text(prompt.trim().to_string()));
        let request = ContentRequest::image(target.api_name(), parts, aspect_ratio);
        debug!(
            backend = self.backend.name(),
            model = target.key(),
            references = request.image_part_count(),
            "image edit request"
        );
        let response = self
            .backend
            .generate_content(&self.credentials.get(), &request)
            .await?;
        expect_images(&response)
    }

    pub async fn describe(&self, image: &str, model: TextModel) -> Result<GenerationResult> {
        self.vision_text(image, model, prompts::describe_instruction().to_string())
            .await
    }

    pub async fn caption(
        &self,
        image: &str,
        model: TextModel,
        max_len: u32,
    ) -> Result<GenerationResult> {
        let result = self
            .vision_text(image, model, prompts::caption_instruction(max_len))
            .await?;
        match result {
            GenerationResult::Text(text) => {
                let caption = prompts::strip_caption_quotes(&text);
                if caption.is_empty() {
                    bail!("{NO_TEXT_PRODUCED}");
                }
                Ok(GenerationResult::Text(caption))
            }
            other => Ok(other),
        }
    }

    /// Pads the image to `target` locally, then asks the image model to
    /// fill the padding.
    pub async fn expand(
        &self,
        image: &str,
        target: (f64, f64),
        model: ImageModel,
    ) -> Result<GenerationResult> {
        let padded = pad_to_aspect_ratio(&self.data_urls, image, target)
            .context("Could not prepare the image for expansion")?;
        self.edit_images(prompts::EXPAND_INSTRUCTION, &[padded], model, None)
            .await
    }

    async fn vision_text(
        &self,
        image: &str,
        model: TextModel,
        instruction: String,
    ) -> Result<GenerationResult> {
        let request = ContentRequest::text(
            model.api_name(),
            vec![self.inline_image(image), ContentPart::Text(instruction)],
        );
        debug!(
            backend = self.backend.name(),
            model = model.key(),
            "vision text request"
        );
        let response = self
            .backend
            .generate_content(&self.credentials.get(), &request)
            .await?;
        expect_text(&response)
    }

    async fn text(&self, model: TextModel, instruction: String) -> Result<GenerationResult> {
        let request = ContentRequest::text(model.api_name(), vec![ContentPart::Text(instruction)]);
        debug!(
            backend = self.backend.name(),
            model = model.key(),
            "text request"
        );
        let response = self
            .backend
            .generate_content(&self.credentials.get(), &request)
            .await?;
        expect_text(&response)
    }

    fn inline_image(&self, data_url: &str) -> ContentPart {
        let decoded = self.data_urls.decode(data_url);
        ContentPart::InlineImage {
            mime_type: decoded.media_type,
            data: decoded.payload,
        }
    }
}

fn expect_images(response: &BackendResponse) -> Result<GenerationResult> {
    match response.decode() {
        DecodedOutput::Images(images) => Ok(GenerationResult::Images(images)),
        DecodedOutput::Text(_) | DecodedOutput::Empty => bail!("{NO_IMAGE_PRODUCED}"),
    }
}

fn expect_text(response: &BackendResponse) -> Result<GenerationResult> {
    match response.decode() {
        DecodedOutput::Text(text) => {
            let cleaned = prompts::clean_text_inference(&text);
            if cleaned.is_empty() {
                bail!("{NO_TEXT_PRODUCED}");
            }
            Ok(GenerationResult::Text(cleaned))
        }
        DecodedOutput::Images(_) | DecodedOutput::Empty => bail!("{NO_TEXT_PRODUCED}"),
    }
}
