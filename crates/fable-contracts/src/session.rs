use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::data_url::is_image_data_url;
use crate::models::{AspectRatio, ImageModel, Style, TextModel};

pub const MAX_REFERENCE_IMAGES: usize = 4;
pub const DEFAULT_CAPTION_MAX_LEN: u32 = 60;
pub const MAX_BATCH_COUNT: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    pub aspect_ratio: AspectRatio,
    pub style: Style,
    pub image_model: ImageModel,
    pub text_model: TextModel,
    pub caption_max_len: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatio::default(),
            style: Style::default(),
            image_model: ImageModel::default(),
            text_model: TextModel::default(),
            caption_max_len: DEFAULT_CAPTION_MAX_LEN,
        }
    }
}

impl Parameters {
    /// Batch counts are only honored for a batch model with no references.
    pub fn effective_count(&self, requested: u32, reference_count: usize) -> u32 {
        if reference_count > 0 || !self.image_model.is_batch() {
            return 1;
        }
        requested.clamp(1, MAX_BATCH_COUNT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Generate,
    Describe,
    Caption,
    RemoveText,
    Expand,
    Enhance,
    Concept,
    NextSentence,
    Summarize,
    Polish,
    Translate,
    DesignFromStory,
}

impl OperationKind {
    pub fn tag(self) -> &'static str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::Describe => "describe",
            OperationKind::Caption => "caption",
            OperationKind::RemoveText => "remove-text",
            OperationKind::Expand => "expand",
            OperationKind::Enhance => "enhance",
            OperationKind::Concept => "concept",
            OperationKind::NextSentence => "next-sentence",
            OperationKind::Summarize => "summarize",
            OperationKind::Polish => "polish",
            OperationKind::Translate => "translate",
            OperationKind::DesignFromStory => "design-from-story",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            OperationKind::Generate => "Image generation",
            OperationKind::Describe => "Describe",
            OperationKind::Caption => "Caption",
            OperationKind::RemoveText => "Remove text",
            OperationKind::Expand => "Expand",
            OperationKind::Enhance => "Enhance prompt",
            OperationKind::Concept => "Concept",
            OperationKind::NextSentence => "Next sentence",
            OperationKind::Summarize => "Summarize",
            OperationKind::Polish => "Polish",
            OperationKind::Translate => "Translate",
            OperationKind::DesignFromStory => "Design from story",
        }
    }
}

/// Structured in-flight identifier: operation kind plus an optional
/// zero-based reference index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId {
    pub kind: OperationKind,
    pub target: Option<usize>,
}

impl OperationId {
    pub fn new(kind: OperationKind) -> Self {
        Self { kind, target: None }
    }

    pub fn on_reference(kind: OperationKind, index: usize) -> Self {
        Self {
            kind,
            target: Some(index),
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(index) => write!(f, "{}-ref-{}", self.kind.tag(), index + 1),
            None => f.write_str(self.kind.tag()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    Images(Vec<String>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Running,
    Succeeded(GenerationResult),
    Failed(String),
}

impl OperationState {
    pub fn is_running(&self) -> bool {
        matches!(self, OperationState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusTarget {
    CredentialField,
}

/// Local precondition failures. `Display` is the user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please enter a prompt first.")]
    EmptyPrompt,
    #[error("Please write some story text first.")]
    EmptyStory,
    #[error("Please choose a target language.")]
    EmptyLanguage,
    #[error("Please add a reference image first.")]
    NoReferenceImage,
    #[error("Reference image {} does not exist.", .0 + 1)]
    MissingReference(usize),
    #[error("Result image {} does not exist.", .0 + 1)]
    MissingResult(usize),
    #[error("You can attach at most {max} reference images.", max = MAX_REFERENCE_IMAGES)]
    ReferenceCapacity,
    #[error("Only image files can be used as reference images.")]
    NotAnImage,
    #[error("Max caption length must be a positive number.")]
    InvalidCaptionLength,
    #[error("Unsupported aspect ratio '{0}'.")]
    InvalidAspectRatio(String),
    #[error("{0} is already running.")]
    AlreadyRunning(&'static str),
}

/// The single mutable record for one user session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub prompt: String,
    pub reference_images: Vec<String>,
    pub parameters: Parameters,
    pub result_images: Vec<String>,
    pub story: String,
    pub story_summary: Option<String>,
    pub operations: BTreeMap<OperationId, OperationState>,
    /// Placeholder count for the bulk generation while it runs.
    pub expected_result_count: Option<u32>,
    pub last_error: Option<String>,
    pub focus: Option<FocusTarget>,
}

impl SessionState {
    pub fn in_flight(&self) -> BTreeSet<OperationId> {
        self.operations
            .iter()
            .filter(|(_, state)| state.is_running())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_running(&self, id: OperationId) -> bool {
        self.operations
            .get(&id)
            .map(OperationState::is_running)
            .unwrap_or(false)
    }

    pub fn operation_state(&self, id: OperationId) -> OperationState {
        self.operations.get(&id).cloned().unwrap_or_default()
    }

    pub fn reference(&self, index: usize) -> Result<&str, ValidationError> {
        if self.reference_images.is_empty() {
            return Err(ValidationError::NoReferenceImage);
        }
        self.reference_images
            .get(index)
            .map(String::as_str)
            .ok_or(ValidationError::MissingReference(index))
    }

    pub fn add_reference(&mut self, data_url: &str) -> Result<(), ValidationError> {
        if !is_image_data_url(data_url) {
            return Err(ValidationError::NotAnImage);
        }
        if self.reference_images.len() >= MAX_REFERENCE_IMAGES {
            return Err(ValidationError::ReferenceCapacity);
        }
        self.reference_images.push(data_url.trim().to_string());
        Ok(())
    }

    pub fn remove_reference(&mut self, index: usize) -> Result<String, ValidationError> {
        if index >= self.reference_images.len() {
            return Err(ValidationError::MissingReference(index));
        }
        Ok(self.reference_images.remove(index))
    }

    pub fn promote_result(&mut self, index: usize) -> Result<(), ValidationError> {
        let image = self
            .result_images
            .get(index)
            .cloned()
            .ok_or(ValidationError::MissingResult(index))?;
        self.add_reference(&image)
    }

    pub fn collapse_references_to(&mut self, data_url: String) {
        self.reference_images = vec![data_url];
    }

    pub fn set_caption_max_len(&mut self, value: u32) -> Result<(), ValidationError> {
        if value == 0 {
            return Err(ValidationError::InvalidCaptionLength);
        }
        self.parameters.caption_max_len = value;
        Ok(())
    }

    /// Marks `id` as running and clears the previous operation's error.
    pub fn begin(&mut self, id: OperationId) -> Result<(), ValidationError> {
        if self.is_running(id) {
            return Err(ValidationError::AlreadyRunning(id.kind.display_name()));
        }
        self.operations.insert(id, OperationState::Running);
        self.last_error = None;
        self.focus = None;
        Ok(())
    }

    pub fn settle(&mut self, id: OperationId, state: OperationState) {
        if id.kind == OperationKind::Generate {
            self.expected_result_count = None;
        }
        self.operations.insert(id, state);
    }

    pub fn reject(&mut self, err: &ValidationError) {
        self.last_error = Some(err.to_string());
    }
}
