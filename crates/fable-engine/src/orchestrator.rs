use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fable_contracts::credentials::CredentialHolder;
use fable_contracts::events::{JournalEntry, OperationJournal};
use fable_contracts::models::{
    parse_ratio_pair, AspectRatio, ImageModel, ModelSelection, ModelSelector, Style, TextModel,
};
use fable_contracts::session::{
    FocusTarget, GenerationResult, OperationId, OperationKind, OperationState, SessionState,
    ValidationError,
};
use tracing::{debug, warn};

use crate::gateway::{Gateway, GenerationRequest};
use crate::prompts;

pub const CREDENTIAL_ERROR_MESSAGE: &str =
    "Your API key is invalid or missing. Enter a valid key in the API key field.";
pub const INTERRUPTED_MESSAGE: &str = "operation interrupted";

const CREDENTIAL_ERROR_PATTERNS: [&str; 5] = [
    "API_KEY_INVALID",
    "API key not valid",
    "API key expired",
    "PERMISSION_DENIED",
    "Requested entity was not found",
];

/// Host-provided key picker for models that need a brokered credential.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// The key the user already selected, if any.
    async fn selected_key(&self) -> Option<String>;

    /// Asks the user to select a key.
    async fn prompt_for_key(&self) -> anyhow::Result<Option<String>>;
}

pub fn brokered_key_required(model: ImageModel) -> String {
    format!(
        "{} requires an API key selected through the key picker. Select a key and try again.",
        model.label()
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub credential: bool,
}

/// Maps a backend error to the message shown to the user.
pub fn classify_failure(err: &anyhow::Error) -> Failure {
    let text = error_chain_text(err, 600);
    if CREDENTIAL_ERROR_PATTERNS
        .iter()
        .any(|pattern| text.contains(pattern))
    {
        return Failure {
            message: CREDENTIAL_ERROR_MESSAGE.to_string(),
            credential: true,
        };
    }
    Failure {
        message: if text.is_empty() {
            "unknown error".to_string()
        } else {
            text
        },
        credential: false,
    }
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

type Prepare = Box<dyn FnOnce(&mut SessionState) + Send>;
type Fold = Box<dyn FnOnce(&mut SessionState, &GenerationResult) + Send>;

/// What a handler dispatches, plus the state edits around the call.
struct Plan {
    request: GenerationRequest,
    prepare: Prepare,
    fold: Fold,
}

impl Plan {
    fn new(request: GenerationRequest) -> Self {
        Self {
            request,
            prepare: Box::new(|_| {}),
            fold: Box::new(|_, _| {}),
        }
    }

    fn preparing(mut self, prepare: impl FnOnce(&mut SessionState) + Send + 'static) -> Self {
        self.prepare = Box::new(prepare);
        self
    }

    fn on_text(mut self, fold: impl FnOnce(&mut SessionState, &str) + Send + 'static) -> Self {
        self.fold = Box::new(move |state, result| {
            if let GenerationResult::Text(text) = result {
                fold(state, text.as_str());
            }
        });
        self
    }

    fn on_images(
        mut self,
        fold: impl FnOnce(&mut SessionState, &[String]) + Send + 'static,
    ) -> Self {
        self.fold = Box::new(move |state, result| {
            if let GenerationResult::Images(images) = result {
                fold(state, images.as_slice());
            }
        });
        self
    }
}

/// Marks the operation failed if its future is dropped or unwinds before settling.
struct InFlightGuard<'a> {
    session: &'a Mutex<SessionState>,
    id: OperationId,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(session: &'a Mutex<SessionState>, id: OperationId) -> Self {
        Self {
            session,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock_session(self.session);
        if state.is_running(self.id) {
            state.settle(self.id, OperationState::Failed(INTERRUPTED_MESSAGE.to_string()));
        }
    }
}

fn lock_session(session: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the session state and runs every user-facing operation.
///
/// Handlers never return errors: failures land in `last_error` and in the
/// returned [`OperationState`]. Different operations may be awaited
/// concurrently; when two of them rewrite the same field, the one that
/// settles last wins.
pub struct Orchestrator {
    gateway: Gateway,
    broker: Option<Arc<dyn CredentialBroker>>,
    journal: Option<OperationJournal>,
    session: Mutex<SessionState>,
}

impl Orchestrator {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            broker: None,
            journal: None,
            session: Mutex::new(SessionState::default()),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_journal(mut self, journal: OperationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_caption_max_len(self, value: u32) -> Self {
        if value > 0 {
            self.lock().parameters.caption_max_len = value;
        }
        self
    }

    pub fn credentials(&self) -> &CredentialHolder {
        self.gateway.credentials()
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock_session(&self.session)
    }

    /// Applies a validated edit; a rejected edit only sets `last_error`.
    fn checked<T>(
        &self,
        edit: impl FnOnce(&mut SessionState) -> Result<T, ValidationError>,
    ) -> Result<T, ValidationError> {
        let mut state = self.lock();
        let result = edit(&mut *state);
        if let Err(err) = &result {
            state.reject(err);
        }
        result
    }

    pub fn set_prompt(&self, prompt: &str) {
        self.lock().prompt = prompt.to_string();
    }

    pub fn set_story(&self, story: &str) {
        let mut state = self.lock();
        state.story = story.to_string();
        state.story_summary = None;
    }

    pub fn add_reference(&self, data_url: &str) -> Result<(), ValidationError> {
        self.checked(|state| state.add_reference(data_url))
    }

    pub fn remove_reference(&self, index: usize) -> Result<String, ValidationError> {
        self.checked(|state| state.remove_reference(index))
    }

    pub fn clear_references(&self) {
        self.lock().reference_images.clear();
    }

    pub fn use_result_as_reference(&self, index: usize) -> Result<(), ValidationError> {
        self.checked(|state| state.promote_result(index))
    }

    pub fn set_aspect_ratio(&self, aspect_ratio: AspectRatio) {
        self.lock().parameters.aspect_ratio = aspect_ratio;
    }

    pub fn set_style(&self, style: Style) {
        self.lock().parameters.style = style;
    }

    pub fn set_image_model(&self, requested: Option<&str>) -> ModelSelection<ImageModel> {
        let selection = ModelSelector.select::<ImageModel>(requested);
        if let Some(reason) = &selection.fallback_reason {
            debug!(reason = reason.as_str(), "image model fallback");
        }
        self.lock().parameters.image_model = selection.model;
        selection
    }

    pub fn set_text_model(&self, requested: Option<&str>) -> ModelSelection<TextModel> {
        let selection = ModelSelector.select::<TextModel>(requested);
        if let Some(reason) = &selection.fallback_reason {
            debug!(reason = reason.as_str(), "text model fallback");
        }
        self.lock().parameters.text_model = selection.model;
        selection
    }

    pub fn set_caption_max_len(&self, value: u32) -> Result<(), ValidationError> {
        self.checked(|state| state.set_caption_max_len(value))
    }

    pub fn clear_error(&self) {
        let mut state = self.lock();
        state.last_error = None;
        state.focus = None;
    }

    /// Text-to-image without references; with references the prompt and
    /// every reference go to the multimodal image model and one image comes back.
    pub async fn generate(&self, count: u32) -> OperationState {
        self.run(OperationId::new(OperationKind::Generate), move |state| {
            let prompt = non_blank(&state.prompt).ok_or(ValidationError::EmptyPrompt)?;
            let params = &state.parameters;
            let references = state.reference_images.clone();
            let effective = params.effective_count(count, references.len());
            let request = if references.is_empty() {
                GenerationRequest::TextToImage {
                    prompt,
                    count: effective,
                    aspect_ratio: params.aspect_ratio,
                    style: params.style,
                    model: params.image_model,
                }
            } else {
                GenerationRequest::EditImages {
                    prompt,
                    references,
                    model: params.image_model,
                    aspect_ratio: Some(params.aspect_ratio),
                }
            };
            Ok(Plan::new(request)
                .preparing(move |state| {
                    state.result_images.clear();
                    state.expected_result_count = Some(effective);
                })
                .on_images(|state, images| state.result_images = images.to_vec()))
        })
        .await
    }

    pub async fn describe_reference(&self, index: usize) -> OperationState {
        self.run(
            OperationId::on_reference(OperationKind::Describe, index),
            move |state| {
                let image = state.reference(index)?.to_string();
                let request = GenerationRequest::Describe {
                    image,
                    model: state.parameters.text_model,
                };
                Ok(Plan::new(request).on_text(|state, text| state.prompt = text.to_string()))
            },
        )
        .await
    }

    /// Captions reference `index`, then primes the next generation: the
    /// prompt becomes the caption-rendering instruction and the reference
    /// list collapses to the captioned image.
    pub async fn caption_reference(&self, index: usize) -> OperationState {
        self.run(
            OperationId::on_reference(OperationKind::Caption, index),
            move |state| {
                let image = state.reference(index)?.to_string();
                let request = GenerationRequest::Caption {
                    image: image.clone(),
                    model: state.parameters.text_model,
                    max_len: state.parameters.caption_max_len,
                };
                Ok(Plan::new(request).on_text(move |state, caption| {
                    state.prompt = prompts::caption_prompt(caption);
                    state.collapse_references_to(image);
                }))
            },
        )
        .await
    }

    pub async fn remove_text_from_reference(&self, index: usize) -> OperationState {
        self.run(
            OperationId::on_reference(OperationKind::RemoveText, index),
            move |state| {
                let image = state.reference(index)?.to_string();
                let request = GenerationRequest::EditImages {
                    prompt: prompts::REMOVE_TEXT_INSTRUCTION.to_string(),
                    references: vec![image.clone()],
                    model: state.parameters.image_model,
                    aspect_ratio: None,
                };
                Ok(Plan::new(request)
                    .preparing(move |state| {
                        state.prompt = prompts::REMOVE_TEXT_INSTRUCTION.to_string();
                        state.collapse_references_to(image);
                    })
                    .on_images(|state, images| state.result_images = images.to_vec()))
            },
        )
        .await
    }

    /// `ratio` is any positive `W:H` pair.
    pub async fn expand_reference(&self, index: usize, ratio: &str) -> OperationState {
        let ratio = ratio.to_string();
        self.run(
            OperationId::on_reference(OperationKind::Expand, index),
            move |state| {
                let image = state.reference(index)?.to_string();
                let target = parse_ratio_pair(&ratio)
                    .ok_or_else(|| ValidationError::InvalidAspectRatio(ratio.trim().to_string()))?;
                let request = GenerationRequest::Expand {
                    image,
                    target,
                    model: state.parameters.image_model,
                };
                Ok(Plan::new(request)
                    .on_images(|state, images| state.result_images = images.to_vec()))
            },
        )
        .await
    }

    pub async fn enhance_prompt(&self) -> OperationState {
        self.run(OperationId::new(OperationKind::Enhance), |state| {
            let prompt = non_blank(&state.prompt).ok_or(ValidationError::EmptyPrompt)?;
            let request = GenerationRequest::Enhance {
                prompt,
                model: state.parameters.text_model,
            };
            Ok(Plan::new(request).on_text(|state, text| state.prompt = text.to_string()))
        })
        .await
    }

    pub async fn generate_concept(&self) -> OperationState {
        self.run(OperationId::new(OperationKind::Concept), |state| {
            let prompt = non_blank(&state.prompt).ok_or(ValidationError::EmptyPrompt)?;
            let request = GenerationRequest::Concept {
                prompt,
                model: state.parameters.text_model,
            };
            Ok(Plan::new(request).on_text(|state, text| state.prompt = text.to_string()))
        })
        .await
    }

    /// An empty story gets an opening sentence.
    pub async fn next_sentence(&self) -> OperationState {
        self.run(OperationId::new(OperationKind::NextSentence), |state| {
            let request = GenerationRequest::NextSentence {
                story: state.story.trim().to_string(),
                model: state.parameters.text_model,
            };
            Ok(Plan::new(request).on_text(|state, sentence| {
                let current = state.story.trim_end();
                state.story = if current.is_empty() {
                    sentence.to_string()
                } else {
                    format!("{current} {sentence}")
                };
            }))
        })
        .await
    }

    /// Uses the caption length as the summary length hint.
    pub async fn summarize_story(&self) -> OperationState {
        self.run(OperationId::new(OperationKind::Summarize), |state| {
            let story = non_blank(&state.story).ok_or(ValidationError::EmptyStory)?;
            let request = GenerationRequest::Summarize {
                story,
                model: state.parameters.text_model,
                max_len: state.parameters.caption_max_len,
            };
            Ok(Plan::new(request)
                .on_text(|state, summary| state.story_summary = Some(summary.to_string())))
        })
        .await
    }

    pub async fn polish_story(&self) -> OperationState {
        self.run(OperationId::new(OperationKind::Polish), |state| {
            let story = non_blank(&state.story).ok_or(ValidationError::EmptyStory)?;
            let request = GenerationRequest::Polish {
                story,
                model: state.parameters.text_model,
            };
            Ok(Plan::new(request).on_text(|state, text| state.story = text.to_string()))
        })
        .await
    }

    pub async fn translate_story(&self, language: &str) -> OperationState {
        let language = language.trim().to_string();
        self.run(OperationId::new(OperationKind::Translate), move |state| {
            let story = non_blank(&state.story).ok_or(ValidationError::EmptyStory)?;
            if language.is_empty() {
                return Err(ValidationError::EmptyLanguage);
            }
            let request = GenerationRequest::Translate {
                story,
                language,
                model: state.parameters.text_model,
            };
            Ok(Plan::new(request).on_text(|state, text| state.story = text.to_string()))
        })
        .await
    }

    pub async fn design_from_story(&self) -> OperationState {
        self.run(OperationId::new(OperationKind::DesignFromStory), |state| {
            let story = non_blank(&state.story).ok_or(ValidationError::EmptyStory)?;
            let request = GenerationRequest::DesignFromStory {
                story,
                model: state.parameters.text_model,
            };
            Ok(Plan::new(request).on_text(|state, text| state.prompt = text.to_string()))
        })
        .await
    }

    async fn run<V>(&self, id: OperationId, validate: V) -> OperationState
    where
        V: FnOnce(&SessionState) -> Result<Plan, ValidationError> + Send,
    {
        let planned = {
            let state = self.lock();
            if state.is_running(id) {
                Err(ValidationError::AlreadyRunning(id.kind.display_name()))
            } else {
                validate(&*state)
            }
        };
        let plan = match planned {
            Ok(plan) => plan,
            Err(err) => return self.reject(id, err),
        };

        if let Some(model) = plan.request.image_model() {
            if let Err(message) = self.bootstrap_credential(model).await {
                warn!(operation = %id, error = message.as_str(), "credential bootstrap failed");
                let mut state = self.lock();
                state.last_error = Some(message.clone());
                state.focus = None;
                return OperationState::Failed(message);
            }
        }

        let began = {
            let mut state = self.lock();
            match state.begin(id) {
                Ok(()) => {
                    (plan.prepare)(&mut *state);
                    Ok(())
                }
                Err(err) => {
                    state.reject(&err);
                    Err(err)
                }
            }
        };
        if let Err(err) = began {
            debug!(operation = %id, "rejected re-entrant dispatch");
            return OperationState::Failed(err.to_string());
        }
        let mut in_flight = InFlightGuard::new(&self.session, id);

        debug!(operation = %id, model = plan.request.model_key(), "dispatching");
        self.journal_started(id, &plan.request);
        let outcome = self.gateway.execute(plan.request).await;

        let fold = plan.fold;
        let settled = {
            let mut state = self.lock();
            let settled = match outcome {
                Ok(result) => {
                    fold(&mut *state, &result);
                    OperationState::Succeeded(result)
                }
                Err(err) => {
                    let failure = classify_failure(&err);
                    warn!(operation = %id, error = failure.message.as_str(), "operation failed");
                    state.last_error = Some(failure.message.clone());
                    if failure.credential {
                        state.focus = Some(FocusTarget::CredentialField);
                    }
                    OperationState::Failed(failure.message)
                }
            };
            state.settle(id, settled.clone());
            settled
        };
        in_flight.disarm();
        self.journal_settled(id, &settled);
        settled
    }

    fn reject(&self, id: OperationId, err: ValidationError) -> OperationState {
        debug!(operation = %id, error = %err, "precondition failed");
        self.lock().reject(&err);
        OperationState::Failed(err.to_string())
    }

    async fn bootstrap_credential(&self, model: ImageModel) -> Result<(), String> {
        let credentials = self.gateway.credentials();
        if !model.requires_brokered_key() || credentials.has_token() {
            return Ok(());
        }
        let Some(broker) = &self.broker else {
            return Err(brokered_key_required(model));
        };
        let key = match broker.selected_key().await {
            Some(key) => Some(key),
            None => broker
                .prompt_for_key()
                .await
                .map_err(|err| {
                    let cause = error_chain_text(&err, 200);
                    format!("{} ({cause})", brokered_key_required(model))
                })?,
        };
        match key.filter(|value| !value.trim().is_empty()) {
            Some(key) => {
                credentials.set(&key);
                Ok(())
            }
            None => Err(brokered_key_required(model)),
        }
    }

    fn journal_started(&self, id: OperationId, request: &GenerationRequest) {
        self.record(JournalEntry::OperationStarted {
            op: id.into(),
            model: request.model_key().to_string(),
        });
    }

    fn journal_settled(&self, id: OperationId, settled: &OperationState) {
        let entry = match settled {
            OperationState::Succeeded(GenerationResult::Images(images)) => {
                JournalEntry::images(id.into(), images)
            }
            OperationState::Succeeded(GenerationResult::Text(text)) => {
                JournalEntry::text(id.into(), text)
            }
            OperationState::Failed(message) => JournalEntry::OperationFailed {
                op: id.into(),
                error: message.clone(),
            },
            OperationState::Idle | OperationState::Running => return,
        };
        self.record(entry);
    }

    fn record(&self, entry: JournalEntry) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.record(&entry) {
            warn!(path = %journal.path().display(), error = %err, "journal write failed");
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}
