pub mod backend;
pub mod compositor;
pub mod gateway;
pub mod gemini;
pub mod orchestrator;
pub mod prompts;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    BackendResponse, ContentPart, ContentRequest, DecodedOutput, GenerativeBackend, PredictRequest,
    ResponseModality,
};
pub use compositor::{
    canvas_geometry, pad_to_aspect_ratio, CanvasGeometry, ComposeError, MAX_CANVAS_SIDE,
};
pub use gateway::{Gateway, GenerationRequest, NO_IMAGE_PRODUCED, NO_TEXT_PRODUCED};
pub use gemini::GeminiBackend;
pub use orchestrator::{
    brokered_key_required, classify_failure, CredentialBroker, Failure, Orchestrator,
    CREDENTIAL_ERROR_MESSAGE, INTERRUPTED_MESSAGE,
};
