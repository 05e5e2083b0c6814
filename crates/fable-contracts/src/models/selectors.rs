use super::catalog::{ImageModel, TextModel};

/// A model family the selector can resolve by key.
pub trait SelectableModel: Copy + Default {
    const CAPABILITY: &'static str;

    fn parse_key(raw: &str) -> Option<Self>;
}

impl SelectableModel for ImageModel {
    const CAPABILITY: &'static str = "image";

    fn parse_key(raw: &str) -> Option<Self> {
        ImageModel::parse(raw)
    }
}

impl SelectableModel for TextModel {
    const CAPABILITY: &'static str = "text";

    fn parse_key(raw: &str) -> Option<Self> {
        TextModel::parse(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection<M> {
    pub model: M,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSelector;

impl ModelSelector {
    pub fn select<M: SelectableModel>(&self, requested: Option<&str>) -> ModelSelection<M> {
        let capability = M::CAPABILITY;
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let Some(requested_value) = requested else {
            return ModelSelection {
                model: M::default(),
                requested: None,
                fallback_reason: Some("No model specified; using default.".to_string()),
            };
        };
        if let Some(model) = M::parse_key(requested_value) {
            return ModelSelection {
                model,
                requested: Some(requested_value.to_string()),
                fallback_reason: None,
            };
        }
        ModelSelection {
            model: M::default(),
            requested: Some(requested_value.to_string()),
            fallback_reason: Some(format!(
                "Requested model '{requested_value}' unavailable for capability '{capability}'."
            )),
        }
    }
}
