mod catalog;
mod selectors;

pub use catalog::{parse_ratio_pair, AspectRatio, ImageModel, Style, TextModel};
pub use selectors::{ModelSelection, ModelSelector, SelectableModel};
