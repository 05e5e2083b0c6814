use std::env;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::data_url::{DataUrlPolicy, DEFAULT_FALLBACK_MEDIA_TYPE};
use crate::session::DEFAULT_CAPTION_MAX_LEN;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FableConfig {
    pub api_base: String,
    /// Statically configured fallback credential; empty means none.
    pub default_api_key: String,
    pub default_caption_max_len: u32,
    pub fallback_media_type: String,
    pub image_model: Option<String>,
    pub text_model: Option<String>,
}

impl Default for FableConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            default_api_key: String::new(),
            default_caption_max_len: DEFAULT_CAPTION_MAX_LEN,
            fallback_media_type: DEFAULT_FALLBACK_MEDIA_TYPE.to_string(),
            image_model: None,
            text_model: None,
        }
    }
}

impl FableConfig {
    /// `GEMINI_API_BASE` and `GEMINI_API_KEY`/`GOOGLE_API_KEY` win over file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(base) = non_empty_env("GEMINI_API_BASE") {
            self.api_base = base;
        }
        let env_key =
            non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"));
        if let Some(key) = env_key {
            self.default_api_key = key;
        }
        self
    }

    pub fn api_base(&self) -> String {
        let trimmed = self.api_base.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return DEFAULT_API_BASE.to_string();
        }
        trimmed.to_string()
    }

    pub fn data_url_policy(&self) -> DataUrlPolicy {
        DataUrlPolicy::new(self.fallback_media_type.clone())
    }

    pub fn caption_max_len(&self) -> u32 {
        if self.default_caption_max_len == 0 {
            return DEFAULT_CAPTION_MAX_LEN;
        }
        self.default_caption_max_len
    }
}

pub fn load_or_init(path: &Path) -> anyhow::Result<FableConfig> {
    if path.exists() {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let config: FableConfig = serde_json::from_str(&data)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    } else {
        let config = FableConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &FableConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_writes_defaults_when_missing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("fable").join("config.json");
        let config = load_or_init(&path)?;
        assert_eq!(config, FableConfig::default());
        assert!(path.exists());
        assert_eq!(load_or_init(&path)?, config);
        Ok(())
    }

    #[test]
    fn partial_config_files_use_defaults_for_missing_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"default_caption_max_len": 80, "image_model": "imagen-4-ultra"}"#,
        )?;
        let config = load_or_init(&path)?;
        assert_eq!(config.caption_max_len(), 80);
        assert_eq!(config.image_model.as_deref(), Some("imagen-4-ultra"));
        assert_eq!(config.api_base(), DEFAULT_API_BASE);
        Ok(())
    }

    #[test]
    fn api_base_strips_trailing_slash_and_zero_caption_uses_default() {
        let config = FableConfig {
            api_base: "http://localhost:9000/v1beta/".to_string(),
            default_caption_max_len: 0,
            ..FableConfig::default()
        };
        assert_eq!(config.api_base(), "http://localhost:9000/v1beta");
        assert_eq!(config.caption_max_len(), DEFAULT_CAPTION_MAX_LEN);
    }

    #[test]
    fn data_url_policy_uses_configured_fallback() {
        let config = FableConfig {
            fallback_media_type: "image/jpeg".to_string(),
            ..FableConfig::default()
        };
        assert_eq!(config.data_url_policy().decode("junk").media_type, "image/jpeg");
    }
}
