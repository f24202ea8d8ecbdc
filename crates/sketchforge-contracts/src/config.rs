use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_CAPTION_MODEL: &str = "Salesforce/blip-image-captioning-base";
pub const DEFAULT_CAPTION_API_BASE: &str = "https://router.huggingface.co/hf-inference/models";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-1.5-flash-8b";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-exp-image-generation";
pub const DEFAULT_CLOUDINARY_API_BASE: &str = "https://api.cloudinary.com/v1_1";
pub const DEFAULT_OUTPUT_DIR: &str = "static";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Credential wrapper that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionConfig {
    pub api_base: String,
    pub model_id: String,
    pub api_token: Option<Secret>,
    pub request_timeout: Duration,
}

impl CaptionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: api_base(&lookup, "CAPTION_API_BASE", DEFAULT_CAPTION_API_BASE),
            model_id: non_empty(&lookup, "CAPTION_MODEL_ID")
                .unwrap_or_else(|| DEFAULT_CAPTION_MODEL.to_string()),
            api_token: non_empty(&lookup, "CAPTION_API_TOKEN").map(Secret::new),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextModelConfig {
    pub api_base: String,
    pub model: String,
    pub api_key: Secret,
    pub request_timeout: Duration,
}

impl TextModelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: api_base(&lookup, "GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            model: non_empty(&lookup, "GEMINI_TEXT_MODEL")
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            api_key: Secret::new(required(&lookup, "GEMINI_TEXT_API_KEY")?),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageModelConfig {
    pub api_base: String,
    pub model: String,
    pub api_key: Secret,
    pub request_timeout: Duration,
}

impl ImageModelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: api_base(&lookup, "GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            model: non_empty(&lookup, "GEMINI_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            api_key: Secret::new(required(&lookup, "GEMINI_IMAGE_API_KEY")?),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub api_base: String,
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: Secret,
    pub request_timeout: Duration,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: api_base(&lookup, "CLOUDINARY_API_BASE", DEFAULT_CLOUDINARY_API_BASE),
            cloud_name: Self::cloud_name_from_lookup(&lookup)?,
            api_key: required(&lookup, "CLOUDINARY_API_KEY")?,
            api_secret: Secret::new(required(&lookup, "CLOUDINARY_API_SECRET")?),
            request_timeout: request_timeout(&lookup)?,
        })
    }

    /// Just the cloud name. Building delivery URLs needs no credentials.
    pub fn cloud_name_from_env() -> Result<String, ConfigError> {
        Self::cloud_name_from_lookup(&env_lookup)
    }

    pub fn cloud_name_from_lookup(
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<String, ConfigError> {
        required(lookup, "CLOUDINARY_CLOUD_NAME")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    /// Timeout for fetching sketches by URL.
    pub request_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            output_dir: non_empty(&lookup, "SKETCHFORGE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            request_timeout: request_timeout(&lookup)?,
        })
    }
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    non_empty(lookup, key).ok_or(ConfigError::Missing(key))
}

fn api_base(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    non_empty(lookup, key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn request_timeout(lookup: &impl Fn(&str) -> Option<String>) -> Result<Duration, ConfigError> {
    const KEY: &str = "SKETCHFORGE_REQUEST_TIMEOUT";
    let Some(raw) = non_empty(lookup, KEY) else {
        return Ok(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
    };
    let seconds: f64 = raw.parse().map_err(|_| ConfigError::Invalid {
        key: KEY,
        reason: format!("expected seconds, got {raw:?}"),
    })?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ConfigError::Invalid {
            key: KEY,
            reason: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(seconds))
}
