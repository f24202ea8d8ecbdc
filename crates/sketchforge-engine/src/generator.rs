use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};
use sketchforge_contracts::config::{ImageModelConfig, Secret};
use sketchforge_contracts::content::{first_inline_image, joined_text, ContentPart, InlineData};
use sketchforge_contracts::errors::StageError;
use sketchforge_contracts::sketch::{EnhancedPrompt, GeneratedImageBytes};
use tracing::{debug, info};

use crate::enhancer::{generate_content_endpoint, GEMINI_API_KEY_HEADER};
use crate::transport::{
    error_chain_text, http_client, response_json_or_error, STAGE_DETAIL_MAX_CHARS,
};

/// A multimodal model returning an ordered list of response parts.
pub trait ImageModel: Send + Sync {
    fn generate_content(&self, prompt: &str) -> Result<Vec<ContentPart>>;
}

pub struct GeminiImageModel {
    endpoint: String,
    api_key: Secret,
    http: HttpClient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    text: Option<String>,
    #[serde(alias = "inline_data")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    #[serde(alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

impl GeminiImageModel {
    pub fn new(config: ImageModelConfig) -> Result<Self> {
        if config.api_key.expose().trim().is_empty() {
            bail!("GEMINI_IMAGE_API_KEY not set");
        }
        Ok(Self {
            endpoint: generate_content_endpoint(&config.api_base, &config.model),
            api_key: config.api_key,
            http: http_client(config.request_timeout)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn build_payload(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
        })
    }
}

impl ImageModel for GeminiImageModel {
    fn generate_content(&self, prompt: &str) -> Result<Vec<ContentPart>> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(GEMINI_API_KEY_HEADER, self.api_key.expose())
            .json(&Self::build_payload(prompt))
            .send()
            .with_context(|| format!("Gemini image request failed ({})", self.endpoint))?;
        let payload = response_json_or_error("Gemini image", response)?;
        parse_content_parts(&payload)
    }
}

/// Parts of the first candidate, in order. Inline data is base64-decoded;
/// parts with neither text nor inline data are dropped.
pub fn parse_content_parts(payload: &Value) -> Result<Vec<ContentPart>> {
    let response = GeminiResponse::deserialize(payload)
        .context("Gemini image response has an unexpected shape")?;
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .unwrap_or_else(|| "no candidates".to_string());
        bail!("Gemini returned no image candidates ({reason})");
    };
    if let Some(reason) = candidate.finish_reason.as_deref() {
        debug!(finish_reason = reason, "image candidate finished");
    }

    let mut parts = Vec::new();
    for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
        if let Some(inline) = part.inline_data {
            let data = BASE64
                .decode(inline.data.trim().as_bytes())
                .context("Gemini image base64 decode failed")?;
            parts.push(ContentPart::InlineData(InlineData {
                mime_type: inline.mime_type,
                data,
            }));
        } else if let Some(text) = part.text {
            parts.push(ContentPart::Text(text));
        }
    }
    Ok(parts)
}

/// Runs the image model and keeps the first inline image it returns.
pub struct ImageGenerator {
    model: Box<dyn ImageModel>,
}

impl ImageGenerator {
    pub fn new(model: impl ImageModel + 'static) -> Self {
        Self {
            model: Box::new(model),
        }
    }

    pub fn generate(&self, prompt: &EnhancedPrompt) -> Result<GeneratedImageBytes, StageError> {
        let parts = self
            .model
            .generate_content(prompt.as_str())
            .map_err(|err| StageError::Generation(error_chain_text(&err, STAGE_DETAIL_MAX_CHARS)))?;
        let commentary = joined_text(&parts);
        if !commentary.is_empty() {
            debug!(text = %commentary, "image model commentary discarded");
        }
        let Some(inline) = first_inline_image(&parts) else {
            return Err(StageError::NoImageData);
        };
        info!(
            bytes = inline.data.len(),
            mime_type = inline.mime_type.as_deref().unwrap_or("unknown"),
            parts = parts.len(),
            "image generated"
        );
        Ok(GeneratedImageBytes {
            bytes: inline.data.clone(),
            mime_type: inline.mime_type.clone(),
        })
    }
}
