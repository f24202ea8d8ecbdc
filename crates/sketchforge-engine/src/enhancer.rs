use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sketchforge_contracts::config::{Secret, TextModelConfig};
use sketchforge_contracts::conversation::{ConversationState, Turn};
use sketchforge_contracts::errors::StageError;
use sketchforge_contracts::sketch::{Caption, EnhancedPrompt};
use tracing::{debug, warn};

use crate::transport::{
    error_chain_text, http_client, response_json_or_error, STAGE_DETAIL_MAX_CHARS,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a professional prompt optimizer for image generation. \
Transform user requests into rich, vivid, detailed, efficient prompts.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

pub const ENHANCER_SAMPLING: SamplingParams = SamplingParams {
    temperature: 0.85,
    top_p: 1.0,
    top_k: 40,
    max_output_tokens: 8192,
};

/// A chat-style text model: one call per user message, with the caller
/// supplying the whole prior history.
pub trait TextModel: Send + Sync {
    fn send(&self, system_instruction: &str, history: &[Turn], message: &str) -> Result<String>;
}

pub struct GeminiTextModel {
    endpoint: String,
    api_key: Secret,
    sampling: SamplingParams,
    http: HttpClient,
}

impl GeminiTextModel {
    pub fn new(config: TextModelConfig) -> Result<Self> {
        if config.api_key.expose().trim().is_empty() {
            bail!("GEMINI_TEXT_API_KEY not set");
        }
        Ok(Self {
            endpoint: generate_content_endpoint(&config.api_base, &config.model),
            api_key: config.api_key,
            sampling: ENHANCER_SAMPLING,
            http: http_client(config.request_timeout)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn build_payload(
        system_instruction: &str,
        history: &[Turn],
        message: &str,
        sampling: &SamplingParams,
    ) -> Value {
        let mut contents = Vec::with_capacity(history.len() * 2 + 1);
        for turn in history {
            contents.push(json!({ "role": "user", "parts": [{ "text": turn.prompt }] }));
            contents.push(json!({ "role": "model", "parts": [{ "text": turn.response }] }));
        }
        contents.push(json!({ "role": "user", "parts": [{ "text": message }] }));

        json!({
            "systemInstruction": { "parts": [{ "text": system_instruction.trim() }] },
            "contents": contents,
            "generationConfig": {
                "temperature": sampling.temperature,
                "topP": sampling.top_p,
                "topK": sampling.top_k,
                "maxOutputTokens": sampling.max_output_tokens,
                "responseMimeType": "text/plain",
            },
        })
    }

    /// Concatenates the text parts of the first candidate.
    pub fn extract_text(payload: &Value) -> Result<String> {
        let Some(candidate) = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            let reason = payload
                .get("promptFeedback")
                .and_then(|feedback| feedback.get("blockReason"))
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            bail!("Gemini returned no text candidates ({reason})");
        };
        let text = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
    }
}

impl TextModel for GeminiTextModel {
    fn send(&self, system_instruction: &str, history: &[Turn], message: &str) -> Result<String> {
        let payload = Self::build_payload(system_instruction, history, message, &self.sampling);
        let response = self
            .http
            .post(&self.endpoint)
            .header(GEMINI_API_KEY_HEADER, self.api_key.expose())
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini text request failed ({})", self.endpoint))?;
        let body = response_json_or_error("Gemini text", response)?;
        Self::extract_text(&body)
    }
}

/// Gemini reads the key from this header, which keeps it out of request URLs
/// and therefore out of transport error messages.
pub(crate) const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";

pub(crate) fn generate_content_endpoint(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{}/{}:generateContent", api_base, model_path)
}

/// Turns captions into generation prompts while keeping the conversation.
///
/// One enhancer per pipeline invocation. A failed model call never escapes
/// [`PromptEnhancer::enhance`]: the caption itself becomes the prompt and the
/// history is left as it was.
pub struct PromptEnhancer<'m> {
    model: &'m dyn TextModel,
    system_prompt: String,
    state: ConversationState,
}

impl<'m> PromptEnhancer<'m> {
    pub fn new(model: &'m dyn TextModel) -> Self {
        Self::with_system_prompt(model, DEFAULT_SYSTEM_PROMPT)
    }

    pub fn with_system_prompt(model: &'m dyn TextModel, system_prompt: impl Into<String>) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            state: ConversationState::new(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn is_fresh(&self) -> bool {
        self.state.is_fresh()
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.state
    }

    pub fn enhance(&mut self, caption: &Caption) -> EnhancedPrompt {
        match self.try_enhance(caption) {
            Ok(prompt) => {
                debug!(turns = self.state.turns().len(), prompt = %prompt, "prompt enhanced");
                prompt
            }
            Err(err) => {
                warn!(error = %err, "prompt enhancement failed; using caption as prompt");
                EnhancedPrompt::from_caption(caption)
            }
        }
    }

    fn try_enhance(&mut self, caption: &Caption) -> Result<EnhancedPrompt, StageError> {
        let reply = self
            .model
            .send(&self.system_prompt, self.state.turns(), caption.as_str())
            .map_err(|err| StageError::Enhancement(error_chain_text(&err, STAGE_DETAIL_MAX_CHARS)))?;
        let prompt = EnhancedPrompt::from_reply(&reply)
            .ok_or_else(|| StageError::Enhancement("model returned an empty reply".to_string()))?;
        self.state.push(caption.as_str(), prompt.as_str());
        Ok(prompt)
    }
}
