use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use sketchforge_contracts::config::{CaptionConfig, Secret};
use sketchforge_contracts::errors::StageError;
use sketchforge_contracts::sketch::{Bitmap, Caption};
use tracing::debug;

use crate::transport::{
    error_chain_text, http_client, response_json_or_error, STAGE_DETAIL_MAX_CHARS,
};

/// Longest edge sent to the captioning model.
pub const CAPTION_INPUT_EDGE: u32 = 384;

pub trait Captioner: Send + Sync {
    fn caption(&self, image: &Bitmap) -> Result<Caption, StageError>;
}

/// Captioner backed by a hosted image-to-text inference endpoint.
pub struct HostedCaptioner {
    endpoint: String,
    api_token: Option<Secret>,
    http: HttpClient,
}

impl HostedCaptioner {
    pub fn new(config: CaptionConfig) -> Result<Self> {
        let model_id = config.model_id.trim().trim_matches('/');
        if model_id.is_empty() {
            bail!("captioning model id is empty");
        }
        Ok(Self {
            endpoint: format!("{}/{}", config.api_base, model_id),
            api_token: config.api_token,
            http: http_client(config.request_timeout)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_caption(&self, image: &Bitmap) -> Result<Caption> {
        let body = preprocess(image)?;
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/png")
            .body(body);
        if let Some(token) = &self.api_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token.expose()));
        }
        let response = request
            .send()
            .with_context(|| format!("captioning request failed ({})", self.endpoint))?;
        let payload = response_json_or_error("Captioning", response)?;
        parse_caption_response(&payload)
    }
}

impl Captioner for HostedCaptioner {
    fn caption(&self, image: &Bitmap) -> Result<Caption, StageError> {
        let caption = self
            .request_caption(image)
            .map_err(|err| StageError::Caption(error_chain_text(&err, STAGE_DETAIL_MAX_CHARS)))?;
        debug!(caption = %caption, "sketch captioned");
        Ok(caption)
    }
}

/// Downscales so the longest edge is at most [`CAPTION_INPUT_EDGE`] and encodes
/// as PNG. Identical bitmaps always produce identical bytes.
pub fn preprocess(image: &Bitmap) -> Result<Vec<u8>> {
    let rgb = RgbImage::from_raw(image.width(), image.height(), image.pixels().to_vec())
        .context("bitmap buffer does not match its dimensions")?;
    let longest = rgb.width().max(rgb.height());
    let resized = if longest > CAPTION_INPUT_EDGE {
        let scale = CAPTION_INPUT_EDGE as f64 / longest as f64;
        let width = ((rgb.width() as f64 * scale).round() as u32).max(1);
        let height = ((rgb.height() as f64 * scale).round() as u32).max(1);
        image::imageops::resize(&rgb, width, height, FilterType::Triangle)
    } else {
        rgb
    };
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(resized)
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode caption input")?;
    Ok(out.into_inner())
}

/// Accepts `[{"generated_text": ..}]` or a bare `{"generated_text": ..}`.
pub fn parse_caption_response(payload: &Value) -> Result<Caption> {
    let entry = match payload {
        Value::Array(rows) => rows.first(),
        Value::Object(_) => Some(payload),
        _ => None,
    };
    let text = entry
        .and_then(|row| row.get("generated_text"))
        .and_then(Value::as_str)
        .context("captioning response has no generated_text")?;
    Caption::new(text).context("captioning model returned an empty caption")
}
