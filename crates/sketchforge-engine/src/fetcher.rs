use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use sketchforge_contracts::errors::StageError;
use sketchforge_contracts::sketch::{Bitmap, SketchSource};
use tracing::debug;

use crate::transport::{error_chain_text, http_client, truncate_text, STAGE_DETAIL_MAX_CHARS};

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, source: &SketchSource) -> Result<Bitmap, StageError>;
}

/// Downloads URL sketches with a plain GET and decodes them to RGB8.
pub struct HttpImageFetcher {
    http: HttpClient,
}

impl HttpImageFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(request_timeout)?,
        })
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("sketch request failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!(
                "sketch request returned {} ({url}): {}",
                status.as_u16(),
                truncate_text(body.trim(), 200)
            );
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("sketch body read failed ({url})"))?;
        Ok(bytes.to_vec())
    }

    fn fetch_inner(&self, source: &SketchSource) -> Result<Bitmap> {
        match source {
            SketchSource::Url(url) => {
                let bytes = self.download(url)?;
                debug!(url = %url, bytes = bytes.len(), "sketch downloaded");
                decode_bitmap(&bytes)
            }
            SketchSource::Bytes(bytes) => decode_bitmap(bytes),
        }
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, source: &SketchSource) -> Result<Bitmap, StageError> {
        self.fetch_inner(source)
            .map_err(|err| StageError::Fetch(error_chain_text(&err, STAGE_DETAIL_MAX_CHARS)))
    }
}

/// Decodes any format the `image` crate can sniff and converts it to RGB8.
pub fn decode_bitmap(bytes: &[u8]) -> Result<Bitmap> {
    let decoded = image::load_from_memory(bytes).context("sketch is not a decodable image")?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    Bitmap::new(width, height, rgb.into_raw()).context("decoded sketch has no pixels")
}
