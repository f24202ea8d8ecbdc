use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where an input sketch comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SketchSource {
    Url(String),
    Bytes(Vec<u8>),
}

impl SketchSource {
    pub fn label(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

/// Decoded RGB8 pixels, row-major, three bytes per pixel.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(3)?;
        if width == 0 || height == 0 || pixels.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels", &self.pixels.len())
            .finish()
    }
}

/// Natural-language description of a sketch. Always non-empty and trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption(String);

impl Caption {
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        let trimmed = text.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Prompt handed to the image model. Never empty: it is either a trimmed
/// model reply or the caption it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedPrompt(String);

impl EnhancedPrompt {
    pub fn from_reply(reply: &str) -> Option<Self> {
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn from_caption(caption: &Caption) -> Self {
        Self(caption.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnhancedPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl fmt::Debug for GeneratedImageBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImageBytes")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Input accepted by an artifact store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    LocalPath(PathBuf),
    RemoteUrl(String),
}

/// A durably stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub public_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Fetching,
    Captioning,
    Enhancing,
    Generating,
    Persisting,
    Uploading,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Captioning => "captioning",
            Self::Enhancing => "enhancing",
            Self::Generating => "generating",
            Self::Persisting => "persisting",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Successor on the happy path. Terminal states have none.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Fetching => Some(Self::Captioning),
            Self::Captioning => Some(Self::Enhancing),
            Self::Enhancing => Some(Self::Generating),
            Self::Generating => Some(Self::Persisting),
            Self::Persisting => Some(Self::Uploading),
            Self::Uploading => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_rejects_mismatched_buffers() {
        assert!(Bitmap::new(2, 2, vec![0; 12]).is_some());
        assert!(Bitmap::new(2, 2, vec![0; 11]).is_none());
        assert!(Bitmap::new(0, 2, Vec::new()).is_none());
    }

    #[test]
    fn caption_and_prompt_are_trimmed_and_non_empty() {
        assert!(Caption::new("   \n").is_none());
        let caption = Caption::new("  a pencil sketch of a house \n").unwrap();
        assert_eq!(caption.as_str(), "a pencil sketch of a house");

        assert!(EnhancedPrompt::from_reply("\t ").is_none());
        let prompt = EnhancedPrompt::from_reply("\n vivid house at dusk  ").unwrap();
        assert_eq!(prompt.as_str(), "vivid house at dusk");
        assert_eq!(
            EnhancedPrompt::from_caption(&caption).as_str(),
            caption.as_str()
        );
    }

    #[test]
    fn state_machine_walks_to_done() {
        let mut state = PipelineState::Fetching;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }
        assert_eq!(
            visited,
            vec![
                PipelineState::Fetching,
                PipelineState::Captioning,
                PipelineState::Enhancing,
                PipelineState::Generating,
                PipelineState::Persisting,
                PipelineState::Uploading,
                PipelineState::Done,
            ]
        );
        assert!(PipelineState::Failed.next().is_none());
    }
}
