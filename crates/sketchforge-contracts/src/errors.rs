use thiserror::Error;

use crate::sketch::PipelineState;

/// Failure of a single pipeline stage, carrying the full detail for logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("sketch fetch failed: {0}")]
    Fetch(String),
    #[error("captioning failed: {0}")]
    Caption(String),
    #[error("prompt enhancement failed: {0}")]
    Enhancement(String),
    #[error("image generation failed: {0}")]
    Generation(String),
    #[error("no image data found in the response")]
    NoImageData,
    #[error("failed to persist generated image: {0}")]
    Persist(String),
    #[error("artifact upload failed: {0}")]
    Upload(String),
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Caption(_) => "caption",
            Self::Enhancement(_) => "enhancement",
            Self::Generation(_) => "generation",
            Self::NoImageData => "no_image_data",
            Self::Persist(_) => "persist",
            Self::Upload(_) => "upload",
        }
    }
}

/// The only failure a pipeline caller ever sees. Stage detail is logged where
/// it happens and never carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("generation failed")]
pub struct PipelineError {
    failed_in: PipelineState,
}

impl PipelineError {
    pub fn new(failed_in: PipelineState) -> Self {
        Self { failed_in }
    }

    pub fn failed_in(&self) -> PipelineState {
        self.failed_in
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_hides_stage_detail() {
        let stage = StageError::Fetch("https://internal.example/ 404: secret body".to_string());
        assert!(stage.to_string().contains("404"));

        let err = PipelineError::new(PipelineState::Fetching);
        assert_eq!(err.to_string(), "generation failed");
        assert_eq!(err.failed_in(), PipelineState::Fetching);
    }

    #[test]
    fn config_errors_name_the_variable() {
        assert_eq!(
            ConfigError::Missing("GEMINI_TEXT_API_KEY").to_string(),
            "GEMINI_TEXT_API_KEY not set"
        );
    }
}
