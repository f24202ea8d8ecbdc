use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use sketchforge_contracts::config::{
    CaptionConfig, ImageModelConfig, PipelineConfig, StorageConfig, TextModelConfig,
};
use sketchforge_contracts::errors::{PipelineError, StageError};
use sketchforge_contracts::events::{EventPayload, EventWriter};
use sketchforge_contracts::sketch::{Artifact, GeneratedImageBytes, PipelineState, SketchSource};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::captioner::{Captioner, HostedCaptioner};
use crate::enhancer::{GeminiTextModel, PromptEnhancer, TextModel, DEFAULT_SYSTEM_PROMPT};
use crate::fetcher::{HttpImageFetcher, ImageFetcher};
use crate::generator::{GeminiImageModel, ImageGenerator};
use crate::store::{ArtifactStore, CloudinaryStore};
use crate::transport::{error_chain_text, STAGE_DETAIL_MAX_CHARS};

type StageResult<T> = std::result::Result<T, (PipelineState, StageError)>;

/// Sketch in, public URL out.
///
/// `run` borrows the pipeline immutably and builds its own [`PromptEnhancer`],
/// so one instance can serve any number of concurrent invocations.
pub struct Pipeline {
    fetcher: Box<dyn ImageFetcher>,
    captioner: Box<dyn Captioner>,
    text_model: Box<dyn TextModel>,
    generator: ImageGenerator,
    store: Arc<dyn ArtifactStore>,
    output_dir: PathBuf,
    system_prompt: String,
    journal: Option<EventWriter>,
}

impl Pipeline {
    pub fn new(
        fetcher: Box<dyn ImageFetcher>,
        captioner: Box<dyn Captioner>,
        text_model: Box<dyn TextModel>,
        generator: ImageGenerator,
        store: Arc<dyn ArtifactStore>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            captioner,
            text_model,
            generator,
            store,
            output_dir: output_dir.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            journal: None,
        }
    }

    /// Builds every production component from the environment. Any missing
    /// credential fails here, before a single request is served.
    pub fn from_env() -> Result<Self> {
        let pipeline_config = PipelineConfig::from_env()?;
        let fetcher = HttpImageFetcher::new(pipeline_config.request_timeout)?;
        let captioner = HostedCaptioner::new(CaptionConfig::from_env()?)?;
        let text_model = GeminiTextModel::new(TextModelConfig::from_env()?)?;
        let image_model = GeminiImageModel::new(ImageModelConfig::from_env()?)?;
        let store = CloudinaryStore::new(StorageConfig::from_env()?)?;
        Ok(Self::new(
            Box::new(fetcher),
            Box::new(captioner),
            Box::new(text_model),
            ImageGenerator::new(image_model),
            Arc::new(store),
            pipeline_config.output_dir,
        ))
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_journal(mut self, journal: EventWriter) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The store the pipeline uploads through, shared with direct uploads.
    pub fn store(&self) -> Arc<dyn ArtifactStore> {
        Arc::clone(&self.store)
    }

    pub fn run(&self, source: &SketchSource) -> Result<String, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline", run_id = %run_id);
        let _entered = span.enter();
        info!(source = %source.label(), "pipeline started");

        match self.run_stages(&run_id, source) {
            Ok(artifact) => {
                self.record(&run_id, "run_finished", json!({ "url": artifact.url }));
                info!(url = %artifact.url, "pipeline finished");
                Ok(artifact.url)
            }
            Err((state, err)) => {
                error!(state = %state, kind = err.kind(), error = %err, "pipeline failed");
                self.record(
                    &run_id,
                    "stage_failed",
                    json!({ "state": state.as_str(), "kind": err.kind() }),
                );
                Err(PipelineError::new(state))
            }
        }
    }

    fn run_stages(&self, run_id: &str, source: &SketchSource) -> StageResult<Artifact> {
        let mut state = PipelineState::Fetching;
        let bitmap = self.stage(run_id, &mut state, || self.fetcher.fetch(source))?;
        let caption = self.stage(run_id, &mut state, || self.captioner.caption(&bitmap))?;
        drop(bitmap);

        let mut enhancer = PromptEnhancer::with_system_prompt(
            self.text_model.as_ref(),
            self.system_prompt.as_str(),
        );
        // Enhancement falls back to the caption, so this stage cannot fail.
        let prompt = self.stage(run_id, &mut state, || Ok(enhancer.enhance(&caption)))?;

        let image = self.stage(run_id, &mut state, || self.generator.generate(&prompt))?;
        let path = self.stage(run_id, &mut state, || {
            persist_generated(&self.output_dir, &image)
        })?;
        let artifact = self.stage(run_id, &mut state, || self.store.upload_local(&path, None))?;
        debug_assert_eq!(state, PipelineState::Done);
        Ok(artifact)
    }

    /// Runs `op` as the stage `state` names, then steps `state` to its
    /// successor on success.
    fn stage<T>(
        &self,
        run_id: &str,
        state: &mut PipelineState,
        op: impl FnOnce() -> Result<T, StageError>,
    ) -> StageResult<T> {
        let current = *state;
        self.enter(run_id, current);
        let value = op().map_err(|err| (current, err))?;
        if let Some(next) = current.next() {
            *state = next;
        }
        Ok(value)
    }

    fn enter(&self, run_id: &str, state: PipelineState) {
        info!(state = %state, "stage started");
        self.record(run_id, "stage_started", json!({ "state": state.as_str() }));
    }

    fn record(&self, run_id: &str, event_type: &str, payload: Value) {
        let Some(journal) = &self.journal else {
            return;
        };
        let payload: EventPayload = payload.as_object().cloned().unwrap_or_default();
        if let Err(err) = journal.emit(run_id, event_type, payload) {
            warn!(error = %err, path = %journal.path().display(), "journal write failed");
        }
    }
}

pub fn generated_file_name() -> String {
    format!("generated_image_{}.png", Uuid::new_v4())
}

/// Writes generated bytes under a fresh `generated_image_<uuid>.png` name.
/// Refuses payloads that do not look like an encoded image and never
/// overwrites an existing file.
pub fn persist_generated(
    output_dir: &Path,
    image: &GeneratedImageBytes,
) -> Result<PathBuf, StageError> {
    write_unique(output_dir, image)
        .map_err(|err| StageError::Persist(error_chain_text(&err, STAGE_DETAIL_MAX_CHARS)))
}

fn write_unique(output_dir: &Path, image: &GeneratedImageBytes) -> Result<PathBuf> {
    let format = image::guess_format(&image.bytes)
        .context("generated payload is not a recognizable image")?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join(generated_file_name());
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(&image.bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), format = ?format, bytes = image.bytes.len(), "generated image persisted");
    Ok(path)
}
