use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use sketchforge_contracts::sketch::SketchSource;
use sketchforge_engine::{ArtifactStore, Pipeline};
use tokio::net::TcpListener;
use tracing::{error, info};

const UPLOAD_FIELD: &str = "file";
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn ArtifactStore>,
    output_dir: PathBuf,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            store: pipeline.store(),
            output_dir: pipeline.output_dir().to_path_buf(),
            pipeline,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateImageRequest {
    image_url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate-image", post(generate_image))
        .route("/generate-image-file", post(generate_image_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub async fn serve(pipeline: Arc<Pipeline>, bind: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "sketchforge listening");
    axum::serve(listener, router(AppState::new(pipeline)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn generate_image(
    State(state): State<AppState>,
    Json(request): Json<GenerateImageRequest>,
) -> (StatusCode, Json<Value>) {
    let pipeline = Arc::clone(&state.pipeline);
    let source = SketchSource::Url(request.image_url);
    let outcome = tokio::task::spawn_blocking(move || pipeline.run(&source)).await;
    match outcome {
        Ok(Ok(url)) => (StatusCode::OK, Json(json!({ "cloudinary_url": url }))),
        Ok(Err(err)) => failure(&err.to_string()),
        Err(join_err) => {
            error!(error = %join_err, "pipeline task aborted");
            failure("generation failed")
        }
    }
}

async fn generate_image_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    match store_upload(state, multipart).await {
        Ok((filename, url)) => (
            StatusCode::OK,
            Json(json!({ "filename": filename, "cloudinary_url": url })),
        ),
        Err(err) => {
            error!(error = %format!("{err:#}"), "file upload failed");
            failure("upload failed")
        }
    }
}

fn failure(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}

async fn store_upload(state: AppState, mut multipart: Multipart) -> Result<(String, String)> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .context("malformed multipart body")?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = sanitize_filename(field.file_name().unwrap_or_default())?;
        let bytes = field.bytes().await.context("failed to read upload")?;
        upload = Some((filename, bytes));
        break;
    }
    let Some((filename, bytes)) = upload else {
        bail!("multipart body has no `{UPLOAD_FIELD}` field");
    };

    let AppState {
        store, output_dir, ..
    } = state;
    tokio::task::spawn_blocking(move || -> Result<(String, String)> {
        let path = write_upload(&output_dir, &filename, &bytes)?;
        let artifact = store.upload_local(&path, None)?;
        info!(filename = %filename, url = %artifact.url, "file uploaded");
        Ok((filename, artifact.url))
    })
    .await
    .context("upload task aborted")?
}

/// Keeps only the final path component of a client-supplied name.
fn sanitize_filename(raw: &str) -> Result<String> {
    let name = Path::new(raw.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if name.is_empty() {
        bail!("upload has no usable file name ({raw:?})");
    }
    Ok(name.to_string())
}

// Same-named uploads replace each other.
fn write_upload(output_dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join(filename);
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
