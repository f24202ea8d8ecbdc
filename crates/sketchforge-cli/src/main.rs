mod server;

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sketchforge_contracts::config::StorageConfig;
use sketchforge_contracts::events::EventWriter;
use sketchforge_contracts::sketch::SketchSource;
use sketchforge_engine::{optimize_url, ArtifactStore, CloudinaryStore, DeliveryOptions, Pipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sketchforge", version, about = "Turn sketches into generated images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline on one sketch and print the uploaded URL.
    Run(RunArgs),
    /// Upload a local image.
    Upload(UploadArgs),
    /// Upload an image Cloudinary fetches from a URL.
    UploadUrl(UploadUrlArgs),
    /// Print a delivery URL with resize/format/quality applied.
    OptimizeUrl(OptimizeUrlArgs),
    /// Serve the HTTP endpoints.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Sketch URL (http/https) or local file path.
    #[arg(long)]
    sketch: String,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    system_prompt: Option<String>,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    public_id: Option<String>,
}

#[derive(Debug, Parser)]
struct UploadUrlArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    public_id: Option<String>,
}

#[derive(Debug, Parser)]
struct OptimizeUrlArgs {
    #[arg(long)]
    public_id: String,
    /// Defaults to CLOUDINARY_CLOUD_NAME.
    #[arg(long)]
    cloud_name: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long, default_value = "auto")]
    crop: String,
    #[arg(long, default_value = "auto")]
    quality: String,
    #[arg(long, default_value = "auto")]
    format: String,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sketchforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Upload(args) => run_upload(args),
        Command::UploadUrl(args) => run_upload_url(args),
        Command::OptimizeUrl(args) => run_optimize_url(args),
        Command::Serve(args) => run_serve(args),
    }
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let mut pipeline = Pipeline::from_env()?;
    if let Some(dir) = args.output_dir {
        pipeline = pipeline.with_output_dir(dir);
    }
    if let Some(system_prompt) = args.system_prompt {
        pipeline = pipeline.with_system_prompt(system_prompt);
    }
    if let Some(events) = args.events {
        pipeline = pipeline.with_journal(EventWriter::new(events));
    }
    let source = sketch_source(&args.sketch)?;
    let url = pipeline.run(&source)?;
    println!("{url}");
    Ok(0)
}

fn sketch_source(raw: &str) -> Result<SketchSource> {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(SketchSource::Url(trimmed.to_string()));
    }
    let bytes = fs::read(trimmed).with_context(|| format!("failed to read sketch {trimmed}"))?;
    Ok(SketchSource::Bytes(bytes))
}

fn cloudinary_store() -> Result<CloudinaryStore> {
    CloudinaryStore::new(StorageConfig::from_env()?)
}

fn run_upload(args: UploadArgs) -> Result<i32> {
    let artifact = cloudinary_store()?.upload_local(&args.file, args.public_id.as_deref())?;
    println!("{}", artifact.url);
    Ok(0)
}

fn run_upload_url(args: UploadUrlArgs) -> Result<i32> {
    let artifact = cloudinary_store()?.upload_from_url(&args.url, args.public_id.as_deref())?;
    println!("{}", artifact.url);
    Ok(0)
}

fn run_optimize_url(args: OptimizeUrlArgs) -> Result<i32> {
    let cloud_name = match args.cloud_name {
        Some(name) => name,
        None => StorageConfig::cloud_name_from_env()?,
    };
    let options = DeliveryOptions {
        width: args.width,
        height: args.height,
        crop: Some(args.crop),
        quality: Some(args.quality),
        format: Some(args.format),
    };
    println!("{}", optimize_url(cloud_name.trim(), &args.public_id, &options));
    Ok(0)
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    // Blocking HTTP clients must be built outside the async runtime.
    let mut pipeline = Pipeline::from_env()?;
    if let Some(events) = args.events {
        pipeline = pipeline.with_journal(EventWriter::new(events));
    }
    let pipeline = Arc::new(pipeline);
    info!(output_dir = %pipeline.output_dir().display(), "pipeline ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(Arc::clone(&pipeline), args.bind))?;
    drop(runtime);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use sketchforge_contracts::sketch::SketchSource;

    use super::{sketch_source, Cli, Command};

    #[test]
    fn parses_run_and_optimize_commands() {
        let cli = Cli::parse_from([
            "sketchforge",
            "run",
            "--sketch",
            "https://sketches.test/house.png",
            "--events",
            "out/events.jsonl",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.sketch, "https://sketches.test/house.png");
                assert!(args.output_dir.is_none());
                assert!(args.events.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from([
            "sketchforge",
            "optimize-url",
            "--public-id",
            "house",
            "--width",
            "500",
        ]);
        match cli.command {
            Command::OptimizeUrl(args) => {
                assert_eq!(args.width, Some(500));
                assert_eq!(args.crop, "auto");
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["sketchforge", "serve"]);
        match cli.command {
            Command::Serve(args) => assert_eq!(args.bind.to_string(), "127.0.0.1:8000"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sketch_source_reads_local_files_and_keeps_urls() -> anyhow::Result<()> {
        assert_eq!(
            sketch_source(" https://sketches.test/house.png ")?,
            SketchSource::Url("https://sketches.test/house.png".to_string())
        );

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("sketch.png");
        std::fs::write(&path, b"png-bytes")?;
        assert_eq!(
            sketch_source(path.to_str().unwrap())?,
            SketchSource::Bytes(b"png-bytes".to_vec())
        );
        assert!(sketch_source(temp.path().join("absent.png").to_str().unwrap()).is_err());
        Ok(())
    }
}
