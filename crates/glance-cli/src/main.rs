mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glance_core::{spawn_processor, Frame, FrameProcessor, InferenceEngine, OrtEngine};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "glance", about = "Gaze estimation pipeline CLI")]
struct Cli {
    /// Pipeline configuration file (TOML). Falls back to GLANCE_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on still images and print detections as JSON
    Run {
        /// Image files to process
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// Print the input/output signature of an ONNX model
    Inspect {
        /// Path to the model file
        model: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { images, pretty } => {
            let config = config::load(cli.config.as_deref())?;
            let processor = FrameProcessor::from_config(&config).context("building the pipeline")?;
            let handle = spawn_processor(processor)?;

            for path in &images {
                let image =
                    image::open(path).with_context(|| format!("opening {}", path.display()))?;
                let frame = Frame::from_rgb(image.to_rgb8());
                let detections = handle.process(frame).await?;
                tracing::info!(
                    image = %path.display(),
                    faces = detections.len(),
                    dropped = detections.dropped_regions,
                    "image processed"
                );

                let json = if pretty {
                    serde_json::to_string_pretty(&detections)?
                } else {
                    serde_json::to_string(&detections)?
                };
                println!("{json}");
            }
        }
        Commands::Inspect { model } => {
            let config = config::load(cli.config.as_deref())?;
            let engine = OrtEngine::load(
                &model.to_string_lossy(),
                config.device,
                config.intra_threads,
                1,
            )?;
            println!("{}", serde_json::to_string_pretty(engine.signature())?);
        }
        Commands::Config => {
            let config = config::load(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
