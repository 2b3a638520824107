//! detect_file - run one batch detection job on a local file
//!
//! Prints the job summary as JSON. Useful for checking that a model and the
//! video backend work before starting the service.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use lookout::{media::default_video_backend, JobRunner, LookoutConfig, MediaKind, ResultStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image (.jpg, .jpeg, .png) or video (.mp4, .avi) to process.
    input: PathBuf,

    /// Config file (TOML or JSON).
    #[arg(long, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Detector backend (overrides config).
    #[arg(long)]
    backend: Option<String>,

    /// Directory for the result artifact (overrides config).
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut config = LookoutConfig::load_from(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.detector.backend = backend;
    }

    if !args.input.is_file() {
        return Err(anyhow!("{} does not exist", args.input.display()));
    }
    let kind = MediaKind::from_path(&args.input).ok_or_else(|| {
        anyhow!(
            "{}: only JPG, JPEG, PNG, MP4, AVI are supported",
            args.input.display()
        )
    })?;

    let detector = Arc::new(config.detector.build_detector()?);
    let store = ResultStore::open(args.out_dir.unwrap_or(config.upload_dir))?;
    let runner = JobRunner::new(detector, default_video_backend()?, store);

    let result = runner
        .run_job(&args.input, kind.is_video())
        .with_context(|| format!("process {}", args.input.display()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
