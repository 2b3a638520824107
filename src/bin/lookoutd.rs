//! lookoutd - object detection service
//!
//! This daemon:
//! 1. Loads configuration (file named by `--config` / `LOOKOUT_CONFIG`, then env)
//! 2. Builds the detector once and shares it between jobs and the live stream
//! 3. Serves uploads, results and the camera feed over HTTP
//! 4. Stops the camera and the server on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use lookout::{
    api::{ApiConfig, ApiServer},
    media::default_video_backend,
    ConfiguredCamera, JobRunner, LookoutConfig, ResultStore, StreamController,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = LookoutConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let detector = Arc::new(config.detector.build_detector()?);
    let store = ResultStore::open(&config.upload_dir)?;
    let jobs = Arc::new(JobRunner::new(
        detector.clone(),
        default_video_backend()?,
        store,
    ));
    let stream = StreamController::new(
        Arc::new(ConfiguredCamera::new(config.camera.clone())),
        detector,
        config.stream_options(),
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        max_upload_bytes: config.max_upload_bytes,
    };
    let api_handle = ApiServer::new(api_config, jobs, stream.clone()).spawn()?;
    log::info!("lookoutd listening on {}", api_handle.addr);
    log::info!(
        "uploads and results in {}, camera {}",
        config.upload_dir.display(),
        config.camera.device
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("lookoutd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping camera and API server...");
    stream.shutdown();
    api_handle.stop()?;

    Ok(())
}
