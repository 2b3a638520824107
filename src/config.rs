use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CameraConfig;
use crate::detect::{Annotator, BackendRegistry, CpuBackend, Detector, StubBackend};
use crate::stream::StreamOptions;

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DETECTOR: &str = "cpu";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct LookoutConfigFile {
    api: Option<ApiConfigFile>,
    upload_dir: Option<PathBuf>,
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    font_path: Option<PathBuf>,
    confidence: Option<f32>,
    iou: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LookoutConfig {
    pub api_addr: String,
    pub max_upload_bytes: usize,
    /// Uploads and result artifacts share this directory.
    pub upload_dir: PathBuf,
    pub camera: CameraConfig,
    pub stream: StreamSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub jpeg_quality: u8,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub font_path: Option<PathBuf>,
    pub confidence: f32,
    pub iou: f32,
    pub input_size: u32,
}

impl LookoutConfig {
    /// Defaults, then the file named by `LOOKOUT_CONFIG`, then `LOOKOUT_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LOOKOUT_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, but with an explicit config file instead of
    /// `LOOKOUT_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => LookoutConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LookoutConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let default_camera = CameraConfig::default();

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_upload_bytes: api.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            upload_dir: file
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            camera: CameraConfig {
                device: camera.device.unwrap_or(default_camera.device),
                width: camera.width.unwrap_or(default_camera.width),
                height: camera.height.unwrap_or(default_camera.height),
                target_fps: camera.target_fps.unwrap_or(default_camera.target_fps),
            },
            stream: StreamSettings {
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                idle_timeout: Duration::from_secs(
                    stream
                        .idle_timeout_secs
                        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
                ),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                font_path: detector.font_path,
                confidence: detector.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: detector.iou.unwrap_or(DEFAULT_IOU),
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("LOOKOUT_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = non_empty_env("LOOKOUT_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(device) = non_empty_env("LOOKOUT_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(backend) = non_empty_env("LOOKOUT_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("LOOKOUT_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("LOOKOUT_FONT_PATH") {
            self.detector.font_path = Some(PathBuf::from(path));
        }
        if let Some(limit) = non_empty_env("LOOKOUT_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = limit
                .parse()
                .map_err(|_| anyhow!("LOOKOUT_MAX_UPLOAD_BYTES must be an integer byte count"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid api addr '{}': {}", self.api_addr, e))?;
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be non-zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        for (name, value) in [
            ("confidence", self.detector.confidence),
            ("iou", self.detector.iou),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detector {} must be within [0, 1]", name));
            }
        }
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(anyhow!("detector input_size must be a positive multiple of 32"));
        }
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            jpeg_quality: self.stream.jpeg_quality,
            idle_timeout: self.stream.idle_timeout,
        }
    }
}

impl DetectorSettings {
    /// Build the shared detector: register every available backend, select
    /// the configured one, and attach the annotator.
    pub fn build_detector(&self) -> Result<Detector> {
        let mut registry = BackendRegistry::new();
        registry.register(CpuBackend::default());
        registry.register(StubBackend::default());
        self.register_model_backend(&mut registry)?;
        registry.set_default(&self.backend)?;

        let annotator = match &self.font_path {
            Some(path) => Annotator::with_font_file(path)?,
            None => Annotator::new(),
        };
        let detector = Detector::new(registry.into_default()?, annotator);
        detector.warm_up().context("warm up detector")?;
        log::info!("detector backend: {}", detector.backend_name());
        Ok(detector)
    }

    #[cfg(feature = "backend-tract")]
    fn register_model_backend(&self, registry: &mut BackendRegistry) -> Result<()> {
        if let Some(path) = &self.model_path {
            let backend = crate::detect::TractBackend::new(path, self.input_size)?
                .with_threshold(self.confidence)
                .with_iou_threshold(self.iou);
            registry.register(backend);
        } else if self.backend == "tract" {
            return Err(anyhow!("detector backend 'tract' requires a model_path"));
        }
        Ok(())
    }

    #[cfg(not(feature = "backend-tract"))]
    fn register_model_backend(&self, _registry: &mut BackendRegistry) -> Result<()> {
        if self.model_path.is_some() {
            log::warn!("model_path is set but this build lacks the backend-tract feature");
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<LookoutConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
