//! HTTP boundary.
//!
//! A std `TcpListener` polled against a shutdown flag; each accepted
//! connection is served on its own thread so a long-lived `/video_feed` does
//! not block uploads or control requests.

mod http;
mod multipart;

use anyhow::{anyhow, Result};
use serde_json::json;
use std::fs::File;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::PipelineError;
use crate::jobs::JobRunner;
use crate::media::MediaKind;
use crate::stream::{mjpeg, StreamController};

use http::{
    finish_chunked, read_request, write_chunk, write_head, write_json_response, write_response,
    HttpRequest, RequestError,
};

const FEED_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DISALLOWED_TYPE: &str = "File type not allowed. Only JPG, JPEG, PNG, MP4, AVI are supported.";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Requests already being served finish on
    /// their own threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

struct AppState {
    cfg: ApiConfig,
    jobs: Arc<JobRunner>,
    stream: StreamController,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, jobs: Arc<JobRunner>, stream: StreamController) -> Self {
        Self {
            state: AppState { cfg, jobs, stream },
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.state.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = Arc::new(self.state);
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state, shutdown_thread) {
                log::error!("api server stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<AppState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log::warn!("api request from {} failed: {}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &AppState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream, state.cfg.max_upload_bytes) {
        Ok(request) => request,
        Err(RequestError::Io(err)) => return Err(err.into()),
        Err(err) => {
            let (status, message) = match err {
                RequestError::PayloadTooLarge(_) => (413, "File too large".to_string()),
                RequestError::LengthRequired => (411, err.to_string()),
                _ => (400, err.to_string()),
            };
            log::warn!("api request rejected: {}", err);
            write_json_response(&mut stream, status, &json!({ "error": message }))?;
            return Ok(());
        }
    };
    log::debug!("{} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            write_json_response(&mut stream, 200, &json!({"status": "ok"}))?;
        }
        ("GET", "/start_camera") => match state.stream.start_stream() {
            Ok(status) => {
                write_json_response(&mut stream, 200, &json!({ "status": status.as_str() }))?
            }
            Err(err) => write_pipeline_error(&mut stream, 503, &err)?,
        },
        ("GET", "/stop_camera") => {
            let status = state.stream.stop_stream();
            write_json_response(&mut stream, 200, &json!({ "status": status.as_str() }))?;
        }
        ("GET", "/video_feed") => serve_video_feed(&mut stream, state)?,
        ("POST", "/detect_objects") => detect_objects(&mut stream, state, &request)?,
        ("GET", "/api/results") => match state.jobs.store().list() {
            Ok(entries) => write_json_response(&mut stream, 200, &json!(entries))?,
            Err(err) => write_pipeline_error(&mut stream, 500, &err)?,
        },
        ("GET", path) if path.starts_with("/results/") => {
            serve_result(&mut stream, state, &path["/results/".len()..])?
        }
        (_, "/health" | "/start_camera" | "/stop_camera" | "/video_feed" | "/detect_objects" | "/api/results") => {
            write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        }
        _ => {
            write_json_response(&mut stream, 404, &json!({"error": "not_found"}))?;
        }
    }
    Ok(())
}

fn write_pipeline_error(
    stream: &mut TcpStream,
    status: u16,
    err: &PipelineError,
) -> std::io::Result<()> {
    write_json_response(
        stream,
        status,
        &json!({ "error": err.to_string(), "code": err.code() }),
    )
}

fn serve_video_feed(stream: &mut TcpStream, state: &AppState) -> Result<()> {
    let frames = match state.stream.stream_frames() {
        Ok(frames) => frames,
        Err(err) => {
            write_pipeline_error(stream, 503, &err)?;
            return Ok(());
        }
    };
    stream.set_write_timeout(Some(FEED_WRITE_TIMEOUT))?;
    write_head(stream, 200, mjpeg::CONTENT_TYPE, None)?;

    let mut sent = 0u64;
    for chunk in frames {
        if let Err(err) = write_chunk(stream, &chunk) {
            log::debug!("video feed viewer gone after {} frames: {}", sent, err);
            return Ok(());
        }
        sent += 1;
    }
    finish_chunked(stream)?;
    log::debug!("video feed ended after {} frames", sent);
    Ok(())
}

fn detect_objects(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    let upload = match extract_upload(request) {
        Ok(upload) => upload,
        Err(err) => {
            log::warn!("upload rejected: {}", err);
            let message = match &err {
                PipelineError::Validation(message) => message.clone(),
                other => other.to_string(),
            };
            write_json_response(stream, 400, &json!({ "error": message }))?;
            return Ok(());
        }
    };

    let result = state
        .jobs
        .store()
        .save_upload(&upload.filename, upload.data)
        .and_then(|saved| {
            log::info!("saved upload {} ({} bytes)", saved.name, upload.data.len());
            state.jobs.run_job(&saved.path, upload.kind.is_video())
        });
    match result {
        Ok(job) => write_json_response(
            stream,
            200,
            &json!({
                "success": true,
                "original": job.source_filename,
                "result": job.result_filename,
                "processing_time": job.processing_time_seconds,
                "detected_objects": job.detected_labels,
                "object_count": job.object_count,
                "is_video": job.is_video,
            }),
        )?,
        Err(err) => write_json_response(
            stream,
            500,
            &json!({ "error": format!("An error occurred during processing: {}", err) }),
        )?,
    }
    Ok(())
}

struct Upload<'a> {
    filename: String,
    kind: MediaKind,
    data: &'a [u8],
}

fn extract_upload(request: &HttpRequest) -> Result<Upload<'_>, PipelineError> {
    let no_file = || PipelineError::Validation("No file uploaded".to_string());
    let boundary = request
        .header("content-type")
        .and_then(multipart::boundary)
        .ok_or_else(no_file)?;
    let parts = multipart::parse(&request.body, &boundary)
        .map_err(|err| PipelineError::Validation(format!("Malformed upload: {}", err)))?;
    let part = parts.into_iter().find(|part| part.name == "file").ok_or_else(no_file)?;

    let raw_name = part.filename.unwrap_or_default();
    if raw_name.is_empty() {
        return Err(PipelineError::Validation("No selected file".to_string()));
    }
    if MediaKind::from_path(&raw_name).is_none() {
        return Err(PipelineError::Validation(DISALLOWED_TYPE.to_string()));
    }
    let filename = sanitize_filename(&raw_name);
    let kind = MediaKind::from_path(&filename)
        .ok_or_else(|| PipelineError::Validation(DISALLOWED_TYPE.to_string()))?;

    Ok(Upload {
        filename,
        kind,
        data: part.data,
    })
}

/// Reduce a client-supplied name to a safe base name of `[A-Za-z0-9._-]`.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '-' | '_' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

fn serve_result(stream: &mut TcpStream, state: &AppState, name: &str) -> Result<()> {
    let Some(path) = state.jobs.store().resolve(name) else {
        write_json_response(stream, 404, &json!({"error": "not_found"}))?;
        return Ok(());
    };
    let mut file = File::open(&path)?;
    let len = file.metadata()?.len();
    write_head(stream, 200, content_type_for(&path), Some(len))?;
    std::io::copy(&mut file, stream)?;
    Ok(())
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
