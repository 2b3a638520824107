use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use image::{Rgb, RgbImage};
use lookout::api::{ApiConfig, ApiHandle, ApiServer};
use lookout::capture::{CameraConfig, ConfiguredCamera};
use lookout::detect::{Detector, StubBackend};
use lookout::media::UnsupportedVideoBackend;
use lookout::{JobRunner, ResultStore, StreamController, StreamOptions};

const BOUNDARY: &str = "lookout-test-boundary";

struct TestApi {
    dir: TempDir,
    stream: StreamController,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_camera("stub://test")
    }

    fn with_camera(device: &str) -> Result<Self> {
        let dir = tempdir()?;
        let detector = Arc::new(Detector::from_backend(StubBackend::fixed("person", 0.9)));
        let jobs = Arc::new(JobRunner::new(
            detector.clone(),
            Arc::new(UnsupportedVideoBackend),
            ResultStore::open(dir.path())?,
        ));
        let camera = ConfiguredCamera::new(CameraConfig {
            device: device.to_string(),
            width: 64,
            height: 48,
            target_fps: 30,
        });
        let stream = StreamController::new(
            Arc::new(camera),
            detector,
            StreamOptions {
                jpeg_quality: 70,
                idle_timeout: Duration::from_secs(5),
            },
        );
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_upload_bytes: 64 * 1024,
        };
        let api_handle = ApiServer::new(api_config, jobs, stream.clone()).spawn()?;

        Ok(Self {
            dir,
            stream,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn connect(&self) -> Result<TcpStream> {
        connect(self.handle().addr)
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = self.connect()?;
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn upload(&self, field: &str, filename: &str, data: &[u8]) -> Result<(String, Vec<u8>)> {
        upload_to(self.handle().addr, field, filename, data)
    }

    fn post_raw(&self, content_type: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
        post_to(self.handle().addr, content_type, body)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        self.stream.shutdown();
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    Ok(stream)
}

fn upload_to(
    addr: SocketAddr,
    field: &str,
    filename: &str,
    data: &[u8],
) -> Result<(String, Vec<u8>)> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    post_to(
        addr,
        &format!("multipart/form-data; boundary={BOUNDARY}"),
        &body,
    )
}

fn post_to(addr: SocketAddr, content_type: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut stream = connect(addr)?;
    let head = format!(
        "POST /detect_objects HTTP/1.1\r\nHost: localhost\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    read_response(&mut stream)
}

fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

fn json(body: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(body)?)
}

fn png_bytes() -> Result<Vec<u8>> {
    png_sized(32, 24)
}

fn png_sized(width: u32, height: u32) -> Result<Vec<u8>> {
    let img = RgbImage::from_pixel(width, height, Rgb([30, 90, 150]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[test]
fn health_endpoint_reports_ok() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)?["status"], "ok");
    Ok(())
}

#[test]
fn camera_start_and_stop_are_idempotent() -> Result<()> {
    let api = TestApi::new()?;

    let (_, body) = api.get("/stop_camera")?;
    assert_eq!(json(&body)?["status"], "stopped");

    let (headers, body) = api.get("/start_camera")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)?["status"], "starting");
    let (_, body) = api.get("/start_camera")?;
    assert_eq!(json(&body)?["status"], "already running");

    let (_, body) = api.get("/stop_camera")?;
    assert_eq!(json(&body)?["status"], "stopped");
    assert!(api.stream.session().wait_until_released(Duration::from_secs(5)));
    Ok(())
}

#[test]
fn image_upload_returns_summary_and_serves_result() -> Result<()> {
    let api = TestApi::new()?;
    let png = png_bytes()?;

    let (headers, body) = api.upload("file", "my cat.png", &png)?;
    assert!(headers.contains("200 OK"), "{headers}");
    let summary = json(&body)?;
    assert_eq!(summary["success"], true);
    assert_eq!(summary["original"], "my_cat.png");
    assert_eq!(summary["object_count"], 1);
    assert_eq!(summary["detected_objects"], serde_json::json!(["person"]));
    assert_eq!(summary["is_video"], false);
    assert!(summary["processing_time"].as_f64().is_some());
    assert!(api.dir.path().join("my_cat.png").is_file());

    let result = summary["result"].as_str().expect("result name").to_string();
    assert!(result.starts_with("result_") && result.ends_with("_my_cat.png"));

    let (headers, body) = api.get(&format!("/results/{result}"))?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: image/png"));
    let annotated = image::load_from_memory(&body)?.into_rgb8();
    assert_eq!(annotated.dimensions(), (32, 24));

    let (_, body) = api.get("/api/results")?;
    let history = json(&body)?;
    let entries = history.as_array().expect("history list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["original"], "my_cat.png");
    assert_eq!(entries[0]["result"], result.as_str());
    Ok(())
}

#[test]
fn upload_named_like_a_result_leaves_the_artifact_intact() -> Result<()> {
    let api = TestApi::new()?;
    let (_, body) = api.upload("file", "cat.png", &png_bytes()?)?;
    let result = json(&body)?["result"]
        .as_str()
        .expect("result name")
        .to_string();
    let artifact = api.dir.path().join(&result);
    let annotated = std::fs::read(&artifact)?;

    let raw = png_sized(16, 16)?;
    let (headers, body) = api.upload("file", &result, &raw)?;
    assert!(headers.contains("200 OK"), "{headers}");
    let summary = json(&body)?;
    assert_eq!(summary["original"], format!("upload_{result}").as_str());
    assert_eq!(std::fs::read(&artifact)?, annotated);

    let (_, body) = api.get("/api/results")?;
    let history = json(&body)?;
    let results: Vec<&str> = history
        .as_array()
        .expect("history list")
        .iter()
        .filter_map(|entry| entry["result"].as_str())
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.contains(&result.as_str()));
    Ok(())
}

#[test]
fn concurrent_uploads_of_one_name_get_separate_inputs() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.handle().addr;
    let sizes = [(20u32, 10u32), (40, 30), (12, 36), (28, 8)];

    let summaries = std::thread::scope(|scope| {
        let workers: Vec<_> = sizes
            .iter()
            .map(|&(w, h)| {
                scope.spawn(move || -> Result<(u32, u32, Value)> {
                    let (headers, body) = upload_to(addr, "file", "same.png", &png_sized(w, h)?)?;
                    assert!(headers.contains("200 OK"), "{headers}");
                    Ok((w, h, json(&body)?))
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("upload thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    let mut inputs = Vec::new();
    for (w, h, summary) in summaries {
        let input = summary["original"].as_str().expect("input name").to_string();
        let stored = image::open(api.dir.path().join(&input))?.into_rgb8();
        assert_eq!(stored.dimensions(), (w, h), "input {input} was overwritten");
        let result = summary["result"].as_str().expect("result name");
        let annotated = image::open(api.dir.path().join(result))?.into_rgb8();
        assert_eq!(annotated.dimensions(), (w, h));
        inputs.push(input);
    }
    inputs.sort();
    inputs.dedup();
    assert_eq!(inputs.len(), sizes.len());
    Ok(())
}

#[test]
fn upload_validation_errors() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.upload("attachment", "cat.png", b"x")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(json(&body)?["error"], "No file uploaded");

    let (headers, body) = api.post_raw("application/json", b"{}")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(json(&body)?["error"], "No file uploaded");

    let (headers, body) = api.upload("file", "", b"x")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(json(&body)?["error"], "No selected file");

    let (headers, body) = api.upload("file", "anim.gif", b"GIF89a")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(
        json(&body)?["error"],
        "File type not allowed. Only JPG, JPEG, PNG, MP4, AVI are supported."
    );
    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let mut stream = api.connect()?;
    let head = format!(
        "POST /detect_objects HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\n\r\n",
        1024 * 1024
    );
    stream.write_all(head.as_bytes())?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.contains("413 Payload Too Large"));
    Ok(())
}

#[test]
fn processing_failure_is_a_server_error() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.upload("file", "clip.mp4", b"not really a video")?;
    assert!(headers.contains("500 Internal Server Error"));
    let error = json(&body)?["error"].as_str().unwrap_or_default().to_string();
    assert!(error.starts_with("An error occurred during processing: "));

    let (_, body) = api.get("/api/results")?;
    assert_eq!(json(&body)?, serde_json::json!([]));
    Ok(())
}

#[test]
fn results_route_rejects_traversal_and_unknown_names() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.get("/results/../Cargo.toml")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.get("/results/missing.png")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.get("/nope")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.get("/detect_objects")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn video_feed_streams_multipart_jpeg() -> Result<()> {
    let api = TestApi::new()?;
    let mut stream = api.connect()?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n";
    while !received.windows(marker.len()).any(|w| w == marker) {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "feed closed before the first frame");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("Transfer-Encoding: chunked"));
    assert!(api.stream.session().generation() >= 1);
    drop(stream);

    let (_, body) = api.get("/stop_camera")?;
    assert_eq!(json(&body)?["status"], "stopped");
    Ok(())
}

#[test]
fn video_feed_reports_unavailable_camera() -> Result<()> {
    let api = TestApi::with_camera("/dev/lookout-missing-camera")?;
    let (headers, body) = api.get("/video_feed")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(json(&body)?["code"], "device_error");
    assert!(!api.stream.session().is_active());
    Ok(())
}
