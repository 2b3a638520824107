use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::{Rgb, RgbImage};
use tempfile::TempDir;

use lookout::detect::{Detector, StubBackend};
use lookout::media::{FrameReader, FrameWriter, VideoBackend, VideoParams};
use lookout::storage::parse_result_name;
use lookout::{JobRunner, PipelineError, PipelineResult, ResultStore};

/// In-memory video codec: decodes a scripted frame list, records encoded
/// frames, and tracks open handles.
#[derive(Clone, Default)]
struct MemoryVideo {
    frames: Arc<Mutex<Vec<PipelineResult<RgbImage>>>>,
    written: Arc<Mutex<Vec<RgbImage>>>,
    open_handles: Arc<AtomicUsize>,
    fail_open: bool,
    fail_write_at: Option<usize>,
}

impl MemoryVideo {
    fn with_frames(frames: Vec<PipelineResult<RgbImage>>) -> Self {
        Self {
            frames: Arc::new(Mutex::new(frames)),
            ..Self::default()
        }
    }

    fn written(&self) -> Vec<RgbImage> {
        self.written.lock().unwrap().clone()
    }

    fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

struct MemoryReader {
    frames: VecDeque<PipelineResult<RgbImage>>,
    params: VideoParams,
    handles: Arc<AtomicUsize>,
}

impl FrameReader for MemoryReader {
    fn params(&self) -> VideoParams {
        self.params
    }

    fn next_frame(&mut self) -> Option<PipelineResult<RgbImage>> {
        self.frames.pop_front()
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryWriter {
    path: PathBuf,
    written: Arc<Mutex<Vec<RgbImage>>>,
    count: usize,
    fail_write_at: Option<usize>,
    handles: Arc<AtomicUsize>,
}

impl FrameWriter for MemoryWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
        if self.fail_write_at == Some(self.count) {
            return Err(PipelineError::encoding("disk full"));
        }
        self.count += 1;
        self.written.lock().unwrap().push(frame.clone());
        std::fs::write(&self.path, format!("{} frames", self.count))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> PipelineResult<()> {
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl VideoBackend for MemoryVideo {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_reader(&self, path: &Path) -> PipelineResult<Box<dyn FrameReader>> {
        if self.fail_open {
            return Err(PipelineError::Io(format!("cannot open {}", path.display())));
        }
        let frames: VecDeque<_> = self.frames.lock().unwrap().drain(..).collect();
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReader {
            frames,
            params: VideoParams {
                width: 32,
                height: 24,
                fps: 25.0,
            },
            handles: self.open_handles.clone(),
        }))
    }

    fn open_writer(&self, path: &Path, _params: VideoParams) -> PipelineResult<Box<dyn FrameWriter>> {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            written: self.written.clone(),
            count: 0,
            fail_write_at: self.fail_write_at,
            handles: self.open_handles.clone(),
        }))
    }
}

fn frame(shade: u8) -> RgbImage {
    RgbImage::from_pixel(32, 24, Rgb([shade, shade / 2, 255 - shade]))
}

fn result_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.starts_with("result_") {
            names.push(name);
        }
    }
    Ok(names)
}

fn runner(dir: &TempDir, backend: StubBackend, video: MemoryVideo) -> Result<JobRunner> {
    Ok(JobRunner::new(
        Arc::new(Detector::from_backend(backend)),
        Arc::new(video),
        ResultStore::open(dir.path())?,
    ))
}

fn video_input(dir: &TempDir) -> Result<PathBuf> {
    let path = dir.path().join("clip.mp4");
    std::fs::write(&path, b"container")?;
    Ok(path)
}

#[test]
fn three_frame_video_yields_one_label_per_frame() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let video = MemoryVideo::with_frames(vec![Ok(frame(10)), Ok(frame(20)), Ok(frame(30))]);
    let runner = runner(&dir, StubBackend::fixed("person", 0.9), video.clone())?;

    let result = runner.run_job(&video_input(&dir)?, true)?;
    assert_eq!(result.detected_labels, vec!["person", "person", "person"]);
    assert_eq!(result.object_count, 3);
    assert_eq!(result.frames_processed, 3);
    assert!(result.is_video);
    assert_eq!(result.source_filename, "clip.mp4");

    let parsed = parse_result_name(&result.result_filename).expect("result name");
    assert_eq!(parsed.original, "clip.mp4");
    assert!(dir.path().join(&result.result_filename).is_file());
    assert_eq!(video.written().len(), 3);
    assert_eq!(video.open_handles(), 0);
    Ok(())
}

#[test]
fn undecodable_frame_is_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let video = MemoryVideo::with_frames(vec![
        Ok(frame(10)),
        Err(PipelineError::io("corrupt packet")),
        Ok(frame(30)),
    ]);
    let runner = runner(&dir, StubBackend::fixed("car", 0.7), video.clone())?;

    let result = runner.run_job(&video_input(&dir)?, true)?;
    assert_eq!(result.frames_processed, 2);
    assert_eq!(video.written().len(), 2);
    assert_eq!(result.object_count, 2);
    Ok(())
}

#[test]
fn failing_detector_passes_video_frames_through() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let inputs = vec![frame(10), frame(20)];
    let video = MemoryVideo::with_frames(inputs.iter().cloned().map(Ok).collect());
    let runner = runner(&dir, StubBackend::failing(), video.clone())?;

    let result = runner.run_job(&video_input(&dir)?, true)?;
    assert_eq!(result.object_count, 0);
    assert!(result.detected_labels.is_empty());
    assert_eq!(video.written(), inputs);
    Ok(())
}

#[test]
fn encoder_failure_aborts_and_removes_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut video = MemoryVideo::with_frames(vec![Ok(frame(1)), Ok(frame(2)), Ok(frame(3))]);
    video.fail_write_at = Some(1);
    let runner = runner(&dir, StubBackend::fixed("person", 0.9), video.clone())?;

    let err = runner.run_job(&video_input(&dir)?, true).unwrap_err();
    assert!(matches!(err, PipelineError::Encoding(_)));
    assert!(result_files(dir.path())?.is_empty());
    assert_eq!(video.open_handles(), 0);
    Ok(())
}

#[test]
fn unreadable_video_fails_without_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let video = MemoryVideo {
        fail_open: true,
        ..MemoryVideo::default()
    };
    let runner = runner(&dir, StubBackend::fixed("person", 0.9), video)?;

    let err = runner.run_job(&video_input(&dir)?, true).unwrap_err();
    assert!(matches!(err, PipelineError::Io(_)));
    assert!(result_files(dir.path())?.is_empty());
    Ok(())
}

#[test]
fn persistent_decode_errors_fail_the_job() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let frames = (0..40)
        .map(|_| Err(PipelineError::io("bad frame")))
        .collect();
    let video = MemoryVideo::with_frames(frames);
    let runner = runner(&dir, StubBackend::fixed("person", 0.9), video.clone())?;

    let err = runner.run_job(&video_input(&dir)?, true).unwrap_err();
    assert!(matches!(err, PipelineError::Io(_)));
    assert!(result_files(dir.path())?.is_empty());
    assert_eq!(video.open_handles(), 0);
    Ok(())
}

#[test]
fn image_job_writes_one_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("street.png");
    frame(90).save(&input)?;
    let runner = runner(&dir, StubBackend::fixed("person", 0.9), MemoryVideo::default())?;

    let result = runner.run_job(&input, false)?;
    assert_eq!(result.object_count, result.detected_labels.len());
    assert_eq!(result.detected_labels, vec!["person"]);
    assert_eq!(result.frames_processed, 1);
    assert!(!result.is_video);
    assert!(result.processing_time_seconds >= 0.0);

    let artifacts = result_files(dir.path())?;
    assert_eq!(artifacts, vec![result.result_filename.clone()]);
    let annotated = image::open(dir.path().join(&result.result_filename))?.into_rgb8();
    assert_eq!(annotated.dimensions(), (32, 24));
    assert_ne!(annotated, frame(90));
    Ok(())
}

#[test]
fn failing_detector_still_writes_unannotated_image() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("street.png");
    let original = frame(120);
    original.save(&input)?;
    let runner = runner(&dir, StubBackend::failing(), MemoryVideo::default())?;

    let result = runner.run_job(&input, false)?;
    assert_eq!(result.object_count, 0);
    let written = image::open(dir.path().join(&result.result_filename))?.into_rgb8();
    assert_eq!(written, original);
    Ok(())
}

#[test]
fn undecodable_image_fails_without_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("broken.jpg");
    std::fs::write(&input, b"definitely not a jpeg")?;
    let runner = runner(&dir, StubBackend::fixed("person", 0.9), MemoryVideo::default())?;

    let err = runner.run_job(&input, false).unwrap_err();
    assert!(matches!(err, PipelineError::Io(_)));
    assert!(result_files(dir.path())?.is_empty());
    Ok(())
}
