//! Batch detection jobs over a single uploaded image or video file.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::detect::Detector;
use crate::error::{PipelineError, PipelineResult};
use crate::media::{load_image, save_image, FrameReader, FrameWriter, VideoBackend};
use crate::storage::{ReservedResult, ResultStore};

/// A reader that keeps failing is treated as unreadable.
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 32;

/// Summary of one finished job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobResult {
    pub source_filename: String,
    pub result_filename: String,
    pub is_video: bool,
    /// Wall-clock seconds from job start to artifact completion, rounded to
    /// two decimals.
    pub processing_time_seconds: f64,
    /// One label per detection, in frame order.
    pub detected_labels: Vec<String>,
    pub object_count: usize,
    pub frames_processed: u64,
}

pub struct JobRunner {
    detector: Arc<Detector>,
    video: Arc<dyn VideoBackend>,
    store: ResultStore,
}

impl JobRunner {
    pub fn new(detector: Arc<Detector>, video: Arc<dyn VideoBackend>, store: ResultStore) -> Self {
        Self {
            detector,
            video,
            store,
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run detection over `input` and write one annotated artifact.
    ///
    /// The caller has already checked that `input` exists and carries an
    /// allowed extension. On failure no artifact is left behind.
    pub fn run_job(&self, input: &Path, is_video: bool) -> PipelineResult<JobResult> {
        let source_filename = input
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                PipelineError::Validation(format!("{} has no file name", input.display()))
            })?
            .to_string();

        log::info!(
            "job started: {} ({})",
            source_filename,
            if is_video { "video" } else { "image" }
        );
        let started = Instant::now();
        let outcome = if is_video {
            self.run_video(input, &source_filename)
        } else {
            self.run_image(input, &source_filename)
        };

        match outcome {
            Ok((reserved, labels, frames)) => {
                let result = JobResult {
                    source_filename,
                    result_filename: reserved.name,
                    is_video,
                    processing_time_seconds: round_seconds(started.elapsed().as_secs_f64()),
                    object_count: labels.len(),
                    detected_labels: labels,
                    frames_processed: frames,
                };
                log::info!(
                    "job finished: {} -> {} ({} objects, {} frames, {:.2}s)",
                    result.source_filename,
                    result.result_filename,
                    result.object_count,
                    result.frames_processed,
                    result.processing_time_seconds
                );
                Ok(result)
            }
            Err(err) => {
                log::error!("job failed: {}: {}", source_filename, err);
                Err(err)
            }
        }
    }

    fn run_image(
        &self,
        input: &Path,
        source_filename: &str,
    ) -> PipelineResult<(ReservedResult, Vec<String>, u64)> {
        let frame = load_image(input)?;
        let outcome = self.detector.detect_or_passthrough(&frame);
        let reserved = self.store.reserve(source_filename)?;
        if let Err(err) = save_image(&outcome.annotated, &reserved.path) {
            self.store.discard(&reserved);
            return Err(err);
        }
        let labels = outcome.detections.into_iter().map(|d| d.label).collect();
        Ok((reserved, labels, 1))
    }

    fn run_video(
        &self,
        input: &Path,
        source_filename: &str,
    ) -> PipelineResult<(ReservedResult, Vec<String>, u64)> {
        let mut reader = self.video.open_reader(input)?;
        let params = reader.params();
        let reserved = self.store.reserve(source_filename)?;

        let writer = match self.video.open_writer(&reserved.path, params) {
            Ok(writer) => writer,
            Err(err) => {
                self.store.discard(&reserved);
                return Err(err);
            }
        };

        let mut labels = Vec::new();
        match self.transcode(reader.as_mut(), writer, &mut labels) {
            Ok(frames) => Ok((reserved, labels, frames)),
            Err(err) => {
                drop(reader);
                self.store.discard(&reserved);
                Err(err)
            }
        }
    }

    /// Detect and re-encode every readable frame. Returns the number of frames
    /// written.
    fn transcode(
        &self,
        reader: &mut dyn FrameReader,
        mut writer: Box<dyn FrameWriter>,
        labels: &mut Vec<String>,
    ) -> PipelineResult<u64> {
        let mut written = 0u64;
        let mut consecutive_failures = 0u32;

        while let Some(next) = reader.next_frame() {
            let frame = match next {
                Ok(frame) => {
                    consecutive_failures = 0;
                    frame
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures > MAX_CONSECUTIVE_DECODE_FAILURES {
                        return Err(PipelineError::Io(format!(
                            "giving up after {} undecodable frames: {}",
                            consecutive_failures, err
                        )));
                    }
                    log::warn!("skipping undecodable frame {}: {}", written, err);
                    continue;
                }
            };

            let outcome = self.detector.detect_or_passthrough(&frame);
            writer.write_frame(&outcome.annotated)?;
            written += 1;
            labels.extend(outcome.detections.into_iter().map(|d| d.label));
        }

        writer.finish()?;
        Ok(written)
    }
}

fn round_seconds(seconds: f64) -> f64 {
    (seconds * 100.0).round() / 100.0
}
