//! Result artifact naming and history.
//!
//! Artifacts live in one flat directory as
//! `result_<YYYYMMDD_HHMMSS>[-n]_<original-filename>`. The optional `-n`
//! counter only appears when another job claimed the same name within the
//! same second. History is reconstructed by listing the directory.
//!
//! Uploaded inputs share the directory. Each upload claims its own file, and
//! a name that would read as an artifact gets an `upload_` prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};

pub const RESULT_PREFIX: &str = "result_";
const UPLOAD_PREFIX: &str = "upload_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_COLLISIONS: u32 = 1000;

/// A result path claimed for one job. The file exists (empty) until the job
/// writes it or `ResultStore::discard` removes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedResult {
    pub name: String,
    pub path: PathBuf,
}

/// An uploaded input written to its own file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUpload {
    pub name: String,
    pub path: PathBuf,
}

/// One artifact in the history listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResultEntry {
    pub original: String,
    pub result: String,
    /// RFC 3339, UTC.
    pub modified: String,
}

/// Parts recovered from an artifact file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultName<'a> {
    pub timestamp: &'a str,
    pub counter: Option<u32>,
    pub original: &'a str,
}

pub fn parse_result_name(name: &str) -> Option<ResultName<'_>> {
    static RESULT_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RESULT_NAME_RE
        .get_or_init(|| regex::Regex::new(r"^result_(\d{8}_\d{6})(?:-(\d+))?_(.+)$").unwrap());
    let caps = re.captures(name)?;
    Some(ResultName {
        timestamp: caps.get(1)?.as_str(),
        counter: match caps.get(2) {
            Some(m) => Some(m.as_str().parse().ok()?),
            None => None,
        },
        original: caps.get(3)?.as_str(),
    })
}

#[derive(Clone, Debug)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Use `dir` for artifacts, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            PipelineError::Io(format!("create results dir {}: {}", dir.display(), err))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claim a fresh artifact path for `original` stamped with the current
    /// local time.
    pub fn reserve(&self, original: &str) -> PipelineResult<ReservedResult> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.reserve_at(original, &timestamp)
    }

    fn reserve_at(&self, original: &str, timestamp: &str) -> PipelineResult<ReservedResult> {
        let (name, path, _) = self
            .create_unique(|counter| match counter {
                0 => format!("{}{}_{}", RESULT_PREFIX, timestamp, original),
                n => format!("{}{}-{}_{}", RESULT_PREFIX, timestamp, n, original),
            })
            .ok_or_else(|| {
                PipelineError::Io(format!(
                    "too many results named {} within one second",
                    original
                ))
            })??;
        Ok(ReservedResult { name, path })
    }

    /// Write an uploaded input under `filename`, or `<stem>-<n>.<ext>` when
    /// that name is taken. Never replaces an existing file.
    pub fn save_upload(&self, filename: &str, data: &[u8]) -> PipelineResult<StoredUpload> {
        let filename = if filename.to_ascii_lowercase().starts_with(RESULT_PREFIX) {
            format!("{}{}", UPLOAD_PREFIX, filename)
        } else {
            filename.to_string()
        };
        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (filename.as_str(), None),
        };

        let (name, path, mut file) = self
            .create_unique(|counter| match (counter, ext) {
                (0, _) => filename.clone(),
                (n, Some(ext)) => format!("{}-{}.{}", stem, n, ext),
                (n, None) => format!("{}-{}", stem, n),
            })
            .ok_or_else(|| PipelineError::Io(format!("too many uploads named {}", filename)))??;

        if let Err(err) = file.write_all(data).and_then(|()| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(PipelineError::Io(format!(
                "save upload {}: {}",
                path.display(),
                err
            )));
        }
        Ok(StoredUpload { name, path })
    }

    /// Create the first free name from `name_for(0)`, `name_for(1)`, ...
    /// `None` when every candidate is taken.
    fn create_unique(
        &self,
        name_for: impl Fn(u32) -> String,
    ) -> Option<PipelineResult<(String, PathBuf, File)>> {
        for counter in 0..MAX_COLLISIONS {
            let name = name_for(counter);
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Some(Ok((name, path, file))),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Some(Err(PipelineError::Io(format!(
                        "create {}: {}",
                        path.display(),
                        err
                    ))))
                }
            }
        }
        None
    }

    /// Remove a reserved or partially written artifact.
    pub fn discard(&self, reserved: &ReservedResult) {
        match fs::remove_file(&reserved.path) {
            Ok(()) => log::warn!("discarded incomplete result {}", reserved.name),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => log::error!("failed to discard {}: {}", reserved.path.display(), err),
        }
    }

    /// Path of a file stored in this directory, if `name` is a plain file name
    /// that exists.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_file_name(name) {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// All finished artifacts, newest first. A reservation stays empty until
    /// its job writes the artifact, so zero-length files are skipped.
    pub fn list(&self) -> PipelineResult<Vec<ResultEntry>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            PipelineError::Io(format!("list {}: {}", self.dir.display(), err))
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(parsed) = parse_result_name(&name) else {
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            found.push((
                modified,
                ResultEntry {
                    original: parsed.original.to_string(),
                    result: name.clone(),
                    modified: modified.to_rfc3339(),
                },
            ));
        }

        found.sort_by(|(a_time, a), (b_time, b)| {
            b_time.cmp(a_time).then_with(|| b.result.cmp(&a.result))
        });
        Ok(found.into_iter().map(|(_, entry)| entry).collect())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
