//! Success markers.
//!
//! A success marker is the sole proof that a job completed. A worker writes
//! its marker only after every block it owns has been processed; a job
//! without a marker is a failed job.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// The extension of success marker files.
const MARKER_EXTENSION: &str = "success";

/// Represents the contents of a success marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMarker {
    /// The name of the task.
    pub task_name: String,
    /// The job that completed.
    pub job_id: usize,
    /// The attempt the job belonged to.
    pub attempt: u32,
    /// Whether the job performed the leader's work.
    pub leader: bool,
    /// The number of blocks the job processed.
    pub blocks: usize,
    /// When the job completed.
    pub finished_at: DateTime<Utc>,
}

/// Represents a directory of success markers for one attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerStore {
    /// The marker directory.
    dir: PathBuf,
    /// The name of the task the markers belong to.
    task_name: String,
}

impl MarkerStore {
    /// Constructs a marker store over the given directory.
    pub fn new(dir: impl Into<PathBuf>, task_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            task_name: task_name.into(),
        }
    }

    /// Gets the marker directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Gets the marker path of a job.
    ///
    /// Markers are keyed by `<task_name>_<job_id>`.
    pub fn path(&self, job_id: usize) -> PathBuf {
        self.dir.join(format!(
            "{name}_{job_id}.{MARKER_EXTENSION}",
            name = self.task_name
        ))
    }

    /// Determines if the marker of a job exists.
    pub fn exists(&self, job_id: usize) -> bool {
        self.path(job_id).is_file()
    }

    /// Reads the marker of a job.
    ///
    /// Returns `Ok(None)` if the job has no marker.
    pub fn read(&self, job_id: usize) -> Result<Option<SuccessMarker>> {
        let path = self.path(job_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read marker `{path}`", path = path.display())
                });
            }
        };

        serde_json::from_str(&contents)
            .map(Some)
            .with_context(|| format!("failed to parse marker `{path}`", path = path.display()))
    }

    /// Writes the marker of a job.
    ///
    /// The marker is written to a temporary file and then renamed so that a
    /// partially written marker is never observed.
    pub fn write(&self, marker: &SuccessMarker) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!(
                "failed to create marker directory `{path}`",
                path = self.dir.display()
            )
        })?;

        let path = self.path(marker.job_id);
        let mut file = tempfile::NamedTempFile::new_in(&self.dir).with_context(|| {
            format!(
                "failed to create temporary marker in `{path}`",
                path = self.dir.display()
            )
        })?;
        serde_json::to_writer(&mut file, marker)?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(&path).with_context(|| {
            format!("failed to persist marker `{path}`", path = path.display())
        })?;
        Ok(())
    }
}
