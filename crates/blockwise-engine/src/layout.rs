//! Filesystem layout of a task instance.
//!
//! The layout beneath the temporary folder is:
//!
//! ```text
//! <tmp_folder>/
//! ├─ logs/                          # Standard output of each job
//! │  ├─ <task_id>_<job_id>.log
//! ├─ error_logs/                    # Standard error of each job
//! │  ├─ <task_id>_<job_id>.err
//! ├─ <task_name>_<identifier>.log   # The driver's completion log
//! ├─ <task_id>/
//! │  ├─ attempts/
//! │  │  ├─ 1/                       # First attempt
//! │  │  │  ├─ configs/              # One configuration per job
//! │  │  │  ├─ markers/              # One success marker per finished job
//! │  │  │  ├─ scripts/              # Batch scripts (cluster backends only)
//! │  │  │  ├─ <task_id>_submit.sh   # Submission script (cluster backends only)
//! │  │  ├─ 2/                       # Second attempt (first retry)
//! │  │  │  ├─ ...
//! ```
//!
//! Every attempt has its own directory so that a job left over from an
//! earlier attempt can never be mistaken for a job of the current one.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::job::job_id_from_path;

/// The name of the job standard output directory.
const LOGS_DIR: &str = "logs";

/// The name of the job standard error directory.
const ERROR_LOGS_DIR: &str = "error_logs";

/// The name of the attempts directory.
const ATTEMPTS_DIR: &str = "attempts";

/// The name of the job configuration directory of an attempt.
const CONFIGS_DIR: &str = "configs";

/// The name of the success marker directory of an attempt.
const MARKERS_DIR: &str = "markers";

/// The name of the batch script directory of an attempt.
const SCRIPTS_DIR: &str = "scripts";

/// The extension of job configuration files.
pub const CONFIG_EXTENSION: &str = "config";

/// Creates a directory and all of its parents.
pub(crate) fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| {
        format!(
            "failed to create directory `{path}`",
            path = path.display()
        )
    })
}

/// Represents the filesystem layout of a single task instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    /// The temporary folder shared by all tasks.
    tmp_folder: PathBuf,
    /// The name of the task (e.g. `write`).
    task_name: String,
    /// The identifier distinguishing instances of the same task.
    identifier: Option<String>,
}

impl TaskLayout {
    /// Constructs a new task layout.
    pub fn new(
        tmp_folder: impl Into<PathBuf>,
        task_name: impl Into<String>,
        identifier: Option<String>,
    ) -> Self {
        Self {
            tmp_folder: tmp_folder.into(),
            task_name: task_name.into(),
            identifier,
        }
    }

    /// Gets the temporary folder.
    pub fn tmp_folder(&self) -> &Path {
        &self.tmp_folder
    }

    /// Gets the task name.
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Gets the identifier of the task instance, if there is one.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Gets the task identifier used to name jobs and log files.
    ///
    /// This is `<task_name>_<identifier>`, or just the task name if the task
    /// has no identifier.
    pub fn task_id(&self) -> String {
        match &self.identifier {
            Some(identifier) => format!("{name}_{identifier}", name = self.task_name),
            None => self.task_name.clone(),
        }
    }

    /// Gets the directory containing job standard output logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.tmp_folder.join(LOGS_DIR)
    }

    /// Gets the directory containing job standard error logs.
    pub fn error_logs_dir(&self) -> PathBuf {
        self.tmp_folder.join(ERROR_LOGS_DIR)
    }

    /// Gets the standard output log of a job.
    pub fn log_file(&self, job_id: usize) -> PathBuf {
        self.logs_dir()
            .join(format!("{task_id}_{job_id}.log", task_id = self.task_id()))
    }

    /// Gets the standard error log of a job.
    pub fn error_file(&self, job_id: usize) -> PathBuf {
        self.error_logs_dir()
            .join(format!("{task_id}_{job_id}.err", task_id = self.task_id()))
    }

    /// Gets the path of the driver's completion log.
    ///
    /// The existence of this file marks the task instance as done.
    pub fn completion_log(&self) -> PathBuf {
        self.tmp_folder
            .join(format!("{task_id}.log", task_id = self.task_id()))
    }

    /// Gets the layout of an execution attempt (starting at 1).
    pub fn attempt(&self, attempt: u32) -> AttemptLayout {
        AttemptLayout {
            root: self
                .tmp_folder
                .join(self.task_id())
                .join(ATTEMPTS_DIR)
                .join(attempt.to_string()),
            task_name: self.task_name.clone(),
            task_id: self.task_id(),
            attempt,
        }
    }

    /// Gets the attempts that have a directory, in ascending order.
    ///
    /// A task instance that never ran has no attempts.
    pub fn attempts(&self) -> Result<Vec<u32>> {
        let dir = self.tmp_folder.join(self.task_id()).join(ATTEMPTS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read directory `{dir}`", dir = dir.display())
                });
            }
        };

        let mut attempts = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read directory `{dir}`", dir = dir.display()))?;
            if let Some(attempt) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                attempts.push(attempt);
            }
        }

        attempts.sort_unstable();
        Ok(attempts)
    }

    /// Creates the shared log directories.
    pub fn ensure(&self) -> Result<()> {
        create_dir(&self.logs_dir())?;
        create_dir(&self.error_logs_dir())
    }
}

/// Represents the filesystem layout of one execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLayout {
    /// The root directory of the attempt.
    root: PathBuf,
    /// The name of the task.
    task_name: String,
    /// The task identifier.
    task_id: String,
    /// The attempt number.
    attempt: u32,
}

impl AttemptLayout {
    /// Gets the root directory of the attempt.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Gets the task identifier.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Gets the job configuration directory.
    pub fn configs_dir(&self) -> PathBuf {
        self.root.join(CONFIGS_DIR)
    }

    /// Gets the configuration path of a job.
    ///
    /// The job id is the numeric suffix of the file stem.
    pub fn config_path(&self, job_id: usize) -> PathBuf {
        self.configs_dir().join(format!(
            "{task_id}_job_{job_id}.{CONFIG_EXTENSION}",
            task_id = self.task_id
        ))
    }

    /// Gets the ids of the jobs configured for the attempt, in ascending
    /// order.
    pub fn job_ids(&self) -> Result<Vec<usize>> {
        let dir = self.configs_dir();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory `{dir}`", dir = dir.display()))?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to read directory `{dir}`", dir = dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) == Some(CONFIG_EXTENSION) {
                ids.push(job_id_from_path(&path)?);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Gets the success marker directory.
    pub fn markers_dir(&self) -> PathBuf {
        self.root.join(MARKERS_DIR)
    }

    /// Gets the batch script directory.
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(SCRIPTS_DIR)
    }

    /// Gets the batch script path of a job.
    pub fn script_path(&self, job_id: usize) -> PathBuf {
        self.scripts_dir()
            .join(format!("{task_id}_{job_id}.sh", task_id = self.task_id))
    }

    /// Gets the path of the submission script enumerating every job of the
    /// attempt.
    pub fn submit_script(&self) -> PathBuf {
        self.root
            .join(format!("{task_id}_submit.sh", task_id = self.task_id))
    }

    /// Gets the name of the task.
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Creates the attempt directories.
    pub fn ensure(&self) -> Result<()> {
        create_dir(&self.configs_dir())?;
        create_dir(&self.markers_dir())?;
        create_dir(&self.scripts_dir())
    }
}
