//! Implementation of job execution backends.
//!
//! A backend turns a job (a configuration file owning a group of blocks) into
//! an executing unit: either an in-process call on a bounded pool
//! ([`LocalBackend`]) or a batch script submitted to an external scheduler
//! ([`SlurmBackend`], [`LsfBackend`]).
//!
//! Whatever the backend, a job's success marker is the only proof that it
//! succeeded.

use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytesize::ByteSize;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;

use crate::error::SubmissionError;
use crate::layout::AttemptLayout;

pub mod local;
pub mod lsf;
pub mod slurm;

pub use local::LocalBackend;
pub use lsf::LsfBackend;
pub use slurm::SlurmBackend;

/// Represents the kind of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Jobs run in-process on a bounded pool.
    Local,
    /// Jobs are submitted to a Slurm cluster.
    Slurm,
    /// Jobs are submitted to an LSF cluster.
    Lsf,
}

impl BackendKind {
    /// Every backend kind.
    pub const ALL: [BackendKind; 3] = [Self::Local, Self::Slurm, Self::Lsf];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Slurm => write!(f, "Slurm"),
            Self::Lsf => write!(f, "LSF"),
        }
    }
}

/// Represents the resources requested for each job of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResources {
    /// The number of threads a job may use.
    pub threads: usize,
    /// The estimated wall-clock time of a job, in minutes.
    pub time_limit_minutes: u64,
    /// The memory limit of a job, if any.
    pub memory: Option<ByteSize>,
}

/// Represents the command used to invoke a worker.
///
/// The job's configuration path is appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// The worker executable.
    pub program: PathBuf,
    /// The arguments preceding the configuration path.
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Renders the shell invocation of the worker for a configuration path.
    pub fn render(&self, config_path: &Path) -> Result<String> {
        let program = self.program.to_string_lossy();
        let config_path = config_path.to_string_lossy();
        let words = std::iter::once(program.as_ref())
            .chain(self.args.iter().map(String::as_str))
            .chain(std::iter::once(config_path.as_ref()));
        shlex::try_join(words).context("worker command contains a nul byte")
    }
}

/// Represents a job to submit.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    /// The identifier of the job within its attempt.
    pub job_id: usize,
    /// The name of the job (`<task_id>_<job_id>`).
    pub name: String,
    /// The path to the job's configuration.
    pub config_path: PathBuf,
    /// The path of the job's success marker.
    pub marker_path: PathBuf,
    /// The path the job's standard output is written to.
    pub log_path: PathBuf,
    /// The path the job's standard error is written to.
    pub error_path: PathBuf,
    /// The path of the job's batch script (cluster backends only).
    pub script_path: PathBuf,
    /// The path of the attempt's submission script (cluster backends only).
    pub submit_script: PathBuf,
    /// The resources requested for the job.
    pub resources: JobResources,
}

/// Represents the backend-specific state of a submitted job.
#[derive(Debug)]
enum HandleState {
    /// The job runs in-process.
    Local(JoinHandle<()>),
    /// The job was submitted to an external scheduler.
    Scheduled {
        /// The identifier the scheduler assigned to the job, if it was
        /// reported.
        scheduler_id: Option<String>,
    },
}

/// Represents a handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    /// The identifier of the job within its attempt.
    job_id: usize,
    /// The path of the job's success marker.
    marker_path: PathBuf,
    /// The backend-specific state.
    state: HandleState,
}

impl JobHandle {
    /// Constructs a handle for a job running in-process.
    pub(crate) fn local(job_id: usize, marker_path: PathBuf, handle: JoinHandle<()>) -> Self {
        Self {
            job_id,
            marker_path,
            state: HandleState::Local(handle),
        }
    }

    /// Constructs a handle for a job submitted to a scheduler.
    pub(crate) fn scheduled(
        job_id: usize,
        marker_path: PathBuf,
        scheduler_id: Option<String>,
    ) -> Self {
        Self {
            job_id,
            marker_path,
            state: HandleState::Scheduled { scheduler_id },
        }
    }

    /// Gets the identifier of the job.
    pub fn job_id(&self) -> usize {
        self.job_id
    }

    /// Gets the path of the job's success marker.
    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Gets the identifier the scheduler assigned to the job.
    ///
    /// Returns `None` for in-process jobs or if the scheduler did not report
    /// one.
    pub fn scheduler_id(&self) -> Option<&str> {
        match &self.state {
            HandleState::Local(_) => None,
            HandleState::Scheduled { scheduler_id } => scheduler_id.as_deref(),
        }
    }

    /// Determines if an in-process job has finished.
    ///
    /// Returns `None` for jobs submitted to a scheduler.
    pub(crate) fn is_finished(&self) -> Option<bool> {
        match &self.state {
            HandleState::Local(handle) => Some(handle.is_finished()),
            HandleState::Scheduled { .. } => None,
        }
    }
}

/// Represents a job execution backend.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Gets the kind of the backend.
    fn kind(&self) -> BackendKind;

    /// Gets a description of the backend for diagnostics.
    fn describe(&self) -> String;

    /// Determines if the backend can tell whether a job is still running.
    ///
    /// Backends that cannot are waited on with a bounded timeout.
    fn attests_liveness(&self) -> bool;

    /// Prepares the backend for a new execution attempt.
    async fn begin_attempt(&self, _attempt: &AttemptLayout) -> Result<()> {
        Ok(())
    }

    /// Submits a job.
    ///
    /// The job's configuration must already be fully written.
    async fn submit(&self, job: &JobSubmission) -> Result<JobHandle, SubmissionError>;

    /// Determines if a submitted job may still be running.
    fn is_alive(&self, handle: &JobHandle) -> bool;
}

/// Starts a fresh submission script for an attempt.
pub(crate) fn begin_submit_script(attempt: &AttemptLayout) -> Result<()> {
    let path = attempt.submit_script();
    fs::write(&path, "#!/bin/bash\n").with_context(|| {
        format!(
            "failed to write submission script `{path}`",
            path = path.display()
        )
    })?;
    set_executable(&path)
}

/// Appends a job's submission command to the attempt's submission script.
fn append_submit_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| {
            format!(
                "failed to open submission script `{path}`",
                path = path.display()
            )
        })?;
    writeln!(file, "{line}").with_context(|| {
        format!(
            "failed to append to submission script `{path}`",
            path = path.display()
        )
    })
}

/// Marks a script as executable.
fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(path, fs::Permissions::from_mode(0o770)).with_context(|| {
            format!(
                "failed to set permissions of `{path}`",
                path = path.display()
            )
        })?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

/// Submits a job's batch script to a scheduler.
///
/// The batch script is written and the submission command is recorded in the
/// attempt's submission script before the scheduler command is run.
///
/// The scheduler's job id is extracted from its standard output with
/// `id_pattern`, whose first capture group is the id.
pub(crate) async fn submit_to_scheduler(
    job: &JobSubmission,
    script: &str,
    program: &str,
    args: &[String],
    id_pattern: &Regex,
) -> Result<JobHandle, SubmissionError> {
    let prepare = |source: anyhow::Error| SubmissionError::Prepare {
        job_id: job.job_id,
        source,
    };

    if let Some(dir) = job.script_path.parent() {
        crate::layout::create_dir(dir).map_err(prepare)?;
    }

    fs::write(&job.script_path, script)
        .with_context(|| {
            format!(
                "failed to write batch script `{path}`",
                path = job.script_path.display()
            )
        })
        .map_err(prepare)?;
    set_executable(&job.script_path).map_err(prepare)?;

    let line = shlex::try_join(std::iter::once(program).chain(args.iter().map(String::as_str)))
        .context("submission command contains a nul byte")
        .map_err(prepare)?;
    append_submit_line(&job.submit_script, &line).map_err(prepare)?;

    debug!(job_id = job.job_id, command = %line, "submitting job");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(false)
        .output()
        .await
        .map_err(|source| SubmissionError::Spawn {
            job_id: job.job_id,
            command: line.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    trace!(job_id = job.job_id, stdout = %stdout, "scheduler output");

    if !output.status.success() {
        return Err(SubmissionError::Rejected {
            job_id: job.job_id,
            command: line,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let scheduler_id = id_pattern
        .captures(&stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    debug!(
        job_id = job.job_id,
        scheduler_id = scheduler_id.as_deref().unwrap_or("<unknown>"),
        "job submitted"
    );

    Ok(JobHandle::scheduled(
        job.job_id,
        job.marker_path.clone(),
        scheduler_id,
    ))
}
