//! Error types of the execution engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::blocking::InvalidRegionError;

/// Represents a rejected job submission.
///
/// A rejected submission never produced a live job, so it is not retried as a
/// block failure.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The scheduler command could not be spawned.
    #[error("failed to spawn scheduler command `{command}` for job {job_id}")]
    Spawn {
        /// The job being submitted.
        job_id: usize,
        /// The scheduler command.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The scheduler rejected the job.
    #[error("scheduler command `{command}` rejected job {job_id} ({status}): {stderr}")]
    Rejected {
        /// The job being submitted.
        job_id: usize,
        /// The scheduler command.
        command: String,
        /// The exit status of the scheduler command.
        status: std::process::ExitStatus,
        /// The standard error of the scheduler command.
        stderr: String,
    },
    /// The job could not be prepared for submission.
    #[error("failed to prepare job {job_id} for submission")]
    Prepare {
        /// The job being submitted.
        job_id: usize,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

/// Represents why a submitted job is considered failed.
///
/// Job failures are never raised across the driver/worker boundary; they are
/// inferred from missing success markers once waiting has finished.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// The job ran and exited without writing its success marker.
    #[error("job {job_id} exited without a success marker")]
    BlockProcessing {
        /// The failed job.
        job_id: usize,
    },
    /// The job did not produce a success marker before the wait timed out.
    #[error("job {job_id} did not produce a success marker within {timeout:?}")]
    PollTimeout {
        /// The failed job.
        job_id: usize,
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

impl JobFailure {
    /// Gets the identifier of the failed job.
    pub fn job_id(&self) -> usize {
        match self {
            Self::BlockProcessing { job_id } | Self::PollTimeout { job_id, .. } => *job_id,
        }
    }
}

/// Represents a task that failed permanently after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "task `{task_id}` failed after {attempts} attempt(s); {count} block(s) failed permanently: \
     {failed_blocks:?}",
    count = .failed_blocks.len()
)]
pub struct RetryExhausted {
    /// The identifier of the failed task.
    pub task_id: String,
    /// The total number of attempts made.
    pub attempts: u32,
    /// The blocks whose output is not guaranteed to be correct.
    pub failed_blocks: Vec<usize>,
}

/// Represents an error from running a task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The volume or region of interest is malformed.
    #[error(transparent)]
    InvalidRegion(#[from] InvalidRegionError),
    /// A job configuration could not be persisted.
    #[error("failed to write job configuration `{path}`", path = .path.display())]
    ConfigWrite {
        /// The configuration path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A job was rejected by the backend.
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    /// The task failed permanently.
    #[error(transparent)]
    RetryExhausted(#[from] RetryExhausted),
    /// The artifact the task depends on does not exist.
    #[error("dependency artifact `{path}` does not exist", path = .0.display())]
    DependencyMissing(PathBuf),
    /// Any other error (e.g. creating directories, task-specific cleanup).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A result type for running tasks.
pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_exhausted_message() {
        let e = RetryExhausted {
            task_id: "write_relabel".to_string(),
            attempts: 3,
            failed_blocks: vec![4, 5],
        };
        assert_eq!(
            e.to_string(),
            "task `write_relabel` failed after 3 attempt(s); 2 block(s) failed permanently: [4, \
             5]"
        );
    }

    #[test]
    fn job_failure_id() {
        assert_eq!(JobFailure::BlockProcessing { job_id: 2 }.job_id(), 2);
        assert_eq!(
            JobFailure::PollTimeout {
                job_id: 5,
                timeout: Duration::from_secs(1)
            }
            .job_id(),
            5
        );
    }
}
