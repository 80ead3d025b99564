//! Implementation of the local backend.
//!
//! Jobs are executed in-process on blocking threads, with the number of
//! concurrently executing jobs bounded by the configured number of slots.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::BackendKind;
use super::JobBackend;
use super::JobHandle;
use super::JobSubmission;
use crate::SYSTEM;
use crate::config::LocalBackendConfig;
use crate::error::SubmissionError;
use crate::registry::TaskRegistry;
use crate::worker;

/// Represents the local job execution backend.
pub struct LocalBackend {
    /// The number of jobs that may execute concurrently.
    slots: usize,
    /// The semaphore bounding concurrent jobs.
    semaphore: Arc<Semaphore>,
    /// The registry used to resolve the task of each job.
    registry: Arc<TaskRegistry>,
}

impl LocalBackend {
    /// Constructs a new local backend with the given configuration.
    pub fn new(config: &LocalBackendConfig, registry: Arc<TaskRegistry>) -> Result<Self> {
        config.validate()?;

        let slots = match config.slots {
            Some(slots) => slots,
            None => SYSTEM.cpus().len().max(1),
        };

        info!("local backend configured with {slots} job slot(s)");

        Ok(Self {
            slots,
            semaphore: Arc::new(Semaphore::new(slots)),
            registry,
        })
    }

    /// Gets the number of jobs that may execute concurrently.
    pub fn slots(&self) -> usize {
        self.slots
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// Records the outcome of a local job in its log files.
///
/// Failing to record the outcome does not affect the job's success; only its
/// marker does.
fn record_outcome(job: &JobSubmission, result: &Result<()>) {
    let (path, contents) = match result {
        Ok(()) => (
            &job.log_path,
            format!("job {id} finished successfully\n", id = job.job_id),
        ),
        Err(e) => (&job.error_path, format!("{e:?}\n")),
    };

    if let Err(e) = write_log(path, &contents) {
        warn!(
            "failed to write log `{path}` of job {id}: {e:#}",
            path = path.display(),
            id = job.job_id
        );
    }
}

/// Writes a job log file.
fn write_log(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    fs::write(path, contents)
}

#[async_trait]
impl JobBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn describe(&self) -> String {
        format!(
            "local ({slots} slot{s})",
            slots = self.slots,
            s = if self.slots == 1 { "" } else { "s" }
        )
    }

    fn attests_liveness(&self) -> bool {
        true
    }

    async fn submit(&self, job: &JobSubmission) -> Result<JobHandle, SubmissionError> {
        let semaphore = self.semaphore.clone();
        let registry = self.registry.clone();
        let submission = job.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            let id = submission.job_id;
            debug!("executing local job {id}");

            let config_path = submission.config_path.clone();
            let result = match tokio::task::spawn_blocking(move || {
                worker::run_job(&config_path, &registry).map(|_| ())
            })
            .await
            {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("job {id} panicked: {e}")),
            };

            match &result {
                Ok(()) => debug!("local job {id} finished"),
                Err(e) => error!("local job {id} failed: {e:#}"),
            }

            record_outcome(&submission, &result);
        });

        Ok(JobHandle::local(job.job_id, job.marker_path.clone(), handle))
    }

    fn is_alive(&self, handle: &JobHandle) -> bool {
        handle.is_finished().map(|finished| !finished).unwrap_or(false)
    }
}

impl LocalBackendConfig {
    /// Validates the local backend configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(slots) = self.slots {
            if slots == 0 {
                bail!("local backend configuration value `slots` cannot be zero");
            }

            let total = SYSTEM.cpus().len();
            if slots > total {
                warn!(
                    "local backend configuration value `slots` ({slots}) exceeds the number of \
                     host CPUs ({total})"
                );
            }
        }

        Ok(())
    }
}
