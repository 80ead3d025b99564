//! Implementation of the Slurm backend.
//!
//! Each job is written as a batch script carrying `#SBATCH` directives and
//! submitted with `sbatch`. Submission returns as soon as Slurm has queued the
//! job; the job's outcome is observed through its success marker.

use std::fmt::Write as _;
use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::BackendKind;
use super::JobBackend;
use super::JobHandle;
use super::JobSubmission;
use super::WorkerCommand;
use crate::config::SlurmBackendConfig;
use crate::error::SubmissionError;
use crate::layout::AttemptLayout;

/// Matches the job id in the output of `sbatch`.
static SBATCH_JOB_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted batch job (\d+)").expect("pattern should be valid")
});

/// Represents the Slurm job execution backend.
#[derive(Debug)]
pub struct SlurmBackend {
    /// The backend configuration.
    config: SlurmBackendConfig,
    /// The command used to invoke a worker.
    worker: WorkerCommand,
}

impl SlurmBackend {
    /// Constructs a new Slurm backend.
    pub fn new(config: SlurmBackendConfig, worker: WorkerCommand) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, worker })
    }

    /// Renders the batch script of a job.
    pub fn render_script(&self, job: &JobSubmission) -> Result<String> {
        let mut script = String::from("#!/bin/bash\n");
        writeln!(script, "#SBATCH --job-name={name}", name = job.name)?;
        writeln!(script, "#SBATCH --output={path}", path = job.log_path.display())?;
        writeln!(script, "#SBATCH --error={path}", path = job.error_path.display())?;
        writeln!(
            script,
            "#SBATCH --time={minutes}",
            minutes = job.resources.time_limit_minutes
        )?;
        // An explicit task count is required for `--cpus-per-task`
        writeln!(script, "#SBATCH --ntasks=1")?;
        writeln!(
            script,
            "#SBATCH --cpus-per-task={threads}",
            threads = job.resources.threads
        )?;

        // Memory is specified per node in mebibytes, rounded up
        if let Some(memory) = job.resources.memory {
            writeln!(
                script,
                "#SBATCH --mem={mib}M",
                mib = memory.as_u64().div_ceil(bytesize::MIB)
            )?;
        }

        if let Some(partition) = &self.config.partition {
            writeln!(script, "#SBATCH --partition={partition}")?;
        }

        writeln!(script)?;
        writeln!(script, "{}", self.worker.render(&job.config_path)?)?;
        Ok(script)
    }

    /// Gets the arguments passed to `sbatch` to submit a job.
    pub fn submission_args(&self, job: &JobSubmission) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.push(job.script_path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl JobBackend for SlurmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn describe(&self) -> String {
        match &self.config.partition {
            Some(partition) => format!("Slurm (partition `{partition}`)"),
            None => "Slurm (default partition)".to_string(),
        }
    }

    fn attests_liveness(&self) -> bool {
        false
    }

    async fn begin_attempt(&self, attempt: &AttemptLayout) -> Result<()> {
        super::begin_submit_script(attempt)
    }

    async fn submit(&self, job: &JobSubmission) -> Result<JobHandle, SubmissionError> {
        let script = self
            .render_script(job)
            .map_err(|source| SubmissionError::Prepare {
                job_id: job.job_id,
                source,
            })?;

        super::submit_to_scheduler(
            job,
            &script,
            &self.config.sbatch,
            &self.submission_args(job),
            &SBATCH_JOB_ID,
        )
        .await
    }

    fn is_alive(&self, handle: &JobHandle) -> bool {
        !handle.marker_path().is_file()
    }
}
