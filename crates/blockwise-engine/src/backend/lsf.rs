//! Implementation of the LSF backend.
//!
//! Each job is written as a batch script and submitted with `bsub`, with the
//! job's resources passed as `bsub` options. Submission is asynchronous; the
//! job's outcome is observed through its success marker.

use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::BackendKind;
use super::JobBackend;
use super::JobHandle;
use super::JobSubmission;
use super::WorkerCommand;
use crate::config::LsfBackendConfig;
use crate::error::SubmissionError;
use crate::layout::AttemptLayout;

/// Matches the job id in the output of `bsub`.
static BSUB_JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <(\d+)> is submitted").expect("pattern should be valid"));

/// Represents the LSF job execution backend.
#[derive(Debug)]
pub struct LsfBackend {
    /// The backend configuration.
    config: LsfBackendConfig,
    /// The command used to invoke a worker.
    worker: WorkerCommand,
}

impl LsfBackend {
    /// Constructs a new LSF backend.
    pub fn new(config: LsfBackendConfig, worker: WorkerCommand) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, worker })
    }

    /// Renders the batch script of a job.
    pub fn render_script(&self, job: &JobSubmission) -> Result<String> {
        Ok(format!(
            "#!/bin/bash\n{command}\n",
            command = self.worker.render(&job.config_path)?
        ))
    }

    /// Gets the arguments passed to `bsub` to submit a job.
    pub fn submission_args(&self, job: &JobSubmission) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            job.name.clone(),
            "-We".to_string(),
            job.resources.time_limit_minutes.to_string(),
            "-oo".to_string(),
            job.log_path.to_string_lossy().into_owned(),
            "-eo".to_string(),
            job.error_path.to_string_lossy().into_owned(),
            "-n".to_string(),
            job.resources.threads.to_string(),
        ];

        if let Some(queue) = &self.config.queue {
            args.push("-q".to_string());
            args.push(queue.clone());
        }

        // Memory is requested per job in kibibytes
        if let Some(memory) = job.resources.memory {
            args.push("-R".to_string());
            args.push(format!(
                "rusage[mem={kb}KB/job]",
                kb = memory.as_u64().div_ceil(bytesize::KIB)
            ));
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push(job.script_path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl JobBackend for LsfBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lsf
    }

    fn describe(&self) -> String {
        match &self.config.queue {
            Some(queue) => format!("LSF (queue `{queue}`)"),
            None => "LSF (default queue)".to_string(),
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
            &self.config.bsub,
            &self.submission_args(job),
            &BSUB_JOB_ID,
        )
        .await
    }

    fn is_alive(&self, handle: &JobHandle) -> bool {
        !handle.marker_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::tests::submission;

    fn backend(bsub: &str, queue: Option<&str>) -> LsfBackend {
        LsfBackend::new(
            LsfBackendConfig {
                queue: queue.map(str::to_string),
                bsub: bsub.to_string(),
                extra_args: Vec::new(),
            },
            WorkerCommand {
                program: PathBuf::from("/opt/bin/blockwise"),
                args: vec!["worker".to_string()],
            },
        )
        .unwrap()
    }

    #[test]
    fn script() {
        let job = submission(Path::new("/tmp/w"), 0);
        assert_eq!(
            backend("bsub", None).render_script(&job).unwrap(),
            "#!/bin/bash\n/opt/bin/blockwise worker /tmp/w/configs/write_relabel_job_0.config\n"
        );
    }

    #[test]
    fn args() {
        let job = submission(Path::new("/tmp/w"), 2);
        assert_eq!(
            backend("bsub", Some("normal")).submission_args(&job),
            vec![
                "-J",
                "write_relabel_2",
                "-We",
                "90",
                "-oo",
                "/tmp/w/logs/write_relabel_2.log",
                "-eo",
                "/tmp/w/error_logs/write_relabel_2.err",
                "-n",
                "4",
                "-q",
                "normal",
                "-R",
                "rusage[mem=2097152KB/job]",
                "/tmp/w/scripts/write_relabel_2.sh",
            ]
        );
    }

    #[test]
    fn job_id_pattern() {
        let captures = BSUB_JOB_ID
            .captures("Job <81234> is submitted to queue <normal>.\n")
            .unwrap();
        assert_eq!(&captures[1], "81234");
        assert_eq!(backend("bsub", None).describe(), "LSF (default queue)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn submission_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let job = submission(dir.path(), 1);

        match backend("false", None).submit(&job).await.unwrap_err() {
            SubmissionError::Rejected { job_id, status, .. } => {
                assert_eq!(job_id, 1);
                assert!(!status.success());
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn submission_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let job = submission(dir.path(), 0);

        let e = backend("blockwise-missing-bsub", None)
            .submit(&job)
            .await
            .unwrap_err();
        assert!(matches!(e, SubmissionError::Spawn { job_id: 0, .. }));
    }
}
