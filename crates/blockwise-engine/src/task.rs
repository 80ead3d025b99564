//! Implementation of the cluster task lifecycle.
//!
//! A [`ClusterTask`] drives one instance of a task through its attempts:
//!
//! ```text
//! Pending → Configured → Submitted → Waiting → Done
//!               ↑                        │
//!               └─────── Retrying ←──────┤
//!                                        └→ Failed
//! ```
//!
//! Each attempt plans its blocks, partitions them into jobs, writes one
//! configuration per job, submits the jobs, waits for them to settle, and
//! checks their success markers. Blocks of failed jobs are retried until the
//! retry budget is exhausted.

use std::fmt;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::anyhow;
use bon::Builder;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::JobBackend;
use crate::backend::JobHandle;
use crate::backend::JobResources;
use crate::backend::JobSubmission;
use crate::blocking::Blocking;
use crate::config::Config;
use crate::error::TaskError;
use crate::error::TaskResult;
use crate::job::JobConfig;
use crate::job::TaskParams;
use crate::layout::AttemptLayout;
use crate::layout::TaskLayout;
use crate::marker::MarkerStore;
use crate::monitor::CompletionMonitor;
use crate::monitor::JobOutcome;
use crate::monitor::JobOutcomes;
use crate::monitor::WaitSummary;
use crate::partition::JobGroup;
use crate::partition::partition_blocks;
use crate::registry::BlockTask;
use crate::registry::TaskRegistry;
use crate::retry::RetryController;
use crate::retry::RunState;

/// Represents the state of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Nothing has been written yet.
    Pending,
    /// The job configurations of the current attempt were written.
    Configured,
    /// The jobs of the current attempt were submitted.
    Submitted,
    /// The driver is waiting for the jobs of the current attempt.
    Waiting,
    /// Some jobs failed and their blocks will be retried.
    Retrying,
    /// Every block was processed.
    Done,
    /// The task failed permanently.
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Configured => "configured",
            Self::Submitted => "submitted",
            Self::Waiting => "waiting",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Represents the description of a task instance.
#[derive(Debug, Clone, Builder)]
pub struct TaskSpec {
    /// The name of the task in the registry.
    #[builder(into)]
    pub name: String,
    /// The identifier distinguishing instances of the same task.
    #[builder(into)]
    pub identifier: Option<String>,
    /// The shape of the volume to process.
    #[builder(into)]
    pub shape: Vec<u64>,
    /// The dataset and task-specific parameters.
    pub params: TaskParams,
    /// The artifact that must exist before the task may run.
    ///
    /// This is typically the completion log of an upstream task.
    #[builder(into)]
    pub dependency: Option<PathBuf>,
}

/// Represents the report of a finished task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    /// The identifier of the task instance.
    pub task_id: String,
    /// The number of attempts made.
    pub attempts: u32,
    /// The number of blocks of the task.
    pub blocks: usize,
    /// Whether the task was already complete and nothing was run.
    pub skipped: bool,
    /// The path of the completion log.
    pub completion_log: PathBuf,
}

/// Represents one instance of a block-wise task executed as jobs on a
/// backend.
pub struct ClusterTask {
    /// The description of the task instance.
    spec: TaskSpec,
    /// The engine configuration.
    config: Arc<Config>,
    /// The backend jobs are submitted to.
    backend: Arc<dyn JobBackend>,
    /// The block-processing logic of the task.
    task: Arc<dyn BlockTask>,
    /// The filesystem layout of the task instance.
    layout: TaskLayout,
    /// The blocking of the volume.
    blocking: Blocking,
    /// The resources requested for each job.
    resources: JobResources,
    /// The completion monitor.
    monitor: CompletionMonitor,
    /// The retry policy.
    retry: RetryController,
    /// The state of the current run.
    run: RunState,
    /// The state of the task instance.
    state: TaskState,
    /// The blocks of the current attempt.
    pending: Vec<usize>,
    /// The job of the current attempt carrying the leader flag.
    leader_job: Option<usize>,
    /// The lines of the completion log.
    log: Vec<String>,
}

impl ClusterTask {
    /// Constructs a new task instance.
    ///
    /// Fails if the configuration is invalid, if the volume, block shape, or
    /// region of interest is malformed, or if the task is not registered for
    /// the backend.
    pub fn new(
        spec: TaskSpec,
        config: Arc<Config>,
        backend: Arc<dyn JobBackend>,
        registry: &TaskRegistry,
    ) -> TaskResult<Self> {
        config.validate().context("invalid configuration")?;
        let blocking = Blocking::new(&spec.shape, &config.block_shape, config.roi())?;
        let task = registry
            .create(&spec.name, backend.kind())
            .map_err(anyhow::Error::from)?;
        let resources = config.resources(&spec.name)?;
        let layout = TaskLayout::new(
            config.tmp_folder.clone(),
            spec.name.clone(),
            spec.identifier.clone(),
        );
        let monitor =
            CompletionMonitor::new(config.monitor.poll_interval(), config.monitor.timeout());
        let retry = RetryController::new(config.max_retries);
        let run = RunState::starting_at(layout.task_id(), next_attempt(&layout)?);
        let pending = blocking.block_ids();

        Ok(Self {
            spec,
            config,
            backend,
            task,
            layout,
            blocking,
            resources,
            monitor,
            retry,
            run,
            state: TaskState::Pending,
            pending,
            leader_job: None,
            log: Vec::new(),
        })
    }

    /// Gets the identifier of the task instance.
    pub fn task_id(&self) -> String {
        self.layout.task_id()
    }

    /// Gets the state of the task instance.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Gets the current attempt.
    pub fn attempt(&self) -> u32 {
        self.run.attempt()
    }

    /// Gets the state of the current run.
    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    /// Gets the filesystem layout of the task instance.
    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    /// Gets the blocking of the volume.
    pub fn blocking(&self) -> &Blocking {
        &self.blocking
    }

    /// Determines if the task instance has already completed.
    pub fn is_complete(&self) -> bool {
        self.layout.completion_log().is_file()
    }

    /// Determines if the artifact the task depends on exists.
    pub fn is_runnable(&self) -> bool {
        self.spec
            .dependency
            .as_ref()
            .is_none_or(|path| path.exists())
    }

    /// Gets the blocks of the current attempt.
    ///
    /// This is every block of the blocking on the first attempt and the
    /// blocks of the failed jobs on later attempts.
    pub fn plan(&self) -> &[usize] {
        &self.pending
    }

    /// Partitions the blocks of the current attempt into jobs.
    pub fn partition(&self) -> Vec<JobGroup> {
        partition_blocks(&self.pending, self.config.max_jobs)
    }

    /// Gets the layout of the current attempt.
    fn current_attempt(&self) -> AttemptLayout {
        self.layout.attempt(self.run.attempt())
    }

    /// Gets the success markers of the current attempt.
    pub fn markers(&self) -> MarkerStore {
        MarkerStore::new(self.current_attempt().markers_dir(), &self.spec.name)
    }

    /// Transitions to a new state.
    fn transition(&mut self, state: TaskState) {
        debug!(
            "task `{id}` transitioned from {from} to {state}",
            id = self.run.task_id(),
            from = self.state
        );
        self.state = state;
    }

    /// Appends a line to the completion log.
    fn record(&mut self, message: String) {
        self.log
            .push(format!("{time}: {message}", time = Utc::now().to_rfc3339()));
    }

    /// Builds the configuration of a job of the current attempt.
    fn job_config(&self, attempt: &AttemptLayout, job: &JobGroup, leader: bool) -> JobConfig {
        let params = &self.spec.params;
        let (output_path, output_key) = if params.in_place() {
            (None, None)
        } else {
            (params.output_path.clone(), params.output_key.clone())
        };

        let roi = self.blocking.roi();
        let has_roi = self.config.roi().is_some();

        JobConfig {
            task_name: self.spec.name.clone(),
            task_identifier: self.layout.task_id(),
            backend: self.backend.kind(),
            job_id: job.job_id,
            attempt: attempt.attempt(),
            leader,
            marker_dir: attempt.markers_dir(),
            input_path: params.input_path.clone(),
            input_key: params.input_key.clone(),
            output_path,
            output_key,
            shape: self.spec.shape.clone(),
            block_shape: self.blocking.block_shape().to_vec(),
            roi_begin: has_roi.then(|| roi.begin.clone()),
            roi_end: has_roi.then(|| roi.end.clone()),
            block_list: job.block_ids.clone(),
            n_threads: self.resources.threads,
            params: params.extra.clone(),
        }
    }

    /// Writes one configuration per job of the current attempt.
    ///
    /// The first job is the leader until a leader has succeeded in this run.
    ///
    /// Returns the configuration paths in job order.
    pub fn configure(&mut self, jobs: &[JobGroup]) -> TaskResult<Vec<PathBuf>> {
        let attempt = self.current_attempt();
        attempt.ensure()?;

        self.leader_job = None;
        let mut paths = Vec::with_capacity(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            let leader = index == 0 && !self.run.leader_done();
            if leader {
                self.leader_job = Some(job.job_id);
            }

            let path = attempt.config_path(job.job_id);
            self.job_config(&attempt, job, leader).write(&path)?;
            paths.push(path);
        }

        debug!(
            "wrote {n} job configuration(s) for attempt {attempt} of task `{id}`",
            n = paths.len(),
            attempt = attempt.attempt(),
            id = self.run.task_id()
        );
        self.transition(TaskState::Configured);
        Ok(paths)
    }

    /// Submits the jobs of the current attempt.
    ///
    /// The jobs must have been configured.
    pub async fn submit(&mut self, jobs: &[JobGroup]) -> TaskResult<Vec<JobHandle>> {
        let attempt = self.current_attempt();
        let markers = self.markers();
        self.backend.begin_attempt(&attempt).await?;

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let submission = JobSubmission {
                job_id: job.job_id,
                name: format!("{id}_{job}", id = attempt.task_id(), job = job.job_id),
                config_path: attempt.config_path(job.job_id),
                marker_path: markers.path(job.job_id),
                log_path: self.layout.log_file(job.job_id),
                error_path: self.layout.error_file(job.job_id),
                script_path: attempt.script_path(job.job_id),
                submit_script: attempt.submit_script(),
                resources: self.resources.clone(),
            };

            // Logs of an earlier attempt of the same job id are stale
            remove_stale_log(&submission.log_path)?;
            remove_stale_log(&submission.error_path)?;

            match self.backend.submit(&submission).await {
                Ok(handle) => {
                    self.run.record_submitted(job.job_id);
                    handles.push(handle);
                }
                Err(e) => {
                    self.transition(TaskState::Failed);
                    return Err(e.into());
                }
            }
        }

        info!(
            "submitted {n} job(s) of task `{id}` to the {backend}",
            n = handles.len(),
            id = self.run.task_id(),
            backend = self.backend.describe()
        );
        self.transition(TaskState::Submitted);
        Ok(handles)
    }

    /// Waits for the submitted jobs of the current attempt to settle.
    pub async fn wait(&mut self, handles: &[JobHandle]) -> WaitSummary {
        self.transition(TaskState::Waiting);
        let markers = self.markers();
        self.monitor
            .wait_for_jobs(self.backend.as_ref(), handles, &markers)
            .await
    }

    /// Checks the outcome of each job of the current attempt.
    pub fn check(&mut self, jobs: &[JobGroup], summary: &WaitSummary) -> JobOutcomes {
        let ids: Vec<_> = jobs.iter().map(|job| job.job_id).collect();
        let outcomes = self.monitor.check_jobs(&ids, summary, &self.markers());
        for id in outcomes.succeeded() {
            self.run.record_succeeded(id);
        }

        if let Some(leader) = self.leader_job
            && outcomes.get(leader) == Some(&JobOutcome::Succeeded)
        {
            self.run.mark_leader_done();
        }

        outcomes
    }

    /// Removes the partial output of blocks before they are retried.
    fn clean_up(&self, blocks: &[usize]) -> TaskResult<()> {
        for id in blocks {
            if let Some(block) = self.blocking.block(*id) {
                self.task
                    .clean_up_block(&self.spec.params, &block)
                    .with_context(|| format!("failed to clean up block {id}"))?;
            }
        }

        Ok(())
    }

    /// Writes the completion log, marking the task instance as done.
    fn write_completion_log(&self) -> TaskResult<PathBuf> {
        let path = self.layout.completion_log();
        let dir = self.layout.tmp_folder();
        let mut file = tempfile::NamedTempFile::new_in(dir).with_context(|| {
            format!(
                "failed to create temporary file in `{dir}`",
                dir = dir.display()
            )
        })?;

        for line in &self.log {
            writeln!(file, "{line}").context("failed to write the completion log")?;
        }

        file.as_file()
            .sync_all()
            .context("failed to write the completion log")?;
        file.persist(&path).with_context(|| {
            format!(
                "failed to persist completion log `{path}`",
                path = path.display()
            )
        })?;
        Ok(path)
    }

    /// Runs the task instance to completion.
    ///
    /// A task instance whose completion log exists is not run again.
    pub async fn run(&mut self) -> TaskResult<TaskReport> {
        let task_id = self.task_id();
        if self.is_complete() {
            info!("task `{task_id}` is already complete");
            self.transition(TaskState::Done);
            return Ok(TaskReport {
                task_id,
                attempts: 0,
                blocks: self.blocking.num_blocks(),
                skipped: true,
                completion_log: self.layout.completion_log(),
            });
        }

        if let Some(dependency) = &self.spec.dependency
            && !dependency.exists()
        {
            return Err(TaskError::DependencyMissing(dependency.clone()));
        }

        // Every run uses attempt directories no earlier run has used
        self.run = RunState::starting_at(task_id.clone(), next_attempt(&self.layout)?);
        self.pending = self.blocking.block_ids();

        self.layout.ensure()?;
        self.task
            .prepare(&self.spec.params, &self.blocking)
            .with_context(|| format!("failed to prepare task `{task_id}`"))?;

        info!(
            "running task `{task_id}` over {n} block(s) on the {backend}",
            n = self.blocking.num_blocks(),
            backend = self.backend.describe()
        );

        while !self.pending.is_empty() {
            let jobs = self.partition();
            if jobs.is_empty() {
                self.transition(TaskState::Failed);
                return Err(anyhow!(
                    "no jobs were planned for {n} block(s) of task `{task_id}`",
                    n = self.pending.len()
                )
                .into());
            }

            self.record(format!(
                "attempt {attempt}: scheduling {n} block(s) in {j} job(s)",
                attempt = self.run.attempt(),
                n = self.pending.len(),
                j = jobs.len()
            ));

            self.configure(&jobs)?;
            let handles = self.submit(&jobs).await?;
            let summary = self.wait(&handles).await;
            let outcomes = self.check(&jobs, &summary);

            if outcomes.all_succeeded() {
                self.record(format!(
                    "attempt {attempt}: all {n} job(s) succeeded",
                    attempt = self.run.attempt(),
                    n = outcomes.len()
                ));
                break;
            }

            for failure in outcomes.failures() {
                warn!("task `{task_id}`: {failure}");
            }

            let failed = outcomes.failed();
            self.record(format!(
                "attempt {attempt}: {n} job(s) failed: {failed:?}",
                attempt = self.run.attempt(),
                n = failed.len()
            ));

            self.transition(TaskState::Retrying);
            match self.retry.advance(&mut self.run, &failed, &jobs) {
                Ok(blocks) => {
                    self.clean_up(&blocks)?;
                    self.pending = blocks;
                }
                Err(e) => {
                    error!("{e}");
                    self.transition(TaskState::Failed);
                    return Err(e.into());
                }
            }
        }

        self.pending.clear();
        self.record("task finished".to_string());
        let completion_log = self.write_completion_log()?;
        self.transition(TaskState::Done);

        info!(
            "task `{task_id}` finished after {n} attempt(s)",
            n = self.run.attempts_made()
        );
        Ok(TaskReport {
            task_id,
            attempts: self.run.attempts_made(),
            blocks: self.blocking.num_blocks(),
            skipped: false,
            completion_log,
        })
    }
}

/// Gets the first attempt not used by any earlier run of a task instance.
fn next_attempt(layout: &TaskLayout) -> TaskResult<u32> {
    Ok(layout.attempts()?.last().map_or(1, |last| last + 1))
}

/// Removes a job log left behind by an earlier attempt.
fn remove_stale_log(path: &Path) -> TaskResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!(
                "failed to remove stale log `{path}`",
                path = path.display()
            ))
            .into()),
    }
}

impl fmt::Debug for ClusterTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterTask")
            .field("spec", &self.spec)
            .field("backend", &self.backend.describe())
            .field("state", &self.state)
            .field("attempt", &self.run.attempt())
            .finish_non_exhaustive()
    }
}
