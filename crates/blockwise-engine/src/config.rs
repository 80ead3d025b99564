//! Implementation of engine configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bytesize::ByteSize;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::backend::JobBackend;
use crate::backend::JobResources;
use crate::backend::LocalBackend;
use crate::backend::LsfBackend;
use crate::backend::SlurmBackend;
use crate::backend::WorkerCommand;
use crate::blocking::Roi;
use crate::registry::TaskRegistry;

/// The inclusive maximum number of retries the engine supports.
pub const MAX_RETRIES: u32 = 100;

/// The default temporary folder.
const DEFAULT_TMP_FOLDER: &str = "tmp";

/// The default maximum number of jobs per attempt.
const DEFAULT_MAX_JOBS: usize = 1;

/// The default block shape.
const DEFAULT_BLOCK_SHAPE: [u64; 3] = [50, 512, 512];

/// The default interval between completion polls, in seconds.
const DEFAULT_POLL_INTERVAL_SECS: f64 = 10.0;

/// The default overall timeout of a wait for cluster jobs, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// The default number of threads per job.
const DEFAULT_THREADS: usize = 1;

/// The default job time limit, in minutes.
const DEFAULT_TIME_LIMIT_MINUTES: u64 = 60;

/// The default worker subcommand.
const DEFAULT_WORKER_SUBCOMMAND: &str = "worker";

/// Represents the engine configuration.
///
/// A configuration is immutable once loaded; share it as an `Arc<Config>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The folder holding job configurations, markers, logs, and completion
    /// logs.
    #[serde(default = "default_tmp_folder")]
    pub tmp_folder: PathBuf,
    /// The maximum number of jobs per attempt.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// The number of retries after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// The block shape of the blocking.
    #[serde(default = "default_block_shape")]
    pub block_shape: Vec<u64>,
    /// The beginning of the region of interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_begin: Option<Vec<u64>>,
    /// The end of the region of interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_end: Option<Vec<u64>>,
    /// Completion monitoring configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Worker invocation configuration.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// The job execution backend.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Per-task resource configuration, keyed by task name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tasks: IndexMap<String, TaskResourceConfig>,
}

/// Gets the default temporary folder.
fn default_tmp_folder() -> PathBuf {
    PathBuf::from(DEFAULT_TMP_FOLDER)
}

/// Gets the default maximum number of jobs.
fn default_max_jobs() -> usize {
    DEFAULT_MAX_JOBS
}

/// Gets the default block shape.
fn default_block_shape() -> Vec<u64> {
    DEFAULT_BLOCK_SHAPE.to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmp_folder: default_tmp_folder(),
            max_jobs: default_max_jobs(),
            max_retries: 0,
            block_shape: default_block_shape(),
            roi_begin: None,
            roi_end: None,
            monitor: Default::default(),
            worker: Default::default(),
            backend: Default::default(),
            tasks: Default::default(),
        }
    }
}

impl Config {
    /// Validates the engine configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_jobs == 0 {
            bail!("configuration value `max_jobs` cannot be zero");
        }

        if self.max_retries > MAX_RETRIES {
            bail!("configuration value `max_retries` cannot exceed {MAX_RETRIES}");
        }

        if self.block_shape.is_empty() {
            bail!("configuration value `block_shape` cannot be empty");
        }

        if let Some(axis) = self.block_shape.iter().position(|e| *e == 0) {
            bail!("configuration value `block_shape` has a zero extent on axis {axis}");
        }

        match (&self.roi_begin, &self.roi_end) {
            (None, None) => {}
            (Some(begin), Some(end)) => {
                if begin.len() != self.block_shape.len() || end.len() != self.block_shape.len() {
                    bail!(
                        "configuration values `roi_begin` and `roi_end` must have {n} dimensions \
                         to match `block_shape`",
                        n = self.block_shape.len()
                    );
                }

                if let Some(axis) = begin.iter().zip(end).position(|(b, e)| b > e) {
                    bail!(
                        "configuration value `roi_begin` exceeds `roi_end` on axis {axis}"
                    );
                }
            }
            _ => bail!("configuration values `roi_begin` and `roi_end` must be given together"),
        }

        self.monitor.validate()?;
        self.worker.validate()?;
        self.backend.validate()?;

        for (name, task) in &self.tasks {
            task.validate(name)?;
        }

        Ok(())
    }

    /// Gets the configured region of interest, if there is one.
    pub fn roi(&self) -> Option<Roi> {
        match (&self.roi_begin, &self.roi_end) {
            (Some(begin), Some(end)) => Some(Roi::new(begin.clone(), end.clone())),
            _ => None,
        }
    }

    /// Gets the resources requested for each job of the given task.
    pub fn resources(&self, task_name: &str) -> Result<JobResources> {
        match self.tasks.get(task_name) {
            Some(config) => config.resources(task_name),
            None => TaskResourceConfig::default().resources(task_name),
        }
    }

    /// Creates a new job execution backend based on this configuration.
    pub fn create_backend(
        self: &Arc<Self>,
        registry: Arc<TaskRegistry>,
    ) -> Result<Arc<dyn JobBackend>> {
        match &self.backend {
            BackendConfig::Local(config) => Ok(Arc::new(LocalBackend::new(config, registry)?)),
            BackendConfig::Slurm(config) => Ok(Arc::new(SlurmBackend::new(
                config.clone(),
                self.worker.command()?,
            )?)),
            BackendConfig::Lsf(config) => Ok(Arc::new(LsfBackend::new(
                config.clone(),
                self.worker.command()?,
            )?)),
        }
    }
}

/// Represents completion monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct MonitorConfig {
    /// The interval between polls for success markers, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    /// The overall timeout of a wait, in seconds.
    ///
    /// This only applies to backends that cannot tell whether a job is still
    /// running.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Gets the default poll interval.
fn default_poll_interval_secs() -> f64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Gets the default wait timeout.
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl MonitorConfig {
    /// Validates the monitor configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.poll_interval_secs.is_finite() || self.poll_interval_secs <= 0.0 {
            bail!("configuration value `monitor.poll_interval_secs` must be positive");
        }

        if self.timeout_secs == 0 {
            bail!("configuration value `monitor.timeout_secs` cannot be zero");
        }

        Ok(())
    }

    /// Gets the poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    /// Gets the wait timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Represents how cluster jobs invoke the worker.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct WorkerConfig {
    /// The worker executable.
    ///
    /// Defaults to the currently running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    /// The arguments preceding the job configuration path.
    ///
    /// Defaults to `["worker"]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl WorkerConfig {
    /// Validates the worker configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(program) = &self.program
            && program.as_os_str().is_empty()
        {
            bail!("configuration value `worker.program` cannot be empty");
        }

        Ok(())
    }

    /// Gets the command used to invoke a worker.
    pub fn command(&self) -> Result<WorkerCommand> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .context("failed to determine the path of the current executable")?,
        };

        let args = self
            .args
            .clone()
            .unwrap_or_else(|| vec![DEFAULT_WORKER_SUBCOMMAND.to_string()]);

        Ok(WorkerCommand { program, args })
    }
}

/// Represents supported job execution backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    /// Use the local job execution backend.
    Local(LocalBackendConfig),
    /// Use the Slurm job execution backend.
    Slurm(SlurmBackendConfig),
    /// Use the LSF job execution backend.
    Lsf(LsfBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local(Default::default())
    }
}

impl BackendConfig {
    /// Validates the backend configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Local(config) => config.validate(),
            Self::Slurm(config) => config.validate(),
            Self::Lsf(config) => config.validate(),
        }
    }
}

/// Represents configuration for the local job execution backend.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LocalBackendConfig {
    /// The number of jobs that may execute concurrently.
    ///
    /// Defaults to the number of logical CPUs for the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<usize>,
}

/// Represents configuration for the Slurm job execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SlurmBackendConfig {
    /// The partition to submit jobs to.
    ///
    /// If not specified, jobs go to the cluster's default partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// The command used to submit jobs.
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    /// Additional arguments passed to the submission command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Gets the default Slurm submission command.
fn default_sbatch() -> String {
    "sbatch".to_string()
}

impl Default for SlurmBackendConfig {
    fn default() -> Self {
        Self {
            partition: None,
            sbatch: default_sbatch(),
            extra_args: Vec::new(),
        }
    }
}

impl SlurmBackendConfig {
    /// Validates the Slurm backend configuration.
    pub fn validate(&self) -> Result<()> {
        if cfg!(not(unix)) {
            bail!("the Slurm backend is not supported on non-unix platforms");
        }

        if self.sbatch.is_empty() {
            bail!("Slurm backend configuration value `sbatch` cannot be empty");
        }

        if matches!(&self.partition, Some(p) if p.is_empty()) {
            bail!("Slurm backend configuration value `partition` cannot be empty");
        }

        Ok(())
    }
}

/// Represents configuration for the LSF job execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LsfBackendConfig {
    /// The queue to submit jobs to.
    ///
    /// If not specified, jobs go to the cluster's default queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// The command used to submit jobs.
    #[serde(default = "default_bsub")]
    pub bsub: String,
    /// Additional arguments passed to the submission command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Gets the default LSF submission command.
fn default_bsub() -> String {
    "bsub".to_string()
}

impl Default for LsfBackendConfig {
    fn default() -> Self {
        Self {
            queue: None,
            bsub: default_bsub(),
            extra_args: Vec::new(),
        }
    }
}

impl LsfBackendConfig {
    /// Validates the LSF backend configuration.
    pub fn validate(&self) -> Result<()> {
        if cfg!(not(unix)) {
            bail!("the LSF backend is not supported on non-unix platforms");
        }

        if self.bsub.is_empty() {
            bail!("LSF backend configuration value `bsub` cannot be empty");
        }

        if matches!(&self.queue, Some(q) if q.is_empty()) {
            bail!("LSF backend configuration value `queue` cannot be empty");
        }

        Ok(())
    }
}

/// Represents the resources requested for the jobs of one task.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TaskResourceConfig {
    /// The number of threads each job may use.
    ///
    /// Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    /// The estimated wall-clock time of each job, in minutes.
    ///
    /// Defaults to 60.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u64>,
    /// The memory limit of each job as a unit string (e.g. `4 GiB`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// The memory limit of each job, in megabytes.
    ///
    /// This cannot be combined with `memory`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

impl TaskResourceConfig {
    /// Validates the resource configuration of the named task.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.threads == Some(0) {
            bail!("configuration value `tasks.{name}.threads` cannot be zero");
        }

        if self.time_limit_minutes == Some(0) {
            bail!("configuration value `tasks.{name}.time_limit_minutes` cannot be zero");
        }

        if self.memory.is_some() && self.memory_limit_mb.is_some() {
            bail!(
                "configuration values `tasks.{name}.memory` and `tasks.{name}.memory_limit_mb` \
                 cannot both be specified"
            );
        }

        if self.memory_limit_mb == Some(0) {
            bail!("configuration value `tasks.{name}.memory_limit_mb` cannot be zero");
        }

        if let Some(memory) = self.memory(name)?
            && memory.as_u64() == 0
        {
            bail!("configuration value `tasks.{name}.memory` cannot be zero");
        }

        Ok(())
    }

    /// Gets the memory limit of the named task, if one is configured.
    fn memory(&self, name: &str) -> Result<Option<ByteSize>> {
        if let Some(mb) = self.memory_limit_mb {
            return Ok(Some(ByteSize::mb(mb)));
        }

        self.memory
            .as_deref()
            .map(|s| {
                s.parse::<ByteSize>().map_err(|e| {
                    anyhow::anyhow!(
                        "configuration value `tasks.{name}.memory` has invalid value `{s}`: {e}"
                    )
                })
            })
            .transpose()
    }

    /// Resolves the resources requested for each job of the named task.
    pub fn resources(&self, name: &str) -> Result<JobResources> {
        Ok(JobResources {
            threads: self.threads.unwrap_or(DEFAULT_THREADS),
            time_limit_minutes: self
                .time_limit_minutes
                .unwrap_or(DEFAULT_TIME_LIMIT_MINUTES),
            memory: self.memory(name)?,
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_validate() {
        // Test invalid job count
        let config = Config {
            max_jobs: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `max_jobs` cannot be zero"
        );

        // Test invalid retries
        let config = Config {
            max_retries: 1000,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `max_retries` cannot exceed 100"
        );

        // Test invalid block shape
        let config = Config {
            block_shape: vec![10, 0],
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `block_shape` has a zero extent on axis 1"
        );

        // Test a one-sided region of interest
        let config = Config {
            roi_begin: Some(vec![0, 0, 0]),
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration values `roi_begin` and `roi_end` must be given together"
        );

        // Test an inverted region of interest
        let config = Config {
            roi_begin: Some(vec![0, 10, 0]),
            roi_end: Some(vec![5, 5, 5]),
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `roi_begin` exceeds `roi_end` on axis 1"
        );

        // Test invalid poll interval
        let config = Config {
            monitor: MonitorConfig {
                poll_interval_secs: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration value `monitor.poll_interval_secs` must be positive"
        );

        // Test invalid local slots
        let config = Config {
            backend: BackendConfig::Local(LocalBackendConfig { slots: Some(0) }),
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "local backend configuration value `slots` cannot be zero"
        );

        // Test conflicting memory limits
        let config = Config {
            tasks: [(
                "write".to_string(),
                TaskResourceConfig {
                    memory: Some("4 GiB".to_string()),
                    memory_limit_mb: Some(4000),
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "configuration values `tasks.write.memory` and `tasks.write.memory_limit_mb` cannot \
             both be specified"
        );

        // Test invalid memory string
        let config = Config {
            tasks: [(
                "write".to_string(),
                TaskResourceConfig {
                    memory: Some("lots".to_string()),
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .starts_with("configuration value `tasks.write.memory` has invalid value `lots`")
        );

        // Test a valid configuration
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parse_toml() {
        let config: Config = toml::from_str(
            r#"
tmp_folder = "/scratch/tmp"
max_jobs = 16
max_retries = 2
block_shape = [50, 512, 512]
roi_begin = [0, 0, 0]
roi_end = [100, 1024, 1024]

[monitor]
poll_interval_secs = 5
timeout_secs = 3600

[backend]
type = "slurm"
partition = "htc"
extra_args = ["--account=lab"]

[tasks.write]
threads = 4
time_limit_minutes = 90
memory_limit_mb = 4000
"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.max_jobs, 16);
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(5));
        assert_eq!(
            config.backend,
            BackendConfig::Slurm(SlurmBackendConfig {
                partition: Some("htc".to_string()),
                sbatch: "sbatch".to_string(),
                extra_args: vec!["--account=lab".to_string()],
            })
        );
        assert_eq!(
            config.resources("write").unwrap(),
            JobResources {
                threads: 4,
                time_limit_minutes: 90,
                memory: Some(ByteSize::mb(4000)),
            }
        );
        assert_eq!(
            config.resources("other").unwrap(),
            JobResources {
                threads: 1,
                time_limit_minutes: 60,
                memory: None,
            }
        );
        assert_eq!(config.roi().unwrap().end, vec![100, 1024, 1024]);
    }

    #[test]
    fn unknown_fields() {
        let e = toml::from_str::<Config>("max_job = 3").unwrap_err();
        assert!(e.to_string().contains("unknown field `max_job`"));
    }

    #[test]
    fn worker_command() {
        let config = WorkerConfig {
            program: Some(PathBuf::from("/usr/local/bin/blockwise")),
            args: None,
        };
        assert_eq!(
            config.command().unwrap(),
            WorkerCommand {
                program: PathBuf::from("/usr/local/bin/blockwise"),
                args: vec!["worker".to_string()],
            }
        );
    }
}
