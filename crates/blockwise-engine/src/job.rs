//! Per-job configuration.
//!
//! The driver writes one [`JobConfig`] per job before the job is submitted;
//! the worker executing the job reads it exactly once.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use bon::Builder;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::backend::BackendKind;
use crate::blocking::Blocking;
use crate::blocking::InvalidRegionError;
use crate::blocking::Roi;
use crate::error::TaskError;

/// Represents the dataset and task-specific parameters shared by every job of
/// a task instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Builder)]
pub struct TaskParams {
    /// The path to the input dataset container.
    #[builder(into)]
    pub input_path: PathBuf,
    /// The key of the input dataset within its container.
    #[builder(into)]
    pub input_key: String,
    /// The path to the output dataset container.
    #[builder(into)]
    pub output_path: Option<PathBuf>,
    /// The key of the output dataset within its container.
    #[builder(into)]
    pub output_key: Option<String>,
    /// Task-specific parameters.
    #[builder(default)]
    pub extra: Map<String, Value>,
}

impl TaskParams {
    /// Determines if the task writes its output in place (i.e. into the input
    /// dataset).
    pub fn in_place(&self) -> bool {
        match (&self.output_path, &self.output_key) {
            (Some(path), Some(key)) => path == &self.input_path && key == &self.input_key,
            _ => true,
        }
    }
}

/// Represents the configuration of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// The name of the task the job belongs to.
    pub task_name: String,
    /// The identifier of the task instance.
    pub task_identifier: String,
    /// The backend the job was submitted to.
    pub backend: BackendKind,
    /// The identifier of the job within its attempt.
    pub job_id: usize,
    /// The attempt the job belongs to.
    pub attempt: u32,
    /// Whether the job performs the task's single-writer work.
    #[serde(default)]
    pub leader: bool,
    /// The directory the job writes its success marker to.
    pub marker_dir: PathBuf,
    /// The path to the input dataset container.
    pub input_path: PathBuf,
    /// The key of the input dataset within its container.
    pub input_key: String,
    /// The path to the output dataset container.
    ///
    /// This is omitted when the task writes in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// The key of the output dataset within its container.
    ///
    /// This is omitted when the task writes in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    /// The shape of the volume.
    pub shape: Vec<u64>,
    /// The block shape of the blocking.
    pub block_shape: Vec<u64>,
    /// The beginning of the region of interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_begin: Option<Vec<u64>>,
    /// The end of the region of interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_end: Option<Vec<u64>>,
    /// The blocks owned by the job.
    pub block_list: Vec<usize>,
    /// The number of threads the job may use.
    pub n_threads: usize,
    /// Task-specific parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl JobConfig {
    /// Gets the region of interest of the blocking, if there is one.
    pub fn roi(&self) -> Option<Roi> {
        match (&self.roi_begin, &self.roi_end) {
            (Some(begin), Some(end)) => Some(Roi::new(begin.clone(), end.clone())),
            _ => None,
        }
    }

    /// Reconstructs the blocking the job's block ids refer to.
    pub fn blocking(&self) -> Result<Blocking, InvalidRegionError> {
        Blocking::new(&self.shape, &self.block_shape, self.roi())
    }

    /// Gets the path of the dataset the job writes to.
    pub fn write_path(&self) -> &Path {
        self.output_path.as_deref().unwrap_or(&self.input_path)
    }

    /// Gets the key of the dataset the job writes to.
    pub fn write_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.input_key)
    }

    /// Gets a task-specific parameter.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Writes the configuration to the given path.
    ///
    /// The configuration is fully written and synced to disk before it is
    /// moved into place, so a job is never submitted against a partially
    /// written configuration.
    pub fn write(&self, path: &Path) -> Result<(), TaskError> {
        let to_error = |source: std::io::Error| TaskError::ConfigWrite {
            path: path.to_path_buf(),
            source,
        };

        let dir = path
            .parent()
            .ok_or_else(|| to_error(std::io::ErrorKind::InvalidInput.into()))?;
        fs::create_dir_all(dir).map_err(to_error)?;

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(to_error)?;
        serde_json::to_writer_pretty(&mut file, self)
            .map_err(|e| to_error(std::io::Error::from(e)))?;
        file.flush().map_err(to_error)?;
        file.as_file().sync_all().map_err(to_error)?;
        file.persist(path).map_err(|e| to_error(e.error))?;
        Ok(())
    }

    /// Reads a configuration from the given path.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read job configuration `{path}`",
                path = path.display()
            )
        })?;

        serde_json::from_str(&contents).with_context(|| {
            format!(
                "failed to parse job configuration `{path}`",
                path = path.display()
            )
        })
    }
}

/// Recovers the job id from the numeric suffix of a job configuration path.
///
/// For example, `write_relabel_job_3.config` is the configuration of job 3.
pub fn job_id_from_path(path: &Path) -> Result<usize> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("invalid job configuration path `{path}`", path = path.display()))?;

    stem.rsplit('_')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| {
            anyhow!(
                "job configuration path `{path}` does not end with a job id",
                path = path.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn config() -> JobConfig {
        let mut params = Map::new();
        params.insert("assignment_path".to_string(), json!("/data/assignments.json"));
        JobConfig {
            task_name: "write".to_string(),
            task_identifier: "write_relabel".to_string(),
            backend: BackendKind::Local,
            job_id: 2,
            attempt: 1,
            leader: false,
            marker_dir: PathBuf::from("/tmp/markers"),
            input_path: PathBuf::from("/data/seg.n5"),
            input_key: "seg".to_string(),
            output_path: None,
            output_key: None,
            shape: vec![100, 100, 100],
            block_shape: vec![50, 50, 50],
            roi_begin: None,
            roi_end: None,
            block_list: vec![4, 5],
            n_threads: 4,
            params,
        }
    }

    #[test]
    fn payload_format() {
        let value = serde_json::to_value(config()).unwrap();
        assert_eq!(value["block_list"], json!([4, 5]));
        assert_eq!(value["backend"], json!("local"));
        assert_eq!(value["assignment_path"], json!("/data/assignments.json"));
        assert!(value.get("output_path").is_none());
        assert!(value.get("output_key").is_none());
        assert!(value.get("roi_begin").is_none());
    }

    #[test]
    fn write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs").join("write_relabel_job_2.config");
        let expected = config();
        expected.write(&path).unwrap();

        // Rewriting with the same inputs is harmless
        expected.write(&path).unwrap();

        let actual = JobConfig::read(&path).unwrap();
        assert_eq!(actual, expected);
        assert_eq!(actual.write_path(), Path::new("/data/seg.n5"));
        assert_eq!(actual.write_key(), "seg");
        assert_eq!(actual.blocking().unwrap().num_blocks(), 8);

        // No temporary files are left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn job_ids_from_paths() {
        assert_eq!(
            job_id_from_path(Path::new("/tmp/configs/write_relabel_job_12.config")).unwrap(),
            12
        );
        assert_eq!(job_id_from_path(Path::new("job_0.config")).unwrap(), 0);
        assert!(job_id_from_path(Path::new("/tmp/configs/write.config")).is_err());
        assert!(job_id_from_path(Path::new("/")).is_err());
    }

    #[test]
    fn in_place() {
        let params = TaskParams::builder()
            .input_path("/data/seg.n5")
            .input_key("seg")
            .build();
        assert!(params.in_place());

        let params = TaskParams::builder()
            .input_path("/data/seg.n5")
            .input_key("seg")
            .output_path("/data/seg.n5")
            .output_key("seg")
            .build();
        assert!(params.in_place());

        let params = TaskParams::builder()
            .input_path("/data/seg.n5")
            .input_key("seg")
            .output_path("/data/seg.n5")
            .output_key("relabeled")
            .build();
        assert!(!params.in_place());
    }
}
