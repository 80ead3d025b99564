//! The worker entrypoint.
//!
//! A worker executes exactly one job: it processes every block the job owns
//! and, only if all of them succeeded, writes the job's success marker.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use chrono::Utc;
use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::job::JobConfig;
use crate::job::job_id_from_path;
use crate::marker::MarkerStore;
use crate::marker::SuccessMarker;
use crate::registry::JobContext;
use crate::registry::TaskRegistry;

/// Runs the job described by the configuration at the given path.
///
/// Returns the job's success marker. Any error returns before the marker is
/// written, which the driver observes as a failed job.
pub fn run_job(config_path: &Path, registry: &TaskRegistry) -> Result<SuccessMarker> {
    let job_id = job_id_from_path(config_path)?;
    let config = JobConfig::read(config_path)?;
    if config.job_id != job_id {
        bail!(
            "job configuration `{path}` belongs to job {actual}, not job {job_id}",
            path = config_path.display(),
            actual = config.job_id
        );
    }

    info!(
        "starting job {job_id} of task `{id}` (attempt {attempt}) with {n} block(s)",
        id = config.task_identifier,
        attempt = config.attempt,
        n = config.block_list.len()
    );

    let task = registry.create(&config.task_name, config.backend)?;
    let blocking = config.blocking()?;
    let context = JobContext {
        config: &config,
        blocking: &blocking,
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_threads.max(1))
        .build()
        .context("failed to create the block processing thread pool")?;

    pool.install(|| {
        config.block_list.par_iter().try_for_each(|id| {
            let block = blocking
                .block(*id)
                .with_context(|| format!("block {id} is out of range of the blocking"))?;
            trace!("processing block {id}");
            task.process_block(&context, &block)
                .with_context(|| format!("failed to process block {id}"))
        })
    })?;

    if config.leader {
        debug!("job {job_id} is the leader; finalizing");
        task.finalize(&context)
            .with_context(|| format!("failed to finalize job {job_id}"))?;
    }

    let marker = SuccessMarker {
        task_name: config.task_name.clone(),
        job_id,
        attempt: config.attempt,
        leader: config.leader,
        blocks: config.block_list.len(),
        finished_at: Utc::now(),
    };
    MarkerStore::new(&config.marker_dir, &config.task_name).write(&marker)?;

    info!("processed job {job_id}");
    Ok(marker)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::Map;

    use super::*;
    use crate::backend::BackendKind;
    use crate::blocking::Block;
    use crate::registry::BlockTask;

    /// A task recording the blocks it processed.
    #[derive(Default)]
    struct Recorder {
        /// The processed block ids.
        blocks: Mutex<BTreeSet<usize>>,
        /// Whether the task was finalized.
        finalized: Mutex<bool>,
        /// A block that fails to process.
        fail: Option<usize>,
    }

    impl BlockTask for Recorder {
        fn process_block(&self, _: &JobContext<'_>, block: &Block) -> Result<()> {
            if Some(block.id) == self.fail {
                bail!("block {id} is corrupt", id = block.id);
            }

            self.blocks.lock().unwrap().insert(block.id);
            Ok(())
        }

        fn finalize(&self, _: &JobContext<'_>) -> Result<()> {
            *self.finalized.lock().unwrap() = true;
            Ok(())
        }
    }

    fn config(root: &Path, job_id: usize, leader: bool) -> (PathBuf, JobConfig) {
        let config = JobConfig {
            task_name: "record".to_string(),
            task_identifier: "record".to_string(),
            backend: BackendKind::Local,
            job_id,
            attempt: 1,
            leader,
            marker_dir: root.join("markers"),
            input_path: PathBuf::from("/data/in.n5"),
            input_key: "raw".to_string(),
            output_path: None,
            output_key: None,
            shape: vec![100, 100],
            block_shape: vec![50, 50],
            roi_begin: None,
            roi_end: None,
            block_list: vec![1, 3],
            n_threads: 2,
            params: Map::new(),
        };
        let path = root.join(format!("configs/record_job_{job_id}.config"));
        config.write(&path).unwrap();
        (path, config)
    }

    fn registry(task: Arc<Recorder>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("record", move || task.clone());
        registry
    }

    #[test]
    fn processes_owned_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (path, config) = config(dir.path(), 4, true);
        let task = Arc::new(Recorder::default());

        let marker = run_job(&path, &registry(task.clone())).unwrap();
        assert_eq!(marker.job_id, 4);
        assert!(marker.leader);
        assert_eq!(marker.blocks, 2);
        assert_eq!(*task.blocks.lock().unwrap(), BTreeSet::from([1, 3]));
        assert!(*task.finalized.lock().unwrap());

        let store = MarkerStore::new(&config.marker_dir, "record");
        assert_eq!(store.read(4).unwrap(), Some(marker));
    }

    #[test]
    fn failed_block_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (path, config) = config(dir.path(), 0, true);
        let task = Arc::new(Recorder {
            fail: Some(3),
            ..Default::default()
        });

        let e = run_job(&path, &registry(task.clone())).unwrap_err();
        assert_eq!(e.to_string(), "failed to process block 3");
        assert!(!MarkerStore::new(&config.marker_dir, "record").exists(0));
        assert!(!*task.finalized.lock().unwrap());
    }

    #[test]
    fn mismatched_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = config(dir.path(), 1, false);
        let renamed = dir.path().join("configs/record_job_7.config");
        std::fs::rename(&path, &renamed).unwrap();

        let e = run_job(&renamed, &registry(Arc::default())).unwrap_err();
        assert!(e.to_string().ends_with("belongs to job 1, not job 7"));
    }

    #[test]
    fn unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = config(dir.path(), 0, false);

        let e = run_job(&path, &TaskRegistry::new()).unwrap_err();
        assert_eq!(
            e.to_string(),
            "no task named `record` is registered for the local backend"
        );
    }
}
