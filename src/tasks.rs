//! Built-in tasks.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use blockwise_engine::Block;
use blockwise_engine::BlockTask;
use blockwise_engine::Blocking;
use blockwise_engine::JobContext;
use blockwise_engine::TaskParams;
use blockwise_engine::TaskRegistry;
use serde_json::json;
use tracing::trace;

/// The name of the manifest task.
pub const MANIFEST_TASK: &str = "manifest";

/// The name of the file written by the leader of the manifest task.
const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Creates the registry of built-in tasks.
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(MANIFEST_TASK, || Arc::new(ManifestTask));
    registry
}

/// A task that records the extent of every block.
///
/// Each block is written as `block_<id>.json` into the directory
/// `<output_path>/<output_key>`; the leader writes `manifest.json`
/// describing the blocking.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestTask;

impl ManifestTask {
    /// Gets the output directory of a task instance.
    fn output_dir(path: &Path, key: &str) -> PathBuf {
        path.join(key)
    }

    /// Gets the path of a block's output.
    fn block_path(dir: &Path, id: usize) -> PathBuf {
        dir.join(format!("block_{id}.json"))
    }

    /// Gets the output directory from the task parameters.
    fn params_dir(params: &TaskParams) -> PathBuf {
        let path = params.output_path.as_deref().unwrap_or(&params.input_path);
        let key = params.output_key.as_deref().unwrap_or(&params.input_key);
        Self::output_dir(path, key)
    }
}

/// Writes a JSON value to a file.
fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(path, contents)
        .with_context(|| format!("failed to write `{path}`", path = path.display()))
}

impl BlockTask for ManifestTask {
    fn prepare(&self, params: &TaskParams, _: &Blocking) -> Result<()> {
        let dir = Self::params_dir(params);
        fs::create_dir_all(&dir).with_context(|| {
            format!(
                "failed to create output directory `{dir}`",
                dir = dir.display()
            )
        })
    }

    fn process_block(&self, job: &JobContext<'_>, block: &Block) -> Result<()> {
        let dir = Self::output_dir(job.config.write_path(), job.config.write_key());
        let path = Self::block_path(&dir, block.id);
        trace!("writing {block} to `{path}`", path = path.display());
        write_json(
            &path,
            &json!({
                "id": block.id,
                "begin": block.begin,
                "end": block.end,
                "job_id": job.config.job_id,
                "attempt": job.config.attempt,
            }),
        )
    }

    fn finalize(&self, job: &JobContext<'_>) -> Result<()> {
        let dir = Self::output_dir(job.config.write_path(), job.config.write_key());
        write_json(
            &dir.join(MANIFEST_FILE_NAME),
            &json!({
                "shape": job.blocking.shape(),
                "block_shape": job.blocking.block_shape(),
                "roi": job.blocking.roi(),
                "num_blocks": job.blocking.num_blocks(),
            }),
        )
    }

    fn clean_up_block(&self, params: &TaskParams, block: &Block) -> Result<()> {
        let path = Self::block_path(&Self::params_dir(params), block.id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to remove `{path}`", path = path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use blockwise_engine::BackendKind;

    use super::*;

    #[test]
    fn registered_for_every_backend() {
        let registry = registry();
        for kind in BackendKind::ALL {
            assert!(registry.contains(MANIFEST_TASK, kind));
        }
    }

    #[test]
    fn clean_up_missing_block() {
        let dir = tempfile::tempdir().unwrap();
        let params = TaskParams::builder()
            .input_path(dir.path())
            .input_key("out")
            .build();
        let block = Block {
            id: 3,
            begin: vec![0],
            end: vec![10],
        };

        ManifestTask.prepare(&params, &Blocking::new(&[10], &[10], None).unwrap()).unwrap();
        ManifestTask.clean_up_block(&params, &block).unwrap();

        let path = dir.path().join("out/block_3.json");
        fs::write(&path, "{}").unwrap();
        ManifestTask.clean_up_block(&params, &block).unwrap();
        assert!(!path.exists());
    }
}
