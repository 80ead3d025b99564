//! The task registry.
//!
//! Both the driver and the worker resolve a task's block-processing logic by
//! looking up `(task name, backend kind)` in a [`TaskRegistry`] populated at
//! process start.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::blocking::Block;
use crate::blocking::Blocking;
use crate::job::JobConfig;
use crate::job::TaskParams;

/// Represents the context in which a job processes its blocks.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    /// The configuration of the job.
    pub config: &'a JobConfig,
    /// The blocking the job's block ids refer to.
    pub blocking: &'a Blocking,
}

/// Represents the block-processing logic of a task.
///
/// Implementations must be safe to call concurrently for disjoint blocks.
pub trait BlockTask: Send + Sync {
    /// Prepares the output of a task instance before any job is submitted.
    ///
    /// This runs once in the driver.
    fn prepare(&self, _params: &TaskParams, _blocking: &Blocking) -> Result<()> {
        Ok(())
    }

    /// Processes a single block.
    fn process_block(&self, job: &JobContext<'_>, block: &Block) -> Result<()>;

    /// Performs the single-writer work of a task.
    ///
    /// This runs only in the leader job, after its blocks were processed.
    fn finalize(&self, _job: &JobContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Removes any partial output of a block before the block is retried.
    fn clean_up_block(&self, _params: &TaskParams, _block: &Block) -> Result<()> {
        Ok(())
    }
}

/// Represents an error from looking up a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No task is registered under the name for the backend.
    #[error("no task named `{name}` is registered for the {kind} backend")]
    UnknownTask {
        /// The name that was looked up.
        name: String,
        /// The backend kind that was looked up.
        kind: BackendKind,
    },
}

/// The constructor of a task.
type Constructor = Arc<dyn Fn() -> Arc<dyn BlockTask> + Send + Sync>;

/// Represents a registry of tasks.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    /// The constructors keyed by task name and backend kind.
    constructors: HashMap<(String, BackendKind), Constructor>,
}

impl TaskRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task for every backend kind.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn BlockTask> + Send + Sync + 'static,
    {
        let name = name.into();
        let constructor: Constructor = Arc::new(constructor);
        for kind in BackendKind::ALL {
            self.constructors
                .insert((name.clone(), kind), constructor.clone());
        }
    }

    /// Registers a task for a single backend kind.
    ///
    /// This replaces any existing registration of the pair.
    pub fn register_for<F>(&mut self, name: impl Into<String>, kind: BackendKind, constructor: F)
    where
        F: Fn() -> Arc<dyn BlockTask> + Send + Sync + 'static,
    {
        self.constructors
            .insert((name.into(), kind), Arc::new(constructor));
    }

    /// Creates the task registered under the given name for a backend kind.
    pub fn create(&self, name: &str, kind: BackendKind) -> Result<Arc<dyn BlockTask>, RegistryError> {
        self.constructors
            .get(&(name.to_string(), kind))
            .map(|constructor| constructor())
            .ok_or_else(|| RegistryError::UnknownTask {
                name: name.to_string(),
                kind,
            })
    }

    /// Determines if a task is registered for a backend kind.
    pub fn contains(&self, name: &str, kind: BackendKind) -> bool {
        self.constructors.contains_key(&(name.to_string(), kind))
    }

    /// Gets the sorted names of the registered tasks.
    pub fn names(&self) -> Vec<&str> {
        self.constructors
            .keys()
            .map(|(name, _)| name.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A task that does nothing.
    struct Noop;

    impl BlockTask for Noop {
        fn process_block(&self, _: &JobContext<'_>, _: &Block) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup() {
        let mut registry = TaskRegistry::new();
        registry.register("write", || Arc::new(Noop));
        registry.register_for("relabel", BackendKind::Slurm, || Arc::new(Noop));

        for kind in BackendKind::ALL {
            assert!(registry.create("write", kind).is_ok());
        }

        assert!(registry.contains("relabel", BackendKind::Slurm));
        assert!(!registry.contains("relabel", BackendKind::Local));
        assert_eq!(registry.names(), vec!["relabel", "write"]);
    }

    #[test]
    fn unknown_task() {
        let registry = TaskRegistry::new();
        let e = registry.create("write", BackendKind::Lsf).err().unwrap();
        assert_eq!(
            e,
            RegistryError::UnknownTask {
                name: "write".to_string(),
                kind: BackendKind::Lsf,
            }
        );
        assert_eq!(
            e.to_string(),
            "no task named `write` is registered for the LSF backend"
        );
    }
}
