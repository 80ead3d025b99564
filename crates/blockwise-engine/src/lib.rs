//! Execution engine for block-wise processing of large multi-dimensional
//! volumes.
//!
//! A volume is partitioned into a regular grid of blocks ([`Blocking`]), the
//! blocks are grouped into jobs ([`partition_blocks`]), and each job is
//! executed by a worker on a [`JobBackend`]: in-process on a bounded pool, or
//! as a batch job on a Slurm or LSF cluster. A job proves its success only by
//! writing a success marker; a [`ClusterTask`] waits for the markers of an
//! attempt and retries the blocks of failed jobs until its retry budget is
//! exhausted.

use std::sync::LazyLock;

use sysinfo::CpuRefreshKind;
use sysinfo::System;

pub mod backend;
pub mod blocking;
pub mod config;
mod error;
pub mod job;
pub mod layout;
pub mod marker;
pub mod monitor;
pub mod partition;
pub mod registry;
pub mod retry;
pub mod task;
pub mod worker;

pub use backend::BackendKind;
pub use backend::JobBackend;
pub use backend::JobHandle;
pub use blocking::Block;
pub use blocking::Blocking;
pub use blocking::Roi;
pub use config::Config;
pub use error::*;
pub use job::JobConfig;
pub use job::TaskParams;
pub use monitor::CompletionMonitor;
pub use monitor::JobOutcome;
pub use monitor::JobOutcomes;
pub use partition::JobGroup;
pub use partition::partition_blocks;
pub use registry::BlockTask;
pub use registry::JobContext;
pub use registry::RegistryError;
pub use registry::TaskRegistry;
pub use retry::RetryController;
pub use task::ClusterTask;
pub use task::TaskReport;
pub use task::TaskSpec;
pub use task::TaskState;

/// Cached information about the current system.
static SYSTEM: LazyLock<System> = LazyLock::new(|| {
    let mut system = System::new();
    system.refresh_cpu_list(CpuRefreshKind::nothing());
    system
});
