//! Retry control.
//!
//! A failed attempt is retried with the blocks of its failed jobs only, until
//! the configured number of retries is exhausted.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::RetryExhausted;
use crate::partition::JobGroup;

/// Represents the state of a single run of a task instance.
///
/// A run numbers its attempts from the first attempt directory that no
/// earlier run of the task instance has used, so markers left behind by an
/// earlier run are never observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    /// The identifier of the task instance.
    task_id: String,
    /// The first attempt of the run.
    first_attempt: u32,
    /// The current attempt.
    attempt: u32,
    /// The jobs submitted in the current attempt.
    submitted: BTreeSet<usize>,
    /// The jobs of the current attempt confirmed successful.
    succeeded: BTreeSet<usize>,
    /// Whether a leader job has succeeded in this run.
    leader_done: bool,
}

impl RunState {
    /// Constructs the state of a new run starting at attempt 1.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self::starting_at(task_id, 1)
    }

    /// Constructs the state of a new run starting at the given attempt.
    pub fn starting_at(task_id: impl Into<String>, first_attempt: u32) -> Self {
        Self {
            task_id: task_id.into(),
            first_attempt,
            attempt: first_attempt,
            submitted: BTreeSet::new(),
            succeeded: BTreeSet::new(),
            leader_done: false,
        }
    }

    /// Gets the identifier of the task instance.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Gets the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Gets the number of attempts made in this run, including the current
    /// one.
    pub fn attempts_made(&self) -> u32 {
        self.attempt - self.first_attempt + 1
    }

    /// Gets the jobs submitted in the current attempt.
    pub fn submitted(&self) -> &BTreeSet<usize> {
        &self.submitted
    }

    /// Gets the jobs of the current attempt confirmed successful.
    pub fn succeeded(&self) -> &BTreeSet<usize> {
        &self.succeeded
    }

    /// Records that a job of the current attempt was submitted.
    pub fn record_submitted(&mut self, job_id: usize) {
        self.submitted.insert(job_id);
    }

    /// Records that a job of the current attempt succeeded.
    pub fn record_succeeded(&mut self, job_id: usize) {
        self.succeeded.insert(job_id);
    }

    /// Determines if a leader job has succeeded in this run.
    pub fn leader_done(&self) -> bool {
        self.leader_done
    }

    /// Records that a leader job has succeeded.
    pub fn mark_leader_done(&mut self) {
        self.leader_done = true;
    }
}

/// Represents the retry policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryController {
    /// The number of retries after the first attempt.
    max_retries: u32,
}

impl RetryController {
    /// Constructs a new retry controller.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Gets the number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Computes the sorted union of the blocks owned by the failed jobs.
    pub fn reduced_block_list(failed_job_ids: &[usize], jobs: &[JobGroup]) -> Vec<usize> {
        let failed: BTreeSet<_> = failed_job_ids.iter().collect();
        jobs.iter()
            .filter(|job| failed.contains(&job.job_id))
            .flat_map(|job| job.block_ids.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Advances a run past a failed attempt.
    ///
    /// Returns the blocks to retry, or an error if the attempt that failed
    /// was the last one allowed.
    pub fn advance(
        &self,
        state: &mut RunState,
        failed_job_ids: &[usize],
        jobs: &[JobGroup],
    ) -> Result<Vec<usize>, RetryExhausted> {
        let blocks = Self::reduced_block_list(failed_job_ids, jobs);
        if state.attempts_made() > self.max_retries {
            return Err(RetryExhausted {
                task_id: state.task_id.clone(),
                attempts: state.attempts_made(),
                failed_blocks: blocks,
            });
        }

        state.attempt += 1;
        state.submitted.clear();
        state.succeeded.clear();
        debug!(
            "retrying {n} block(s) of task `{id}` in attempt {attempt}",
            n = blocks.len(),
            id = state.task_id,
            attempt = state.attempt
        );
        Ok(blocks)
    }
}
