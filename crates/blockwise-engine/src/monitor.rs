//! Completion monitoring of submitted jobs.
//!
//! The monitor never infers a failure while it is still waiting: a job's
//! outcome is only decided once [`CompletionMonitor::wait_for_jobs`] returns.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::backend::JobBackend;
use crate::backend::JobHandle;
use crate::error::JobFailure;
use crate::marker::MarkerStore;

/// Represents the result of waiting for a set of jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSummary {
    /// The jobs that had not settled when the wait timed out.
    pub timed_out: BTreeSet<usize>,
}

/// Represents the outcome of a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job wrote its success marker.
    Succeeded,
    /// The job did not write its success marker.
    Failed(JobFailure),
}

/// Represents the outcomes of every job of an attempt, keyed by job id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcomes(BTreeMap<usize, JobOutcome>);

impl JobOutcomes {
    /// Gets the outcome of a job.
    pub fn get(&self, job_id: usize) -> Option<&JobOutcome> {
        self.0.get(&job_id)
    }

    /// Iterates over the outcomes in job id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &JobOutcome)> {
        self.0.iter().map(|(id, outcome)| (*id, outcome))
    }

    /// Gets the ids of the succeeded jobs.
    pub fn succeeded(&self) -> Vec<usize> {
        self.iter()
            .filter(|(_, o)| matches!(o, JobOutcome::Succeeded))
            .map(|(id, _)| id)
            .collect()
    }

    /// Gets the ids of the failed jobs.
    pub fn failed(&self) -> Vec<usize> {
        self.failures().map(JobFailure::job_id).collect()
    }

    /// Iterates over the failures.
    pub fn failures(&self) -> impl Iterator<Item = &JobFailure> {
        self.0.values().filter_map(|o| match o {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(failure) => Some(failure),
        })
    }

    /// Determines if every job succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Gets the number of jobs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Determines if there are no jobs.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Represents the completion monitor of a task.
#[derive(Debug, Clone)]
pub struct CompletionMonitor {
    /// The interval between polls.
    poll_interval: Duration,
    /// The overall timeout for backends that cannot attest liveness.
    timeout: Duration,
}

impl CompletionMonitor {
    /// Constructs a new completion monitor.
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Waits until every job has settled.
    ///
    /// For a backend that attests liveness, a job is settled once the backend
    /// reports it is no longer running. Otherwise a job is settled once its
    /// success marker exists, and the wait ends at the timeout; the unsettled
    /// jobs are reported as timed out.
    pub async fn wait_for_jobs(
        &self,
        backend: &dyn JobBackend,
        handles: &[JobHandle],
        markers: &MarkerStore,
    ) -> WaitSummary {
        let start = Instant::now();
        let attested = backend.attests_liveness();

        loop {
            let pending: BTreeSet<usize> = handles
                .iter()
                .filter(|h| backend.is_alive(h) && (attested || !markers.exists(h.job_id())))
                .map(JobHandle::job_id)
                .collect();

            if pending.is_empty() {
                debug!(
                    "all {n} job(s) settled after {elapsed:?}",
                    n = handles.len(),
                    elapsed = start.elapsed()
                );
                return WaitSummary::default();
            }

            if !attested && start.elapsed() >= self.timeout {
                warn!(
                    "{n} job(s) did not settle within {timeout:?}",
                    n = pending.len(),
                    timeout = self.timeout
                );
                return WaitSummary { timed_out: pending };
            }

            trace!("waiting for {n} job(s)", n = pending.len());
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Decides the outcome of each job once waiting has finished.
    ///
    /// A job succeeded if and only if its success marker exists.
    pub fn check_jobs(
        &self,
        job_ids: &[usize],
        summary: &WaitSummary,
        markers: &MarkerStore,
    ) -> JobOutcomes {
        JobOutcomes(
            job_ids
                .iter()
                .map(|id| {
                    let outcome = if markers.exists(*id) {
                        JobOutcome::Succeeded
                    } else if summary.timed_out.contains(id) {
                        JobOutcome::Failed(JobFailure::PollTimeout {
                            job_id: *id,
                            timeout: self.timeout,
                        })
                    } else {
                        JobOutcome::Failed(JobFailure::BlockProcessing { job_id: *id })
                    };

                    (*id, outcome)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::BackendKind;
    use crate::backend::JobSubmission;
    use crate::error::SubmissionError;
    use crate::marker::SuccessMarker;

    /// A backend whose jobs never report liveness.
    struct Blind;

    #[async_trait]
    impl JobBackend for Blind {
        fn kind(&self) -> BackendKind {
            BackendKind::Slurm
        }

        fn describe(&self) -> String {
            "blind".to_string()
        }

        fn attests_liveness(&self) -> bool {
            false
        }

        async fn submit(&self, _: &JobSubmission) -> Result<JobHandle, SubmissionError> {
            unreachable!()
        }

        fn is_alive(&self, handle: &JobHandle) -> bool {
            !handle.marker_path().is_file()
        }
    }

    fn write_marker(store: &MarkerStore, job_id: usize) {
        store
            .write(&SuccessMarker {
                task_name: "write".to_string(),
                job_id,
                attempt: 1,
                leader: false,
                blocks: 1,
                finished_at: Utc::now(),
            })
            .unwrap();
    }

    fn handles(store: &MarkerStore, n: usize) -> Vec<JobHandle> {
        (0..n)
            .map(|id| JobHandle::scheduled(id, store.path(id), None))
            .collect()
    }

    #[tokio::test]
    async fn timeout_marks_unsettled_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path(), "write");
        for id in [0, 2, 5] {
            write_marker(&store, id);
        }

        let monitor = CompletionMonitor::new(Duration::from_millis(5), Duration::from_millis(30));
        let handles = handles(&store, 7);
        let summary = monitor.wait_for_jobs(&Blind, &handles, &store).await;
        assert_eq!(summary.timed_out, BTreeSet::from([1, 3, 4, 6]));

        let outcomes = monitor.check_jobs(&[0, 1, 2, 3, 4, 5, 6], &summary, &store);
        assert_eq!(outcomes.succeeded(), vec![0, 2, 5]);
        assert_eq!(outcomes.failed(), vec![1, 3, 4, 6]);
        assert!(!outcomes.all_succeeded());
        assert_eq!(
            outcomes.get(1),
            Some(&JobOutcome::Failed(JobFailure::PollTimeout {
                job_id: 1,
                timeout: Duration::from_millis(30)
            }))
        );
    }

    #[tokio::test]
    async fn late_marker_settles_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path(), "write");
        let monitor = CompletionMonitor::new(Duration::from_millis(5), Duration::from_secs(30));
        let handles = handles(&store, 2);

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                write_marker(&store, 0);
                write_marker(&store, 1);
            })
        };

        let summary = monitor.wait_for_jobs(&Blind, &handles, &store).await;
        writer.await.unwrap();
        assert!(summary.timed_out.is_empty());
        assert!(monitor.check_jobs(&[0, 1], &summary, &store).all_succeeded());
    }

    #[test]
    fn missing_marker_is_block_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path(), "write");
        write_marker(&store, 0);
        fs::write(dir.path().join("write_1.tmp"), "").unwrap();

        let monitor = CompletionMonitor::new(Duration::from_secs(1), Duration::from_secs(1));
        let outcomes = monitor.check_jobs(&[0, 1], &WaitSummary::default(), &store);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes.get(1),
            Some(&JobOutcome::Failed(JobFailure::BlockProcessing { job_id: 1 }))
        );
    }
}
