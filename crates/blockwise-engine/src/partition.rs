//! Partitioning of blocks into jobs.

use serde::Deserialize;
use serde::Serialize;

/// Represents a group of blocks executed by a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGroup {
    /// The identifier of the job within its attempt.
    pub job_id: usize,
    /// The identifiers of the blocks owned by the job, in order.
    pub block_ids: Vec<usize>,
}

/// Partitions an ordered sequence of block identifiers into at most
/// `max_jobs` jobs.
///
/// The returned groups are contiguous, non-empty slices of `block_ids` in
/// order; their sizes differ by at most one, with the first groups absorbing
/// the remainder.
///
/// Returns an empty list if there are no blocks or `max_jobs` is zero.
pub fn partition_blocks(block_ids: &[usize], max_jobs: usize) -> Vec<JobGroup> {
    let n_jobs = block_ids.len().min(max_jobs);
    if n_jobs == 0 {
        return Vec::new();
    }

    let base = block_ids.len() / n_jobs;
    let remainder = block_ids.len() % n_jobs;

    let mut groups = Vec::with_capacity(n_jobs);
    let mut start = 0;
    for job_id in 0..n_jobs {
        let len = base + usize::from(job_id < remainder);
        groups.push(JobGroup {
            job_id,
            block_ids: block_ids[start..start + len].to_vec(),
        });
        start += len;
    }

    groups
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn even_split() {
        let blocks: Vec<_> = (0..8).collect();
        let groups = partition_blocks(&blocks, 4);
        assert_eq!(
            groups,
            vec![
                JobGroup {
                    job_id: 0,
                    block_ids: vec![0, 1]
                },
                JobGroup {
                    job_id: 1,
                    block_ids: vec![2, 3]
                },
                JobGroup {
                    job_id: 2,
                    block_ids: vec![4, 5]
                },
                JobGroup {
                    job_id: 3,
                    block_ids: vec![6, 7]
                },
            ]
        );
    }

    #[test]
    fn remainder_goes_first() {
        let blocks: Vec<_> = (10..17).collect();
        let sizes: Vec<_> = partition_blocks(&blocks, 3)
            .iter()
            .map(|g| g.block_ids.len())
            .collect();
        assert_eq!(sizes, vec![3, 2, 2]);
    }

    #[test]
    fn fewer_blocks_than_jobs() {
        let groups = partition_blocks(&[4, 5], 16);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].block_ids, vec![4]);
        assert_eq!(groups[1].block_ids, vec![5]);
    }

    #[test]
    fn empty() {
        assert!(partition_blocks(&[], 4).is_empty());
        assert!(partition_blocks(&[1, 2, 3], 0).is_empty());
    }

    #[test]
    fn reconstructs_sequence() {
        for count in 0..40usize {
            let blocks: Vec<_> = (0..count).map(|i| i * 3 + 1).collect();
            for max_jobs in 1..12 {
                let groups = partition_blocks(&blocks, max_jobs);
                assert_eq!(groups.len(), count.min(max_jobs));
                assert!(groups.iter().all(|g| !g.block_ids.is_empty()));
                assert!(groups.iter().enumerate().all(|(i, g)| g.job_id == i));

                let sizes: Vec<_> = groups.iter().map(|g| g.block_ids.len()).collect();
                if let (Some(min), Some(max)) = (sizes.iter().min(), sizes.iter().max()) {
                    assert!(max - min <= 1);
                }

                let flattened: Vec<_> = groups.into_iter().flat_map(|g| g.block_ids).collect();
                assert_eq!(flattened, blocks);
            }
        }
    }
}
