//! Merge passes scheduling.

use std::ops::Range;

use log;
use rayon::prelude::*;

/// Policy used to group runs into merges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergePolicy {
    /// Runs are merged pairwise (0 with 1, 2 with 3, ...). An odd run left over at the end of a pass is carried
    /// forward unmerged. The number of passes is ⌈log2(runs)⌉.
    BinaryTree,
    /// Up to fan-in consecutive runs are merged at once. If the fan-in is not less than the number of runs all of
    /// them are merged in a single pass.
    KWay,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::KWay
    }
}

/// Result of a merge schedule.
#[derive(Debug)]
pub struct Scheduled<R> {
    /// The surviving run, [`None`] if there was nothing to merge.
    pub result: Option<R>,
    /// Number of merge passes performed.
    pub passes: usize,
}

/// Merge scheduler. Drives merge passes until a single run remains.
///
/// Runs keep their relative order across passes: every merge consumes consecutive runs and its result takes their
/// place. Combined with a merge preferring earlier runs on ties this keeps equal keys in input order.
#[derive(Debug, Copy, Clone)]
pub struct MergeScheduler {
    policy: MergePolicy,
    fan_in: usize,
}

impl MergeScheduler {
    /// Creates a merge scheduler.
    ///
    /// # Arguments
    /// * `policy` - Runs grouping policy
    /// * `fan_in` - Maximum number of runs merged at once by [`MergePolicy::KWay`]. Values below 2 are treated as 2.
    pub fn new(policy: MergePolicy, fan_in: usize) -> Self {
        MergeScheduler {
            policy,
            fan_in: fan_in.max(2),
        }
    }

    /// Returns the maximum number of runs merged at once.
    pub fn fan_in(&self) -> usize {
        match self.policy {
            MergePolicy::BinaryTree => 2,
            MergePolicy::KWay => self.fan_in,
        }
    }

    /// Returns the groups of run indices a pass over `runs` runs merges. Single-run groups are carried forward.
    pub fn plan(&self, runs: usize) -> Vec<Range<usize>> {
        let fan_in = self.fan_in();
        (0..runs).step_by(fan_in).map(|start| start..runs.min(start + fan_in)).collect()
    }

    /// Returns the number of passes needed to merge `runs` runs.
    pub fn passes(&self, mut runs: usize) -> usize {
        let mut passes = 0;
        while runs > 1 {
            runs = self.plan(runs).len();
            passes += 1;
        }

        return passes;
    }

    /// Merges `runs` pass by pass until a single run remains.
    /// Merges of the same pass are independent and executed in parallel on the current thread pool.
    /// A single run is returned without calling `merge`.
    ///
    /// # Arguments
    /// * `runs` - Runs to be merged in input order
    /// * `merge` - Function merging a group of at least two runs into one
    pub fn schedule<R, E, F>(&self, mut runs: Vec<R>, merge: F) -> Result<Scheduled<R>, E>
    where
        R: Send,
        E: Send,
        F: Fn(Vec<R>) -> Result<R, E> + Sync,
    {
        let mut passes = 0;

        while runs.len() > 1 {
            passes += 1;
            let groups = self.group(runs);
            log::debug!("merge pass {} ({} merges)", passes, groups.iter().filter(|group| group.len() > 1).count());

            runs = groups
                .into_par_iter()
                .map(|mut group| {
                    if group.len() == 1 {
                        Ok(group.remove(0))
                    } else {
                        merge(group)
                    }
                })
                .collect::<Result<Vec<R>, E>>()?;
        }

        return Ok(Scheduled {
            result: runs.pop(),
            passes,
        });
    }

    fn group<R>(&self, runs: Vec<R>) -> Vec<Vec<R>> {
        let fan_in = self.fan_in();
        let mut groups = Vec::with_capacity((runs.len() + fan_in - 1) / fan_in);
        let mut runs = runs.into_iter().peekable();

        while runs.peek().is_some() {
            groups.push(Vec::from_iter(runs.by_ref().take(fan_in)));
        }

        return groups;
    }
}
