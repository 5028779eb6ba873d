//! Static job directory
//!
//! Jobs are registered with a rank-to-daemon placement. A job registered
//! without a placement behaves like a job whose process map has not been
//! distributed yet.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use trellis_core::{DaemonId, JobId, LookupError, ProcId, Rank};

#[derive(Debug, Default)]
struct DirectoryState {
    jobs: BTreeMap<JobId, Option<BTreeMap<u32, DaemonId>>>,
}

/// Shared job table
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` with rank `i` placed on `placement[i]`
    pub fn add_job(&self, job: impl Into<JobId>, placement: &[DaemonId]) {
        let map = placement
            .iter()
            .enumerate()
            .map(|(rank, daemon)| (rank as u32, *daemon))
            .collect();
        self.state.write().jobs.insert(job.into(), Some(map));
    }

    /// Register `job` without a process map
    pub fn add_unmapped_job(&self, job: impl Into<JobId>) {
        self.state.write().jobs.insert(job.into(), None);
    }

    /// Daemons hosting `proc`
    pub fn lookup(&self, proc: &ProcId) -> Result<Vec<DaemonId>, LookupError> {
        let state = self.state.read();
        let map = match state.jobs.get(&proc.job) {
            None => return Err(LookupError::UnknownJob(proc.job.clone())),
            Some(None) => return Err(LookupError::NoMap(proc.job.clone())),
            Some(Some(map)) => map,
        };
        let hosts: BTreeSet<DaemonId> = match proc.rank {
            Rank::Wildcard => map.values().copied().collect(),
            Rank::Specific(rank) => map.get(&rank).copied().into_iter().collect(),
        };
        Ok(hosts.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_resolves_every_host_once() {
        let directory = StaticDirectory::new();
        directory.add_job("app", &[DaemonId(2), DaemonId(1), DaemonId(2)]);

        assert_eq!(
            directory.lookup(&ProcId::wildcard("app")),
            Ok(vec![DaemonId(1), DaemonId(2)])
        );
        assert_eq!(directory.lookup(&ProcId::new("app", 1)), Ok(vec![DaemonId(1)]));
        assert_eq!(directory.lookup(&ProcId::new("app", 9)), Ok(vec![]));
    }

    #[test]
    fn unmapped_and_unknown_jobs_are_distinguished() {
        let directory = StaticDirectory::new();
        directory.add_unmapped_job("pending");

        assert_eq!(
            directory.lookup(&ProcId::new("pending", 0)),
            Err(LookupError::NoMap(JobId::new("pending")))
        );
        assert_eq!(
            directory.lookup(&ProcId::new("ghost", 0)),
            Err(LookupError::UnknownJob(JobId::new("ghost")))
        );
    }
}
