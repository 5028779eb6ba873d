//! Process, job and daemon identifiers
//!
//! `ProcId` carries a total order (job name, then rank with the wildcard
//! sorting after every concrete rank) so that every daemon sorts a group
//! membership identically.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a launched job (its namespace)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Create a job identifier from its namespace name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Namespace name of the job
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Rank of a process within its job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rank {
    /// A single concrete rank
    Specific(u32),
    /// Every rank of the job
    Wildcard,
}

impl Rank {
    /// Whether this is the "all ranks" wildcard
    pub fn is_wildcard(self) -> bool {
        matches!(self, Rank::Wildcard)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Specific(rank) => write!(f, "{rank}"),
            Rank::Wildcard => f.write_str("*"),
        }
    }
}

/// A process identifier: job plus rank (possibly wildcard)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcId {
    /// Job the process belongs to
    pub job: JobId,
    /// Rank within the job
    pub rank: Rank,
}

impl ProcId {
    /// Identifier of one concrete process
    pub fn new(job: impl Into<JobId>, rank: u32) -> Self {
        Self {
            job: job.into(),
            rank: Rank::Specific(rank),
        }
    }

    /// Identifier naming every process of a job
    pub fn wildcard(job: impl Into<JobId>) -> Self {
        Self {
            job: job.into(),
            rank: Rank::Wildcard,
        }
    }

    /// Loose identity check: same job and either equal ranks or a wildcard
    /// on either side.
    pub fn matches(&self, other: &ProcId) -> bool {
        self.job == other.job
            && (self.rank == other.rank || self.rank.is_wildcard() || other.rank.is_wildcard())
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job, self.rank)
    }
}

/// Identifier of one per-node daemon (its rank in the daemon job)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DaemonId(pub u32);

impl DaemonId {
    /// Numeric rank of the daemon
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl From<u32> for DaemonId {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_sorts_after_concrete_ranks() {
        let mut procs = vec![
            ProcId::wildcard("b"),
            ProcId::new("b", 7),
            ProcId::new("a", 3),
            ProcId::new("b", 2),
        ];
        procs.sort();
        assert_eq!(
            procs,
            vec![
                ProcId::new("a", 3),
                ProcId::new("b", 2),
                ProcId::new("b", 7),
                ProcId::wildcard("b"),
            ]
        );
    }

    #[test]
    fn wildcard_matches_any_rank_of_same_job() {
        let all = ProcId::wildcard("job");
        assert!(all.matches(&ProcId::new("job", 4)));
        assert!(ProcId::new("job", 4).matches(&all));
        assert!(!all.matches(&ProcId::new("other", 4)));
        assert!(!ProcId::new("job", 1).matches(&ProcId::new("job", 2)));
    }
}
