//! Job/process directory effects

use crate::{DaemonId, JobId, ProcId};
use serde::{Deserialize, Serialize};

/// Why a directory lookup could not produce a daemon set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The job exists but no process map has been distributed yet
    #[error("no process map for job {0}")]
    NoMap(JobId),
    /// The job is unknown to this daemon
    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

/// Key/value pair attached to a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoEntry {
    /// Key
    pub key: String,
    /// Opaque value
    pub value: Vec<u8>,
}

impl InfoEntry {
    /// Create an entry
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Endpoint data published by one process for its peers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Publishing process
    pub proc: ProcId,
    /// The published entry
    pub entry: InfoEntry,
}

/// Resolves processes to hosting daemons and stores released group data
pub trait DirectoryEffects {
    /// Job the daemons themselves belong to
    fn daemon_job(&self) -> JobId;

    /// Daemons currently hosting `proc` (every hosting daemon of the job for
    /// a wildcard rank)
    fn daemons_hosting(&self, proc: &ProcId) -> Result<Vec<DaemonId>, LookupError>;

    /// Install released group and endpoint data for membership queries
    fn install_group_info(&self, group_id: &str, info: &[InfoEntry], endpoints: &[EndpointInfo]);

    /// Forget everything installed for a group
    fn remove_group_info(&self, group_id: &str);
}
