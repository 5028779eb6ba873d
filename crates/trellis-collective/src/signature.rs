//! Collective signatures and their content-derived keys
//!
//! A signature names one instance of a collective. Trackers are stored under
//! a [`SignatureKey`], a BLAKE3 digest of the signature's canonical bytes, so
//! every daemon derives the same key for the same collective without a
//! linear scan.
//!
//! Xcast ops are the exception: they are matched by explicit rules (see
//! `xcast::XcastEngine`) because their global id is filled in on the way.

use serde::{Deserialize, Serialize};
use std::fmt;
use trellis_core::{DaemonId, ProcId, Rank};

/// Content-derived tracker key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignatureKey([u8; 32]);

impl SignatureKey {
    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureKey({self})")
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Length-prefixed canonical encoding fed into the key hash
struct Canonical(blake3::Hasher);

impl Canonical {
    fn new(domain: &str) -> Self {
        let mut canonical = Self(blake3::Hasher::new());
        canonical.text(domain);
        canonical
    }

    fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    fn text(&mut self, text: &str) -> &mut Self {
        self.bytes(text.as_bytes())
    }

    fn number(&mut self, value: u64) -> &mut Self {
        self.0.update(&value.to_le_bytes());
        self
    }

    fn procs(&mut self, procs: &[ProcId]) -> &mut Self {
        self.number(procs.len() as u64);
        for proc in procs {
            self.text(proc.job.as_str());
            match proc.rank {
                Rank::Specific(rank) => self.number(0).number(u64::from(rank)),
                Rank::Wildcard => self.number(1),
            };
        }
        self
    }

    fn finish(&self) -> SignatureKey {
        SignatureKey(*self.0.finalize().as_bytes())
    }
}

// ============================================================================
// Fence
// ============================================================================

/// Ordered participant list of one fence. Equality is exact array equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FenceSignature {
    /// Participating processes; wildcard ranks stand for a whole job
    pub procs: Vec<ProcId>,
}

impl FenceSignature {
    /// Signature over `procs` in the given order
    pub fn new(procs: Vec<ProcId>) -> Self {
        Self { procs }
    }

    /// Tracker key
    pub fn key(&self) -> SignatureKey {
        Canonical::new("trellis.fence").procs(&self.procs).finish()
    }
}

impl fmt::Display for FenceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, proc) in self.procs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{proc}")?;
        }
        f.write_str("]")
    }
}

// ============================================================================
// Xcast
// ============================================================================

/// Identity of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XcastSignature {
    /// Assigned by the root; zero until then
    pub global_id: u64,
    /// Daemon that started the broadcast
    pub initiator: DaemonId,
    /// Initiator-local sequence number, starting at 1
    pub local_id: u64,
}

impl XcastSignature {
    /// Whether the root has assigned a global id yet
    pub fn is_assigned(&self) -> bool {
        self.global_id != 0
    }
}

impl fmt::Display for XcastSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xcast#{}({}/{})", self.global_id, self.initiator, self.local_id)
    }
}

/// Acknowledgment round identifier handed from parent to child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckId(pub u32);

impl AckId {
    /// Sentinel meaning "no valid round"; never acknowledged with
    pub const INVALID: AckId = AckId(u32::MAX);

    /// Whether this id can be acknowledged with
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

// ============================================================================
// Group
// ============================================================================

/// Group operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupOp {
    /// Form a new group
    Construct,
    /// Dissolve an existing group
    Destruct,
}

impl fmt::Display for GroupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupOp::Construct => f.write_str("construct"),
            GroupOp::Destruct => f.write_str("destruct"),
        }
    }
}

/// Description of one group operation. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSignature {
    /// Construct or destruct
    pub op: GroupOp,
    /// Group name
    pub group_id: String,
    /// Whether a context id was requested
    pub assign_context_id: bool,
    /// Context id, once the root has assigned one
    pub context_id: Option<u64>,
    /// Members named by the caller
    pub members: Vec<ProcId>,
    /// Number of bootstrap leaders, zero outside bootstrap mode
    pub bootstrap: usize,
    /// Reporter did not know the membership
    pub follower: bool,
    /// Processes joining in addition to `members`
    pub add_members: Vec<ProcId>,
    /// Requested order of the final membership
    pub final_order: Option<Vec<ProcId>>,
}

impl GroupSignature {
    /// Empty signature for `op` on `group_id`
    pub fn new(op: GroupOp, group_id: impl Into<String>) -> Self {
        Self {
            op,
            group_id: group_id.into(),
            assign_context_id: false,
            context_id: None,
            members: Vec::new(),
            bootstrap: 0,
            follower: false,
            add_members: Vec::new(),
            final_order: None,
        }
    }

    /// Tracker key: only the group id and operation take part
    pub fn key(&self) -> SignatureKey {
        group_key(self.op, &self.group_id)
    }

    /// Whether this signature belongs to the leaderless bootstrap mode
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap > 0 || self.follower
    }
}

/// Tracker key of `op` on `group_id`
pub fn group_key(op: GroupOp, group_id: &str) -> SignatureKey {
    let op_code = match op {
        GroupOp::Construct => 0,
        GroupOp::Destruct => 1,
    };
    Canonical::new("trellis.group")
        .number(op_code)
        .text(group_id)
        .finish()
}
