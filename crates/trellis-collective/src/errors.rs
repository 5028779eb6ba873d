//! Error type for the collective engines

use trellis_core::{Status, Tag, TrellisError};

/// Failures raised by the xcast, fence and group engines
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectiveError {
    /// A message on `tag` could not be unpacked
    #[error("malformed {tag} message: {message}")]
    MalformedWire {
        /// Tag the message arrived on
        tag: Tag,
        /// What failed to decode
        message: String,
    },

    /// Peer speaks a different wire schema
    #[error("wire schema mismatch: expected v{expected}, got v{actual}")]
    SchemaMismatch {
        /// Schema this daemon speaks
        expected: u16,
        /// Schema found in the message
        actual: u16,
    },

    /// The tree delivered a message that cannot be legitimate here
    #[error("routing inconsistency: {message}")]
    Routing {
        /// Description of the inconsistency
        message: String,
    },

    /// A job, map or tracker could not be found
    #[error("not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// A final membership order does not reproduce the membership
    #[error("bad final order: {message}")]
    BadFinalOrder {
        /// Details of the mismatch
        message: String,
    },

    /// Two requests for the same collective disagree
    #[error("conflicting request: {message}")]
    Conflict {
        /// Details of the conflict
        message: String,
    },

    /// The collective finished with a failure status
    #[error("collective failed: {0}")]
    Status(Status),

    /// The context id counter has nothing left to hand out
    #[error("context ids exhausted")]
    Exhausted,

    /// The runtime actor is gone
    #[error("collective runtime stopped")]
    ChannelClosed,

    /// Core-level failure (transport, serialization, configuration)
    #[error(transparent)]
    Core(#[from] TrellisError),
}

impl CollectiveError {
    /// Create a malformed wire error for `tag`
    pub fn malformed(tag: Tag, message: impl Into<String>) -> Self {
        Self::MalformedWire {
            tag,
            message: message.into(),
        }
    }

    /// Create a routing inconsistency error
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Errors that leave the daemon unable to trust its peers or its tree.
    /// These terminate the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedWire { .. } | Self::SchemaMismatch { .. } | Self::Routing { .. }
        )
    }

    /// Status reported to participants for this failure
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound { .. } => Status::NotFound,
            Self::BadFinalOrder { .. } | Self::Conflict { .. } => Status::BadParam,
            Self::Exhausted => Status::OutOfResource,
            Self::Status(status) => *status,
            _ => Status::Error,
        }
    }

    /// Turn a non-success release status into an error
    pub fn check(status: Status) -> CollectiveResult<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::Status(status))
        }
    }
}

/// Result type for collective operations
pub type CollectiveResult<T> = std::result::Result<T, CollectiveError>;
