//! Status codes carried on the wire by fence and group releases

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a collective as reported to every participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    /// Operation completed
    #[default]
    Success,
    /// A caller-supplied parameter was rejected (e.g. a bad final order)
    BadParam,
    /// A job or tracker could not be found
    NotFound,
    /// The operation did not complete in time
    Timeout,
    /// Identifier space exhausted
    OutOfResource,
    /// Any other failure reported by a participant
    Error,
}

impl Status {
    /// Whether this status reports success
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Combine with another participant's status; the first failure wins.
    pub fn merge(self, other: Status) -> Status {
        if self.is_success() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::BadParam => "bad parameter",
            Status::NotFound => "not found",
            Status::Timeout => "timeout",
            Status::OutOfResource => "out of resource",
            Status::Error => "error",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_is_sticky() {
        let status = Status::Success
            .merge(Status::Success)
            .merge(Status::Timeout)
            .merge(Status::BadParam);
        assert_eq!(status, Status::Timeout);
    }
}
