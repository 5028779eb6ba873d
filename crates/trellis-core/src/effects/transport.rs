//! Point-to-point transport effects

use crate::{DaemonId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message tag used to route inbound traffic to a receive handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Tree broadcast
    pub const XCAST: Tag = Tag(1);
    /// Broadcast acknowledgment (and ack-request)
    pub const XCAST_ACK: Tag = Tag(2);
    /// Fence contribution rolling up toward the root
    pub const FENCE: Tag = Tag(3);
    /// Fence release, carried inside an xcast
    pub const FENCE_RELEASE: Tag = Tag(4);
    /// Group contribution
    pub const GROUP: Tag = Tag(5);
    /// Group release, carried inside an xcast
    pub const GROUP_RELEASE: Tag = Tag(6);
    /// Routing wire-up information
    pub const WIREUP: Tag = Tag(7);
    /// Notice that a daemon has died
    pub const DAEMON_DIED: Tag = Tag(8);
    /// Daemon command channel
    pub const DAEMON_CMD: Tag = Tag(9);

    const USER_BASE: u32 = 1000;

    /// Tag in the range reserved for other consumers
    pub const fn user(offset: u32) -> Tag {
        Tag(Self::USER_BASE + offset)
    }

    /// Tags whose payload changes how messages are routed. These are
    /// delivered locally before being forwarded down the tree.
    pub fn is_routing_sensitive(self) -> bool {
        self == Tag::WIREUP || self == Tag::DAEMON_DIED
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::XCAST => f.write_str("XCAST"),
            Tag::XCAST_ACK => f.write_str("XCAST_ACK"),
            Tag::FENCE => f.write_str("FENCE"),
            Tag::FENCE_RELEASE => f.write_str("FENCE_RELEASE"),
            Tag::GROUP => f.write_str("GROUP"),
            Tag::GROUP_RELEASE => f.write_str("GROUP_RELEASE"),
            Tag::WIREUP => f.write_str("WIREUP"),
            Tag::DAEMON_DIED => f.write_str("DAEMON_DIED"),
            Tag::DAEMON_CMD => f.write_str("DAEMON_CMD"),
            Tag(other) => write!(f, "TAG({other})"),
        }
    }
}

/// Fire-and-forget messaging between daemons
///
/// A send to the local daemon is legal and is queued like any other message;
/// it is never delivered re-entrantly from inside `send`.
pub trait TransportEffects {
    /// Queue `payload` for delivery to `dest` on `tag`
    fn send(&self, dest: DaemonId, tag: Tag, payload: Vec<u8>) -> Result<()>;
}
