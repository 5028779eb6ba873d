//! Collective wire format.
//!
//! One [`WireMessage`] variant per tag. Every variant starts with the
//! signature of the collective it belongs to; the remaining fields follow in
//! declaration order, which is the serialization contract. Messages travel
//! inside a [`WireEnvelope`] carrying the schema version.

use crate::compression::Payload;
use crate::errors::{CollectiveError, CollectiveResult};
use crate::signature::{AckId, FenceSignature, GroupSignature, XcastSignature};
use serde::{Deserialize, Serialize};
use trellis_core::{serialization, EndpointInfo, InfoEntry, ProcId, Status, Tag};

pub const SCHEMA_VERSION: u16 = 1;

/// Broadcast of one op down the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcastMessage {
    pub signature: XcastSignature,
    /// Id the receiver acknowledges with
    pub ack_id: AckId,
    /// Tag of the local consumer
    pub tag: Tag,
    pub payload: Payload,
}

/// Direction of an [`XcastAckMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    /// Child to parent: the subtree finished the op
    Ack,
    /// Parent to child: acknowledge again using the enclosed id
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcastAckMessage {
    pub signature: XcastSignature,
    pub ack_id: AckId,
    pub kind: AckKind,
}

/// Options that merge as a fence rolls up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FenceInfo {
    /// Largest timeout requested by any participant, in seconds
    pub timeout: Option<u32>,
    /// First failure reported by any participant
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceMessage {
    pub signature: FenceSignature,
    pub info: FenceInfo,
    /// Contribution of the sender's subtree
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceReleaseMessage {
    pub signature: FenceSignature,
    pub status: Status,
    /// Everyone's contributions, in rollup order
    pub data: Vec<u8>,
}

/// Data carried by a group contribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupBody {
    Construct {
        info: Vec<InfoEntry>,
        endpoints: Vec<EndpointInfo>,
    },
    Destruct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub signature: GroupSignature,
    pub status: Status,
    pub timeout: Option<u32>,
    pub body: GroupBody,
}

/// Data released to every daemon when a group operation completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupReleaseBody {
    Construct {
        membership: Vec<ProcId>,
        info: Vec<InfoEntry>,
        endpoints: Vec<EndpointInfo>,
    },
    Destruct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReleaseMessage {
    pub signature: GroupSignature,
    pub status: Status,
    pub body: GroupReleaseBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Xcast(XcastMessage),
    XcastAck(XcastAckMessage),
    Fence(FenceMessage),
    FenceRelease(FenceReleaseMessage),
    Group(GroupMessage),
    GroupRelease(GroupReleaseMessage),
}

impl WireMessage {
    /// Tag this message travels on
    pub fn tag(&self) -> Tag {
        match self {
            WireMessage::Xcast(_) => Tag::XCAST,
            WireMessage::XcastAck(_) => Tag::XCAST_ACK,
            WireMessage::Fence(_) => Tag::FENCE,
            WireMessage::FenceRelease(_) => Tag::FENCE_RELEASE,
            WireMessage::Group(_) => Tag::GROUP,
            WireMessage::GroupRelease(_) => Tag::GROUP_RELEASE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub schema_version: u16,
    pub message: WireMessage,
}

impl WireEnvelope {
    pub fn new(message: WireMessage) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            message,
        }
    }
}

/// Encode a message for its tag
pub fn encode(message: WireMessage) -> CollectiveResult<Vec<u8>> {
    Ok(serialization::to_vec(&WireEnvelope::new(message))?)
}

/// Decode bytes that arrived on `tag`
pub fn decode(tag: Tag, bytes: &[u8]) -> CollectiveResult<WireMessage> {
    let envelope: WireEnvelope = serialization::from_slice(bytes)
        .map_err(|e| CollectiveError::malformed(tag, e.to_string()))?;
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(CollectiveError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            actual: envelope.schema_version,
        });
    }
    if envelope.message.tag() != tag {
        return Err(CollectiveError::malformed(
            tag,
            format!("carries a {} message", envelope.message.tag()),
        ));
    }
    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::GroupOp;
    use trellis_core::DaemonId;

    #[test]
    fn group_release_survives_the_codec() {
        let mut signature = GroupSignature::new(GroupOp::Construct, "reef");
        signature.context_id = Some(u64::MAX);
        signature.final_order = Some(vec![ProcId::new("b", 1), ProcId::wildcard("a")]);
        let message = WireMessage::GroupRelease(GroupReleaseMessage {
            signature,
            status: Status::Success,
            body: GroupReleaseBody::Construct {
                membership: vec![ProcId::new("b", 1), ProcId::wildcard("a")],
                info: vec![InfoEntry::new("color", b"blue".to_vec())],
                endpoints: vec![EndpointInfo {
                    proc: ProcId::new("b", 1),
                    entry: InfoEntry::new("addr", vec![10, 0, 0, 1]),
                }],
            },
        });
        let bytes = encode(message.clone()).unwrap();
        assert_eq!(decode(Tag::GROUP_RELEASE, &bytes).unwrap(), message);
    }

    #[test]
    fn tag_mismatch_is_malformed() {
        let bytes = encode(WireMessage::XcastAck(XcastAckMessage {
            signature: XcastSignature {
                global_id: 3,
                initiator: DaemonId(1),
                local_id: 1,
            },
            ack_id: AckId(0),
            kind: AckKind::Ack,
        }))
        .unwrap();
        assert!(matches!(
            decode(Tag::FENCE, &bytes),
            Err(CollectiveError::MalformedWire { tag: Tag::FENCE, .. })
        ));
    }

    #[test]
    fn truncated_and_foreign_schema_messages_are_rejected() {
        let bytes = encode(WireMessage::Fence(FenceMessage {
            signature: FenceSignature::new(vec![ProcId::wildcard("job")]),
            info: FenceInfo::default(),
            data: vec![1, 2, 3],
        }))
        .unwrap();
        assert!(decode(Tag::FENCE, &bytes[..bytes.len() / 2])
            .unwrap_err()
            .is_fatal());

        let mut foreign = bytes;
        foreign[0] = 9;
        assert!(matches!(
            decode(Tag::FENCE, &foreign),
            Err(CollectiveError::SchemaMismatch { actual: 9, .. })
        ));
    }
}
