//! Lease protocol wire format: message types and the versioned codec.

mod codec;
mod message;

pub use codec::{decode_message, encode_message};
pub use message::{
    AgentInstance, LeaseHeader, LeaseInstance, LeaseMessage, LeaseMessageType,
    LeaseRelationshipId, MessageId, RelationshipLists,
    LEASE_PROTOCOL_MAJOR_VERSION, LEASE_PROTOCOL_MINOR_VERSION,
    RELATIONSHIP_LIST_COUNT, TTL_MAX,
};
