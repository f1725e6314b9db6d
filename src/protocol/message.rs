//! Lease protocol wire message types.
//!
//! A message is a versioned header plus seven length-prefixed relationship
//! identifier lists, letting one message batch state for many relationships
//! between the same two lease agents.

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Lease protocol major version. Different major versions are breaking and
/// are rejected on receive.
pub const LEASE_PROTOCOL_MAJOR_VERSION: u8 = 2;

/// Lease protocol minor version. A higher minor version on the wire is an
/// upgradable change; unknown trailing fields are ignored, not rejected.
pub const LEASE_PROTOCOL_MINOR_VERSION: u8 = 1;

/// Number of relationship identifier lists carried in a message body.
pub const RELATIONSHIP_LIST_COUNT: u32 = 7;

/// Sentinel TTL meaning "unlimited" (MAXLONG in classic lease layers). Used
/// for one-way arbitration inputs and "unkillable" arbitration outcomes.
pub const TTL_MAX: i64 = i64::MAX;

/// Monotonically increasing lease agent incarnation identifier, assigned at
/// agent creation (clock-derived so it survives process restarts in order).
pub type AgentInstance = i64;

/// Monotonically non-decreasing per-relationship lease instance; bumped on
/// every (re)establish so stale timer fires and messages can be detected.
pub type LeaseInstance = u64;

/// Per-agent monotonically increasing message identifier.
pub type MessageId = u64;

/// The (local application, remote application) pair identifying one lease
/// relationship under a given remote lease agent.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize, GetSize,
)]
pub struct LeaseRelationshipId {
    /// Name of the application on the sending side.
    pub local_app: String,

    /// Name of the application on the receiving side.
    pub remote_app: String,
}

impl LeaseRelationshipId {
    pub fn new(local_app: impl Into<String>, remote_app: impl Into<String>) -> Self {
        LeaseRelationshipId {
            local_app: local_app.into(),
            remote_app: remote_app.into(),
        }
    }

    /// The same relationship as seen from the other side.
    pub fn reversed(&self) -> Self {
        LeaseRelationshipId {
            local_app: self.remote_app.clone(),
            remote_app: self.local_app.clone(),
        }
    }
}

impl std::fmt::Display for LeaseRelationshipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local_app, self.remote_app)
    }
}

/// Message types supported by the lease layer.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize, GetSize,
)]
pub enum LeaseMessageType {
    /// Establish or renew subject leases.
    LeaseRequest,
    /// Reply to LeaseRequest carrying accepted/rejected identifiers.
    LeaseResponse,
    /// Pre-arbitration liveness probe.
    PingRequest,
    /// Reply to PingRequest.
    PingResponse,
    /// Ask a third node to relay a renewal to an unreachable peer.
    ForwardRequest,
    /// Relayed renewal outcome back to the origin.
    ForwardResponse,
    /// Relay leg of an indirect renewal, third node to target.
    RelayRequest,
    /// Reply to RelayRequest.
    RelayResponse,
}

/// Versioned lease message header. Carries everything needed for staleness
/// checks (message id, agent instances, lease instance) plus the requested
/// timing values of the sending side.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct LeaseHeader {
    /// Message type tag.
    pub msg_type: LeaseMessageType,

    /// Identifier of the message, increasing per sending agent.
    pub message_id: MessageId,

    /// Canonical listen endpoint of the sending agent.
    pub sender_endpoint: String,

    /// Instance of the sending lease agent.
    pub sender_instance: AgentInstance,

    /// Instance of the receiving lease agent as known by the sender; zero if
    /// unknown. Compared against the local instance to detect stale senders.
    pub target_instance: AgentInstance,

    /// Lease instance of the relationship this message renews; zero for
    /// messages not tied to one relationship (e.g. pings).
    pub lease_instance: LeaseInstance,

    /// Requested (or accepted, in responses) lease duration in milliseconds.
    pub duration_ms: i64,

    /// Granted expiration TTL in milliseconds, from the sender's clock.
    pub expiration_ms: i64,

    /// Sender's configured lease suspend duration in milliseconds.
    pub suspend_duration_ms: i64,

    /// Sender's configured arbitration duration in milliseconds.
    pub arbitration_duration_ms: i64,

    /// Set when the sender has no relationships left with the receiver and
    /// is retiring the whole session.
    pub is_two_way_termination: bool,
}

/// The seven relationship identifier lists a message may batch. Encoded as
/// length-prefixed lists behind a descriptor table (see codec).
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize, GetSize)]
pub struct RelationshipLists {
    /// Subject-side establish/renew requests pending acceptance.
    pub subject_pending: Vec<LeaseRelationshipId>,

    /// Subject-side relationships the sender has locally failed.
    pub subject_failed: Vec<LeaseRelationshipId>,

    /// Monitor-side relationships the sender has declared failed.
    pub monitor_failed: Vec<LeaseRelationshipId>,

    /// Requests the receiver previously sent that are hereby accepted.
    pub subject_accepted: Vec<LeaseRelationshipId>,

    /// Requests the receiver previously sent that are hereby rejected.
    pub subject_rejected: Vec<LeaseRelationshipId>,

    /// Subject-side relationships the sender is terminating.
    pub subject_terminated: Vec<LeaseRelationshipId>,

    /// Monitor-side relationships the sender is terminating.
    pub monitor_terminated: Vec<LeaseRelationshipId>,
}

impl RelationshipLists {
    pub fn is_empty(&self) -> bool {
        self.subject_pending.is_empty()
            && self.subject_failed.is_empty()
            && self.monitor_failed.is_empty()
            && self.subject_accepted.is_empty()
            && self.subject_rejected.is_empty()
            && self.subject_terminated.is_empty()
            && self.monitor_terminated.is_empty()
    }
}

/// A complete lease protocol message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct LeaseMessage {
    pub header: LeaseHeader,
    pub lists: RelationshipLists,

    /// For ForwardRequest/RelayRequest chains: the endpoint the renewal is
    /// ultimately destined to (relay target), and the endpoint it originated
    /// from (reply routing). Empty strings otherwise.
    pub relay_target: String,
    pub relay_origin: String,
}

impl LeaseMessage {
    /// Creates a message with empty body lists and no relay routing.
    pub fn new(header: LeaseHeader) -> Self {
        LeaseMessage {
            header,
            lists: RelationshipLists::default(),
            relay_target: String::new(),
            relay_origin: String::new(),
        }
    }
}
