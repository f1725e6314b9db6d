//! Per-remote-endpoint lease agent aggregate.
//!
//! A `RemoteLeaseAgent` owns the lease relationships with one physical peer,
//! the staleness bookkeeping for that peer (advertised instance, message id
//! ordering), and the per-relationship timers. At most one remote lease agent
//! per peer endpoint is Active at a time; superseded ones stay reachable only
//! to drain in-flight work until ready for deallocation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::relationship::LeaseRelationship;
use crate::protocol::{AgentInstance, LeaseRelationshipId, MessageId};
use crate::utils::Timer;

use tokio::time::Instant;

/// Verdict of the staleness checks applied to every incoming message.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum IncomingVerdict {
    /// Message is in order; apply it.
    Fresh,
    /// Older instance or message id than already applied; drop with a trace.
    StaleDrop,
    /// The peer restarted with a higher instance; retire this remote agent
    /// and re-create it for the fresh incarnation.
    NewerInstance,
}

/// Timer slots for one lease relationship. Timers are re-created on every
/// arm so each fire callback carries the exact snapshot it was armed with.
#[derive(Debug, Default)]
pub(crate) struct RelationshipTimers {
    /// Fires when the next subject renew request should go out.
    pub(crate) renew: Option<Timer>,

    /// Fires at the subject-side expiration deadline.
    pub(crate) subject_expire: Option<Timer>,

    /// Fires when the suspend window after subject expiry lapses.
    pub(crate) subject_fail: Option<Timer>,

    /// Fires at the monitor-side expiration deadline.
    pub(crate) monitor_expire: Option<Timer>,

    /// Fires when the pre-arbitration ping window closes unanswered.
    pub(crate) pre_arbitration: Option<Timer>,

    /// Fail-closed deadline for an in-flight arbitration.
    pub(crate) arbitration: Option<Timer>,

    /// Delays the termination broadcast until the loser's TTL has lapsed.
    pub(crate) delayed_termination: Option<Timer>,
}

impl RelationshipTimers {
    pub(crate) fn any_armed(&self) -> bool {
        [
            &self.renew,
            &self.subject_expire,
            &self.subject_fail,
            &self.monitor_expire,
            &self.pre_arbitration,
            &self.arbitration,
            &self.delayed_termination,
        ]
        .iter()
        .any(|t| t.as_ref().is_some_and(|t| t.armed()))
    }

    pub(crate) fn disarm_all(&mut self) {
        self.renew = None;
        self.subject_expire = None;
        self.subject_fail = None;
        self.monitor_expire = None;
        self.pre_arbitration = None;
        self.arbitration = None;
        self.delayed_termination = None;
    }
}

/// Aggregate for all leasing state against one remote endpoint.
#[derive(Debug)]
pub(crate) struct RemoteLeaseAgent {
    /// Canonical listen endpoint of the peer.
    pub(crate) endpoint: String,

    /// The peer's advertised agent instance as observed in the last applied
    /// message; zero until first contact.
    pub(crate) remote_instance: AgentInstance,

    /// Only one remote lease agent per physical peer may be Active; retired
    /// ones linger until ready for deallocation.
    pub(crate) is_active: bool,

    /// Lease relationships with this peer, keyed by application pair.
    pub(crate) relationships: HashMap<LeaseRelationshipId, LeaseRelationship>,

    /// Timer slots per relationship.
    pub(crate) timers: HashMap<LeaseRelationshipId, RelationshipTimers>,

    /// Highest message id applied from this peer; lower ids are duplicates.
    pub(crate) last_received_message_id: MessageId,

    /// When the last message from this peer was applied. A peer silent for
    /// longer than the configured unresponsive duration is not eligible as
    /// an indirect-renewal relay.
    pub(crate) last_incoming_at: Option<Instant>,

    /// A pre-arbitration ping round-trip is in flight.
    pub(crate) ping_in_progress: bool,

    /// Periodic ping probe while in arbitration-neutral holdover.
    pub(crate) ping_retry: Option<Timer>,

    /// An inconclusive arbitration keeps this agent alive a bit longer
    /// rather than immediately retrying, bounding churn.
    pub(crate) arbitration_neutral: bool,

    /// GC deadline after failure/retirement; the maintenance sweep never
    /// deallocates before this.
    pub(crate) time_to_be_failed: Option<Instant>,

    /// Drain guard: clones are held by in-flight work that still references
    /// this agent; deallocation requires all clones dropped.
    pub(crate) drain: Arc<()>,
}

impl RemoteLeaseAgent {
    pub(crate) fn new(endpoint: String, remote_instance: AgentInstance) -> Self {
        RemoteLeaseAgent {
            endpoint,
            remote_instance,
            is_active: true,
            relationships: HashMap::new(),
            timers: HashMap::new(),
            last_received_message_id: 0,
            last_incoming_at: None,
            ping_in_progress: false,
            ping_retry: None,
            arbitration_neutral: false,
            time_to_be_failed: None,
            drain: Arc::new(()),
        }
    }

    /// Applies the instance-ordering and message-id-ordering rules to an
    /// incoming message from this peer.
    pub(crate) fn check_incoming(
        &self,
        sender_instance: AgentInstance,
        message_id: MessageId,
    ) -> IncomingVerdict {
        if self.remote_instance != 0 {
            if sender_instance > self.remote_instance {
                return IncomingVerdict::NewerInstance;
            }
            if sender_instance < self.remote_instance {
                return IncomingVerdict::StaleDrop;
            }
        }
        if message_id <= self.last_received_message_id {
            return IncomingVerdict::StaleDrop;
        }
        IncomingVerdict::Fresh
    }

    /// Records an applied message's ordering keys and receive time.
    pub(crate) fn record_incoming(
        &mut self,
        sender_instance: AgentInstance,
        message_id: MessageId,
        now: Instant,
    ) {
        self.remote_instance = sender_instance;
        self.last_received_message_id = message_id;
        self.last_incoming_at = Some(now);
    }

    /// Marks this agent superseded or terminated; timers are disarmed and a
    /// GC deadline installed so the maintenance sweep can reclaim it.
    pub(crate) fn retire(&mut self, gc_at: Instant) {
        self.is_active = false;
        for timers in self.timers.values_mut() {
            timers.disarm_all();
        }
        self.ping_in_progress = false;
        self.ping_retry = None;
        if self.time_to_be_failed.is_none() {
            self.time_to_be_failed = Some(gc_at);
        }
    }

    /// True when every relationship is terminal and no timer is armed.
    pub(crate) fn all_relationships_terminal(&self) -> bool {
        self.relationships.values().all(|r| r.is_terminal())
            && self.timers.values().all(|t| !t.any_armed())
    }

    /// A remote lease agent may be deallocated only when it is retired (or
    /// otherwise terminal), all relationships are Inactive, no timer is
    /// armed, no in-flight work holds the drain guard, and the GC deadline
    /// has passed.
    pub(crate) fn is_ready_for_deallocation(&self, now: Instant) -> bool {
        if self.is_active && !self.all_relationships_terminal() {
            return false;
        }
        if !self.all_relationships_terminal() {
            return false;
        }
        if Arc::strong_count(&self.drain) > 1 {
            return false;
        }
        if self.arbitration_neutral {
            return false;
        }
        match self.time_to_be_failed {
            Some(at) => now >= at,
            None => !self.is_active,
        }
    }
}
