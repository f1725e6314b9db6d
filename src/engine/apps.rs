//! Leasing application registry: the unit a caller registers to participate
//! in leasing, its event queue, and its drain-guarded teardown.

use std::sync::Arc;

use crate::engine::agent::AgentState;
use crate::protocol::{AgentInstance, LeaseInstance};

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Opaque handle identifying a registered leasing application.
pub type AppHandle = u64;

/// Maximum accepted length of application/endpoint identifiers (MAX_PATH).
pub const MAX_ID_LEN: usize = 260;

/// Events delivered to a registered leasing application. Anything that
/// changes the caller-visible liveness of a lease arrives here, synchronously
/// with respect to the internal state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    /// A lease relationship reached the established (two-way Active) state.
    LeaseEstablished {
        remote_app: String,
        remote_endpoint: String,
    },

    /// The local application's own lease failed (subject side failed, lost
    /// arbitration, or arbitration timed out).
    LeaseFailed,

    /// A monitored remote application was declared failed.
    RemoteExpired {
        remote_app: String,
        remote_endpoint: String,
    },

    /// Both sides look mutually unreachable; the application is asked to
    /// arbitrate. Answer via `complete_arbitration`.
    ArbitrateRequest {
        local_instance: AgentInstance,
        /// Remaining local TTL at the time arbitration started.
        local_ttl_ms: i64,
        remote_endpoint: String,
        remote_instance: AgentInstance,
        remote_app: String,
        /// Remote-side TTL; `TTL_MAX` for a one-way lease.
        remote_ttl_ms: i64,
        monitor_lease_instance: LeaseInstance,
        subject_lease_instance: LeaseInstance,
        /// Upper bound on how long ago the remote could have itself started
        /// arbitrating, letting the arbitrator reason about symmetric races.
        remote_arbitration_ubound_ms: i64,
        /// Protocol (major, minor) version in force.
        protocol_version: (u8, u8),
    },

    /// Lease agent health changed.
    HealthReport { state: AgentState },
}

/// Guard cloned into every delivered event; the owning application cannot be
/// destroyed while any guard is still alive.
#[derive(Debug, Clone)]
pub struct DrainGuard(Arc<()>);

/// An event plus its drain guard, as read from the application's receiver.
#[derive(Debug)]
pub struct AppEvent {
    pub event: LeaseEvent,
    _guard: DrainGuard,
}

/// Receiver half handed to the registering caller.
pub type AppEventReceiver = mpsc::Receiver<AppEvent>;

/// Snapshot of an application's status shared with the wrapper for the
/// synchronous expiration-time query.
#[derive(Debug, Clone, Default)]
pub(crate) struct AppStatusView {
    pub(crate) is_closing: bool,
    /// Grace period reported while the application holds no lease.
    pub(crate) expiry_timeout: Duration,
    /// Earliest subject-side expiration across the app's relationships.
    pub(crate) min_subject_expire: Option<Instant>,
}

/// One registered leasing application.
#[derive(Debug)]
pub(crate) struct LeasingApplication {
    pub(crate) name: String,
    pub(crate) handle: AppHandle,

    /// Eligible to be selected as the arbitrator application.
    pub(crate) is_arbitration_enabled: bool,

    /// Grace period used when computing the application's expiration time
    /// while no lease is in force.
    pub(crate) expiry_timeout: Duration,

    /// Set by unregister; a closing application accepts no new leases and
    /// reports clamped TTLs.
    pub(crate) is_closing: bool,

    /// Deferred destruction: unregistered with `is_delayed`, waiting for its
    /// relationships to drain naturally.
    pub(crate) is_delayed_unregister: bool,

    /// Sender side of the bounded event FIFO.
    tx_events: mpsc::Sender<AppEvent>,

    /// Drain guard master handle; event deliveries clone it.
    pub(crate) drain: Arc<()>,
}

impl LeasingApplication {
    pub(crate) fn new(
        name: String,
        handle: AppHandle,
        is_arbitration_enabled: bool,
        expiry_timeout: Duration,
        queue_cap: usize,
    ) -> (Self, AppEventReceiver) {
        let (tx_events, rx_events) = mpsc::channel(queue_cap);
        (
            LeasingApplication {
                name,
                handle,
                is_arbitration_enabled,
                expiry_timeout,
                is_closing: false,
                is_delayed_unregister: false,
                tx_events,
                drain: Arc::new(()),
            },
            rx_events,
        )
    }

    /// Pushes an event onto the application's FIFO. The queue is bounded; if
    /// the consumer has fallen behind past the cap the event is dropped with
    /// a warning rather than blocking the engine.
    pub(crate) fn deliver(&self, event: LeaseEvent) {
        let wrapped = AppEvent {
            event,
            _guard: DrainGuard(self.drain.clone()),
        };
        if let Err(e) = self.tx_events.try_send(wrapped) {
            pf_warn!(
                "event queue of application '{}' rejected event: {}",
                self.name,
                e
            );
        }
    }

    /// True once no delivered event guard remains alive.
    pub(crate) fn is_drained(&self) -> bool {
        Arc::strong_count(&self.drain) == 1
    }
}
