//! The two-way lease relationship state machine.
//!
//! A relationship binds two one-way leases between one local and one remote
//! leasing application: the subject side (local renews from remote) and the
//! monitor side (local watches the remote's renewals). This module is pure
//! state; timers and message I/O are driven by the owning lease agent.

use crate::config::DurationType;
use crate::protocol::{LeaseInstance, LeaseRelationshipId, MessageId};

use tokio::time::{Duration, Instant};

/// One-way lease states. Only `(Inactive, Inactive)` relationships are
/// terminal and destroyable.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum OneWayState {
    Inactive,
    Active,
    Expired,
    Failed,
}

/// Signed milliseconds from `now` to `at` (negative if already past).
pub(crate) fn ttl_ms(now: Instant, at: Instant) -> i64 {
    if at >= now {
        at.duration_since(now).as_millis() as i64
    } else {
        -(now.duration_since(at).as_millis() as i64)
    }
}

/// State of one two-way lease relationship, owned exclusively by one remote
/// lease agent.
#[derive(Debug)]
pub(crate) struct LeaseRelationship {
    /// (local application, remote application) identifier.
    pub(crate) id: LeaseRelationshipId,

    /// Local lease instance; bumped on every fresh establish so stale timer
    /// fires and stale responses can be recognized.
    pub(crate) lease_instance: LeaseInstance,

    /// Last lease instance observed from the remote subject; older instances
    /// in incoming requests are stale duplicates.
    pub(crate) remote_lease_instance: LeaseInstance,

    /// Highest message id applied to this relationship.
    pub(crate) last_applied_message_id: MessageId,

    pub(crate) subject_state: OneWayState,
    pub(crate) monitor_state: OneWayState,

    /// Subject-side expiration deadline; cleared (not zeroed) on Inactive.
    pub(crate) subject_expire_time: Option<Instant>,

    /// When the expired subject side transitions to Failed (expire time plus
    /// the suspend window).
    pub(crate) subject_fail_time: Option<Instant>,

    /// Monitor-side expiration deadline.
    pub(crate) monitor_expire_time: Option<Instant>,

    /// Which configured duration this relationship renews with; dynamic
    /// duration updates apply the matching configured value.
    pub(crate) duration_kind: DurationType,

    /// Duration the local side most recently asked for.
    pub(crate) local_requested: Duration,

    /// Shadow copy of the duration the remote side most recently asked for.
    /// The in-force duration is the max of the two, so a local config shrink
    /// takes effect only once the peer's recorded request also shrinks.
    pub(crate) remote_requested: Option<Duration>,

    /// Local and remote-requested suspend windows (expired to failed).
    pub(crate) local_suspend: Duration,
    pub(crate) remote_suspend: Option<Duration>,

    /// Local and remote-requested arbitration windows.
    pub(crate) local_arbitration: Duration,
    pub(crate) remote_arbitration: Option<Duration>,

    /// When the last renew request was sent; response TTLs are measured from
    /// this point, never from receive time.
    pub(crate) last_renew_sent_at: Option<Instant>,

    /// Consecutive renew attempts without a response.
    pub(crate) renew_retry_cnt: u32,

    /// Consecutive renewals that went through a third node.
    pub(crate) indirect_cnt: u32,

    /// When the first of the current run of indirect renewals happened.
    pub(crate) first_indirect_at: Option<Instant>,

    /// The one-time established notification for this lease instance has
    /// been delivered to the owning application.
    pub(crate) establish_notified: bool,
}

impl LeaseRelationship {
    pub(crate) fn new(
        id: LeaseRelationshipId,
        duration_kind: DurationType,
        local_requested: Duration,
        local_suspend: Duration,
        local_arbitration: Duration,
    ) -> Self {
        LeaseRelationship {
            id,
            lease_instance: 0,
            remote_lease_instance: 0,
            last_applied_message_id: 0,
            subject_state: OneWayState::Inactive,
            monitor_state: OneWayState::Inactive,
            subject_expire_time: None,
            subject_fail_time: None,
            monitor_expire_time: None,
            duration_kind,
            local_requested,
            remote_requested: None,
            local_suspend,
            remote_suspend: None,
            local_arbitration,
            remote_arbitration: None,
            last_renew_sent_at: None,
            renew_retry_cnt: 0,
            indirect_cnt: 0,
            first_indirect_at: None,
            establish_notified: false,
        }
    }

    /// The in-force negotiated duration: the maximum of what either side has
    /// most recently asked for. A monitor must never grant less than what the
    /// subject needs to stay alive safely.
    pub(crate) fn duration(&self) -> Duration {
        self.local_requested
            .max(self.remote_requested.unwrap_or(Duration::ZERO))
    }

    /// The in-force suspend window, widened the same way as the duration.
    pub(crate) fn suspend_duration(&self) -> Duration {
        self.local_suspend
            .max(self.remote_suspend.unwrap_or(Duration::ZERO))
    }

    /// The in-force arbitration window.
    pub(crate) fn arbitration_duration(&self) -> Duration {
        self.local_arbitration
            .max(self.remote_arbitration.unwrap_or(Duration::ZERO))
    }

    /// Activates the subject (and monitor) side for a local establish call.
    /// Returns true if the relationship was already Active before this call
    /// (idempotent re-establish); expiration times are never reset backward.
    pub(crate) fn establish(&mut self, now: Instant) -> bool {
        if self.subject_state == OneWayState::Active {
            return true;
        }

        self.lease_instance += 1;
        self.establish_notified = false;
        self.subject_state = OneWayState::Active;
        let expire = now + self.duration();
        self.subject_expire_time = Some(
            self.subject_expire_time.map_or(expire, |e| e.max(expire)),
        );
        self.subject_fail_time = None;
        self.renew_retry_cnt = 0;
        self.indirect_cnt = 0;
        self.first_indirect_at = None;

        // establishing also starts watching the remote: the monitor side of
        // the pair arms with the same negotiated duration
        if self.monitor_state != OneWayState::Active {
            self.monitor_state = OneWayState::Active;
            let m_expire = now + self.duration();
            self.monitor_expire_time = Some(
                self.monitor_expire_time
                    .map_or(m_expire, |e| e.max(m_expire)),
            );
        }

        false
    }

    /// Records a renew request being sent right now.
    pub(crate) fn record_renew_sent(&mut self, now: Instant) {
        self.last_renew_sent_at = Some(now);
    }

    /// Applies an accepted LEASE_RESPONSE to the subject side. The new
    /// expiration is measured from when the request was sent, and is
    /// monotonic non-decreasing while the side stays Active. Returns false
    /// if the subject side is not in a state that can accept a renewal.
    pub(crate) fn apply_response(
        &mut self,
        accepted: Duration,
        now: Instant,
    ) -> bool {
        if self.subject_state != OneWayState::Active {
            return false;
        }

        // the accepted value is the monitor's in-force max; recording it as
        // the remote's request keeps both sides' duration() in agreement
        self.remote_requested = Some(accepted);

        let base = self.last_renew_sent_at.unwrap_or(now);
        let expire = base + accepted;
        self.subject_expire_time = Some(
            self.subject_expire_time.map_or(expire, |e| e.max(expire)),
        );
        self.renew_retry_cnt = 0;
        self.indirect_cnt = 0;
        self.first_indirect_at = None;
        true
    }

    /// Applies an incoming LEASE_REQUEST to the monitor side: records the
    /// remote's requested timing values (widening the in-force values where
    /// larger) and refreshes the monitor deadline. A request arriving while
    /// the monitor side is Expired revives it (the remote was merely slow).
    /// Returns the accepted (in-force) duration to reply with.
    pub(crate) fn apply_request(
        &mut self,
        requested: Duration,
        remote_suspend: Duration,
        remote_arbitration: Duration,
        now: Instant,
    ) -> Duration {
        self.remote_requested = Some(requested);
        self.remote_suspend = Some(remote_suspend);
        self.remote_arbitration = Some(remote_arbitration);

        match self.monitor_state {
            OneWayState::Inactive | OneWayState::Expired => {
                self.monitor_state = OneWayState::Active;
            }
            OneWayState::Active => {}
            OneWayState::Failed => {
                // already declared failed; the peer will learn via the
                // failure lists, do not resurrect here
                return self.duration();
            }
        }

        let expire = now + self.duration();
        self.monitor_expire_time = Some(
            self.monitor_expire_time.map_or(expire, |e| e.max(expire)),
        );
        self.duration()
    }

    /// Subject timer fired with no renewal: Active -> Expired, and the
    /// failure deadline is armed one suspend window out.
    pub(crate) fn expire_subject(&mut self, now: Instant) -> bool {
        if self.subject_state != OneWayState::Active {
            return false;
        }
        self.subject_state = OneWayState::Expired;
        self.subject_fail_time = Some(now + self.suspend_duration());
        true
    }

    /// Suspend window lapsed after subject expiry: Expired -> Failed.
    pub(crate) fn fail_subject(&mut self) -> bool {
        if self.subject_state != OneWayState::Expired {
            return false;
        }
        self.subject_state = OneWayState::Failed;
        true
    }

    /// Monitor timer fired with no renewal received: Active -> Expired.
    pub(crate) fn expire_monitor(&mut self) -> bool {
        if self.monitor_state != OneWayState::Active {
            return false;
        }
        self.monitor_state = OneWayState::Expired;
        true
    }

    /// Pre-arbitration ping answered: the remote was slow, not dead.
    /// Expired -> Active with a fresh deadline.
    pub(crate) fn revive_monitor(&mut self, now: Instant) -> bool {
        if self.monitor_state != OneWayState::Expired {
            return false;
        }
        self.monitor_state = OneWayState::Active;
        let expire = now + self.duration();
        self.monitor_expire_time = Some(
            self.monitor_expire_time.map_or(expire, |e| e.max(expire)),
        );
        true
    }

    /// Subject side declared failed from outside (remote monitor failure
    /// list, or a rejected renewal). Active/Expired -> Failed; a side that
    /// already settled locally is left alone so the failure callback fires
    /// at most once.
    pub(crate) fn fail_subject_declared(&mut self) -> bool {
        if self.subject_state != OneWayState::Active
            && self.subject_state != OneWayState::Expired
        {
            return false;
        }
        self.subject_state = OneWayState::Failed;
        true
    }

    /// Remote declared failed (no ping, arbitration lost or unavailable).
    pub(crate) fn fail_monitor(&mut self) -> bool {
        if self.monitor_state != OneWayState::Expired
            && self.monitor_state != OneWayState::Active
        {
            return false;
        }
        self.monitor_state = OneWayState::Failed;
        true
    }

    /// Explicit termination: both sides to Inactive, deadlines cleared.
    pub(crate) fn terminate(&mut self) {
        self.subject_state = OneWayState::Inactive;
        self.monitor_state = OneWayState::Inactive;
        self.subject_expire_time = None;
        self.subject_fail_time = None;
        self.monitor_expire_time = None;
        self.last_renew_sent_at = None;
        self.renew_retry_cnt = 0;
    }

    /// True when both sides are Inactive, i.e. destroyable.
    pub(crate) fn is_terminal(&self) -> bool {
        self.subject_state == OneWayState::Inactive
            && self.monitor_state == OneWayState::Inactive
    }

    /// Remaining subject-side TTL in milliseconds; negative if already
    /// expired, zero if the side never armed.
    pub(crate) fn subject_ttl_ms(&self, now: Instant) -> i64 {
        self.subject_expire_time.map_or(0, |e| ttl_ms(now, e))
    }

    /// Remaining monitor-side TTL in milliseconds.
    pub(crate) fn monitor_ttl_ms(&self, now: Instant) -> i64 {
        self.monitor_expire_time.map_or(0, |e| ttl_ms(now, e))
    }

    /// When the next renew request should go out: a fraction of the duration
    /// window before the subject expiration.
    pub(crate) fn renew_at(&self, begin_ratio: u32) -> Option<Instant> {
        debug_assert!(begin_ratio > 0);
        self.subject_expire_time
            .map(|e| e - self.duration() / begin_ratio)
    }

    /// Logging tuple used on every state transition.
    pub(crate) fn state_tag(&self) -> String {
        format!(
            "[{} sub={:?} mon={:?} inst={}]",
            self.id, self.subject_state, self.monitor_state, self.lease_instance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel() -> LeaseRelationship {
        LeaseRelationship::new(
            LeaseRelationshipId::new("fed/A", "fed/B"),
            DurationType::Regular,
            Duration::from_millis(1000),
            Duration::from_millis(200),
            Duration::from_millis(3000),
        )
    }

    #[tokio::test]
    async fn establish_idempotent() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        assert!(!r.establish(now));
        assert_eq!(r.subject_state, OneWayState::Active);
        assert_eq!(r.monitor_state, OneWayState::Active);
        let expire = r.subject_expire_time.unwrap();
        let inst = r.lease_instance;
        // second establish reports already-active and resets nothing
        assert!(r.establish(now + Duration::from_millis(500)));
        assert_eq!(r.subject_expire_time.unwrap(), expire);
        assert_eq!(r.lease_instance, inst);
    }

    #[tokio::test]
    async fn duration_widens_then_narrows_on_agreement() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        assert_eq!(r.duration(), Duration::from_millis(1000));

        // remote asks for more: widen immediately
        let accepted = r.apply_request(
            Duration::from_millis(3000),
            Duration::from_millis(200),
            Duration::from_millis(3000),
            now,
        );
        assert_eq!(accepted, Duration::from_millis(3000));
        assert_eq!(r.duration(), Duration::from_millis(3000));

        // local admin shrink alone does not narrow the in-force value
        r.local_requested = Duration::from_millis(500);
        assert_eq!(r.duration(), Duration::from_millis(3000));

        // once the peer's recorded request also shrinks, narrowing applies
        r.apply_request(
            Duration::from_millis(800),
            Duration::from_millis(200),
            Duration::from_millis(3000),
            now,
        );
        assert_eq!(r.duration(), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn subject_expire_monotonic() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        r.establish(now);
        let first = r.subject_expire_time.unwrap();

        // a response measured from an older send time never moves the
        // deadline backward
        r.record_renew_sent(now - Duration::from_millis(900));
        assert!(r.apply_response(Duration::from_millis(1000), now));
        assert_eq!(r.subject_expire_time.unwrap(), first);

        // a fresh renewal extends it
        r.record_renew_sent(now + Duration::from_millis(400));
        assert!(r.apply_response(Duration::from_millis(1000), now));
        assert!(r.subject_expire_time.unwrap() > first);
    }

    #[tokio::test]
    async fn expiry_walk_to_failed() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        r.establish(now);

        let later = now + Duration::from_millis(1100);
        assert!(r.expire_subject(later));
        assert_eq!(r.subject_state, OneWayState::Expired);
        assert_eq!(
            r.subject_fail_time.unwrap(),
            later + Duration::from_millis(200)
        );
        // double fire is a no-op
        assert!(!r.expire_subject(later));
        assert!(r.fail_subject());
        assert!(!r.fail_subject());
        assert_eq!(r.subject_state, OneWayState::Failed);
    }

    #[tokio::test]
    async fn declared_failure_settles_once() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        r.establish(now);
        assert!(r.fail_subject_declared());
        assert_eq!(r.subject_state, OneWayState::Failed);
        // a second declaration finds the side settled
        assert!(!r.fail_subject_declared());
        r.terminate();
        assert!(!r.fail_subject_declared());
    }

    #[tokio::test]
    async fn monitor_revive_on_late_renewal() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        r.apply_request(
            Duration::from_millis(1000),
            Duration::from_millis(200),
            Duration::from_millis(3000),
            now,
        );
        assert_eq!(r.monitor_state, OneWayState::Active);

        assert!(r.expire_monitor());
        assert_eq!(r.monitor_state, OneWayState::Expired);

        // a late request while expired revives the monitor side
        r.apply_request(
            Duration::from_millis(1000),
            Duration::from_millis(200),
            Duration::from_millis(3000),
            now + Duration::from_millis(1200),
        );
        assert_eq!(r.monitor_state, OneWayState::Active);

        // but not once failed
        assert!(r.expire_monitor());
        assert!(r.fail_monitor());
        r.apply_request(
            Duration::from_millis(1000),
            Duration::from_millis(200),
            Duration::from_millis(3000),
            now + Duration::from_millis(2000),
        );
        assert_eq!(r.monitor_state, OneWayState::Failed);
    }

    #[tokio::test]
    async fn terminate_clears_deadlines() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        r.establish(now);
        assert!(!r.is_terminal());
        r.terminate();
        assert!(r.is_terminal());
        assert_eq!(r.subject_expire_time, None);
        assert_eq!(r.monitor_expire_time, None);
        assert_eq!(r.subject_fail_time, None);
    }

    #[tokio::test]
    async fn ttl_signs() {
        tokio::time::pause();
        let mut r = rel();
        let now = Instant::now();
        r.establish(now);
        assert_eq!(r.subject_ttl_ms(now), 1000);
        assert!(r.subject_ttl_ms(now + Duration::from_millis(1500)) < 0);
        assert_eq!(r.monitor_ttl_ms(now), 1000);
    }
}
