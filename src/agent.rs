//! Public lease agent handle.
//!
//! A `LeaseAgent` owns one logic task and one transport, and exposes the
//! leasing API as async methods. Every call is a notice to the logic task
//! with a oneshot reply, so all state transitions stay serialized on that
//! task; only the application expiration query is answered synchronously
//! from a published snapshot.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{DurationType, LeaseConfig, LeaseDurations};
use crate::engine::{
    AppEventReceiver, AppHandle, AppStatusView, EngineNotice, LeaseAgentLogicTask,
    LeaseHandle,
};
use crate::protocol::AgentInstance;
use crate::transport::LeaseTransport;
use crate::utils::{VigilError, ME};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// A running lease agent bound to one listen endpoint.
pub struct LeaseAgent {
    endpoint: String,
    instance: AgentInstance,

    /// Bounded wait applied to immediate unregisters.
    app_drain_timeout: Duration,

    tx_notice: mpsc::UnboundedSender<EngineNotice>,
    app_views: flashmap::ReadHandle<AppHandle, AppStatusView>,

    _transport: LeaseTransport,
    _logic_handle: JoinHandle<()>,
}

impl LeaseAgent {
    /// Creates a lease agent: parses config, binds the transport on the
    /// given endpoint, and spawns the logic task.
    pub async fn new_and_setup(
        endpoint: &str,
        config_str: Option<&str>,
    ) -> Result<Self, VigilError> {
        let _ = ME.set(endpoint.to_string());
        let config = LeaseConfig::from_toml(config_str)?;
        let app_drain_timeout =
            Duration::from_millis(config.app_drain_timeout_ms);

        let (mut task, tx_notice, rx_action, app_views) =
            LeaseAgentLogicTask::new(endpoint.to_string(), config);
        let instance = task.agent_instance();

        let transport =
            LeaseTransport::new_and_setup(endpoint, tx_notice.clone(), rx_action)
                .await?;
        let logic_handle = tokio::spawn(async move { task.run().await });

        pf_info!("lease agent up, instance {}", instance);
        Ok(LeaseAgent {
            endpoint: endpoint.to_string(),
            instance,
            app_drain_timeout,
            tx_notice,
            app_views,
            _transport: transport,
            _logic_handle: logic_handle,
        })
    }

    pub fn local_endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn agent_instance(&self) -> AgentInstance {
        self.instance
    }

    fn send_notice(&self, notice: EngineNotice) -> Result<(), VigilError> {
        self.tx_notice
            .send(notice)
            .map_err(|_| VigilError::msg("lease agent logic task has exited"))
    }

    /// Registers a leasing application under a unique identifier, returning
    /// its handle and the receiver its lease events arrive on.
    pub async fn register_leasing_application(
        &self,
        name: &str,
        is_arbitration_enabled: bool,
        expiry_timeout_ms: u64,
    ) -> Result<(AppHandle, AppEventReceiver), VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::Register {
            name: name.to_string(),
            is_arbitration_enabled,
            expiry_timeout_ms,
            reply,
        })?;
        rx.await?
    }

    /// Unregisters a leasing application. With `is_delayed` false this waits
    /// (bounded) until every event delivered for the application has been
    /// dropped by its consumer; after it returns no callback for the handle
    /// fires anymore. Exceeding the drain timeout is a fatal assertion.
    /// With `is_delayed` true the call returns immediately and destruction
    /// happens once the application's leases have drained naturally.
    pub async fn unregister_leasing_application(
        &self,
        handle: AppHandle,
        is_delayed: bool,
    ) -> Result<(), VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::Unregister {
            handle,
            is_delayed,
            reply,
        })?;
        let drain = rx.await??;

        if let Some(drain) = drain {
            let deadline = Instant::now() + self.app_drain_timeout;
            while Arc::strong_count(&drain) > 1 {
                // invariant: callbacks must drain; a consumer sitting on
                // undropped events past the timeout is unrecoverable
                assert!(
                    Instant::now() < deadline,
                    "leasing application events failed to drain within {:?}",
                    self.app_drain_timeout
                );
                time::sleep(Duration::from_millis(10)).await;
            }
        }
        Ok(())
    }

    /// Establishes (or idempotently re-establishes) a lease relationship
    /// with a remote application. Returns the lease handle and whether the
    /// relationship was already established.
    pub async fn establish_lease(
        &self,
        handle: AppHandle,
        remote_app: &str,
        remote_endpoint: &str,
        remote_instance_hint: AgentInstance,
        duration_kind: DurationType,
    ) -> Result<(LeaseHandle, bool), VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::Establish {
            handle,
            remote_app: remote_app.to_string(),
            remote_endpoint: remote_endpoint.to_string(),
            remote_instance_hint,
            duration_kind,
            reply,
        })?;
        rx.await?
    }

    /// Terminates one lease relationship. Returns false for an unknown or
    /// foreign lease handle, or when `remote_app` does not name the lease's
    /// remote application.
    pub async fn terminate_lease(
        &self,
        handle: AppHandle,
        lease: LeaseHandle,
        remote_app: &str,
    ) -> Result<bool, VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::Terminate {
            handle,
            lease,
            remote_app: remote_app.to_string(),
            reply,
        })?;
        Ok(rx.await?)
    }

    /// Updates the configured lease durations for future negotiations.
    /// In-force durations widen immediately on the next renewal; they narrow
    /// only once both sides' recorded requests have shrunk.
    pub async fn update_lease_duration(
        &self,
        durations: LeaseDurations,
    ) -> Result<bool, VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::UpdateDuration { durations, reply })?;
        Ok(rx.await?)
    }

    /// Remaining (monitor TTL, subject TTL) in milliseconds for the lease
    /// relationship with the given remote application. Values are negative
    /// once past their deadline.
    pub async fn get_remote_lease_expiration_time(
        &self,
        handle: AppHandle,
        remote_app: &str,
    ) -> Result<(i64, i64), VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::GetRemoteExpiration {
            handle,
            remote_app: remote_app.to_string(),
            reply,
        })?;
        rx.await?
    }

    /// The in-force (negotiated) lease duration with a remote application.
    pub async fn query_lease_duration(
        &self,
        handle: AppHandle,
        remote_app: &str,
    ) -> Result<i64, VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::QueryDuration {
            handle,
            remote_app: remote_app.to_string(),
            reply,
        })?;
        rx.await?
    }

    /// Submits an arbitrator verdict for a pending arbitration. Returns
    /// false if no matching arbitration is pending (stale verdicts are
    /// ignored safely).
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_arbitration(
        &self,
        handle: AppHandle,
        remote_endpoint: &str,
        remote_instance: AgentInstance,
        local_ttl_ms: i64,
        remote_ttl_ms: i64,
        is_delayed: bool,
    ) -> Result<bool, VigilError> {
        let (reply, rx) = oneshot::channel();
        self.send_notice(EngineNotice::CompleteArbitration {
            handle,
            remote_endpoint: remote_endpoint.to_string(),
            remote_instance,
            local_ttl_ms,
            remote_ttl_ms,
            is_delayed,
            reply,
        })?;
        Ok(rx.await?)
    }

    /// Remaining TTL of a leasing application in milliseconds, clamped to
    /// `[0, requested_ttl_ms]` while the application is closing, plus the
    /// wall-clock observation time in epoch milliseconds. Answered from a
    /// published snapshot without a logic task round trip.
    pub fn get_leasing_application_expiration_time(
        &self,
        handle: AppHandle,
        requested_ttl_ms: i64,
    ) -> Result<(i64, i64), VigilError> {
        let guard = self.app_views.guard();
        let Some(view) = guard.get(&handle) else {
            return Err(VigilError::msg(format!(
                "unknown application handle {}",
                handle
            )));
        };

        let now = Instant::now();
        let base = match view.min_subject_expire {
            Some(expire) => {
                if expire >= now {
                    expire.duration_since(now).as_millis() as i64
                } else {
                    -(now.duration_since(expire).as_millis() as i64)
                }
            }
            // no lease in force: the registration grace period applies
            None => view.expiry_timeout.as_millis() as i64,
        };
        let remaining = if view.is_closing {
            base.clamp(0, requested_ttl_ms.max(0))
        } else {
            base.min(requested_ttl_ms)
        };

        let observed_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok((remaining, observed_at_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LeaseEvent;
    use crate::protocol::TTL_MAX;

    // short timings so expiry/arbitration paths run within test budgets
    const TEST_CONFIG: &str = "lease_duration_ms = 500\n\
                               lease_duration_across_fd_ms = 600\n\
                               unresponsive_duration_ms = 1500\n\
                               suspend_duration_ms = 200\n\
                               arbitration_duration_ms = 5000\n\
                               renew_retry_interval_pct = 10\n\
                               pre_arbitration_ms = 150\n\
                               maintenance_interval_ms = 200\n\
                               retired_gc_delay_ms = 100\n\
                               app_drain_timeout_ms = 2000";

    async fn next_event(rx: &mut AppEventReceiver) -> LeaseEvent {
        time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for lease event")
            .expect("event channel closed")
            .event
    }

    /// Skips interleaved health reports, returning the next lease event.
    async fn next_lease_event(rx: &mut AppEventReceiver) -> LeaseEvent {
        loop {
            match next_event(rx).await {
                LeaseEvent::HealthReport { .. } => continue,
                event => return event,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn two_way_establish_and_renew() -> Result<(), VigilError> {
        let node_a = "127.0.0.1:42801";
        let node_b = "127.0.0.1:42802";
        let a = LeaseAgent::new_and_setup(node_a, Some(TEST_CONFIG)).await?;
        let b = LeaseAgent::new_and_setup(node_b, Some(TEST_CONFIG)).await?;

        let (ha, mut ea) =
            a.register_leasing_application("fed/A", false, 1000).await?;
        let (hb, mut eb) =
            b.register_leasing_application("fed/B", false, 1000).await?;

        let (_, already) = a
            .establish_lease(ha, "fed/B", node_b, 0, DurationType::Regular)
            .await?;
        assert!(!already);
        b.establish_lease(hb, "fed/A", node_a, 0, DurationType::Regular)
            .await?;

        assert_eq!(
            next_lease_event(&mut ea).await,
            LeaseEvent::LeaseEstablished {
                remote_app: "fed/B".into(),
                remote_endpoint: node_b.into(),
            }
        );
        assert_eq!(
            next_lease_event(&mut eb).await,
            LeaseEvent::LeaseEstablished {
                remote_app: "fed/A".into(),
                remote_endpoint: node_a.into(),
            }
        );

        // survive several renewal cycles past the initial duration
        time::sleep(Duration::from_millis(1600)).await;
        let (monitor_ttl, subject_ttl) =
            a.get_remote_lease_expiration_time(ha, "fed/B").await?;
        assert!(monitor_ttl > 0, "monitor ttl {}", monitor_ttl);
        assert!(subject_ttl > 0, "subject ttl {}", subject_ttl);
        assert_eq!(a.query_lease_duration(ha, "fed/B").await?, 500);
        assert!(ea.try_recv().is_err(), "unexpected event on node A");

        let (remaining, _) =
            a.get_leasing_application_expiration_time(ha, 10_000)?;
        assert!(remaining > 0 && remaining <= 500);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn unresponsive_peer_fails_lease() -> Result<(), VigilError> {
        let node_a = "127.0.0.1:42803";
        let phantom = "127.0.0.1:42804"; // nothing listens here
        let a = LeaseAgent::new_and_setup(node_a, Some(TEST_CONFIG)).await?;
        let (ha, mut ea) =
            a.register_leasing_application("fed/A", false, 1000).await?;
        a.establish_lease(ha, "fed/B", phantom, 0, DurationType::Regular)
            .await?;

        // with no arbitrator registered, the expiry walk ends in both a
        // local failure and an unarbitrated remote failure declaration
        let mut saw_lease_failed = false;
        let mut saw_remote_expired = false;
        while !(saw_lease_failed && saw_remote_expired) {
            match next_lease_event(&mut ea).await {
                LeaseEvent::LeaseFailed => saw_lease_failed = true,
                LeaseEvent::RemoteExpired { remote_app, .. } => {
                    assert_eq!(remote_app, "fed/B");
                    saw_remote_expired = true;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn arbitration_round_trip() -> Result<(), VigilError> {
        let node_a = "127.0.0.1:42805";
        let phantom = "127.0.0.1:42806";
        let a = LeaseAgent::new_and_setup(node_a, Some(TEST_CONFIG)).await?;
        let (ha, mut ea) =
            a.register_leasing_application("fed/A", true, 1000).await?;
        a.establish_lease(ha, "fed/B", phantom, 0, DurationType::Regular)
            .await?;

        // the silent peer drives the monitor side into arbitration
        let remote_instance = loop {
            match next_lease_event(&mut ea).await {
                LeaseEvent::ArbitrateRequest {
                    remote_endpoint,
                    remote_instance,
                    remote_app,
                    ..
                } => {
                    assert_eq!(remote_endpoint, phantom);
                    assert_eq!(remote_app, "fed/B");
                    break remote_instance;
                }
                LeaseEvent::LeaseFailed => continue, // own subject lapsed too
                other => panic!("unexpected event {:?}", other),
            }
        };

        let done = a
            .complete_arbitration(ha, phantom, remote_instance, TTL_MAX, 0, false)
            .await?;
        assert!(done);

        loop {
            match next_lease_event(&mut ea).await {
                LeaseEvent::RemoteExpired { remote_app, .. } => {
                    assert_eq!(remote_app, "fed/B");
                    break;
                }
                LeaseEvent::LeaseFailed => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }

        // a duplicate verdict is refused, not double-applied
        let done = a
            .complete_arbitration(ha, phantom, remote_instance, TTL_MAX, 0, false)
            .await?;
        assert!(!done);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn terminate_cleans_up_both_sides() -> Result<(), VigilError> {
        let node_a = "127.0.0.1:42807";
        let node_b = "127.0.0.1:42808";
        let a = LeaseAgent::new_and_setup(node_a, Some(TEST_CONFIG)).await?;
        let b = LeaseAgent::new_and_setup(node_b, Some(TEST_CONFIG)).await?;
        let (ha, mut ea) =
            a.register_leasing_application("fed/A", false, 1000).await?;
        let (hb, mut eb) =
            b.register_leasing_application("fed/B", false, 1000).await?;

        let (lease, _) = a
            .establish_lease(ha, "fed/B", node_b, 0, DurationType::Regular)
            .await?;
        b.establish_lease(hb, "fed/A", node_a, 0, DurationType::Regular)
            .await?;
        next_lease_event(&mut ea).await;
        next_lease_event(&mut eb).await;

        // a mismatched remote application name is refused
        assert!(!a.terminate_lease(ha, lease, "fed/C").await?);
        assert!(a.terminate_lease(ha, lease, "fed/B").await?);
        // terminating an already-gone handle reports false
        assert!(!a.terminate_lease(ha, lease, "fed/B").await?);

        // the relationship disappears from both sides within a few sweeps
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let gone_a = a
                .get_remote_lease_expiration_time(ha, "fed/B")
                .await
                .is_err();
            let gone_b = b
                .get_remote_lease_expiration_time(hb, "fed/A")
                .await
                .is_err();
            if gone_a && gone_b {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "terminated relationship not reclaimed"
            );
            time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn unregister_waits_for_drain() -> Result<(), VigilError> {
        let node_a = "127.0.0.1:42809";
        let a = LeaseAgent::new_and_setup(node_a, Some(TEST_CONFIG)).await?;
        let (ha, ea) =
            a.register_leasing_application("fed/A", false, 1000).await?;

        // dropping the receiver releases all delivered event guards
        drop(ea);
        a.unregister_leasing_application(ha, false).await?;

        // the handle is gone afterwards
        assert!(a
            .get_remote_lease_expiration_time(ha, "fed/B")
            .await
            .is_err());
        // and the identifier becomes free for re-registration
        a.register_leasing_application("fed/A", false, 1000).await?;
        Ok(())
    }
}
