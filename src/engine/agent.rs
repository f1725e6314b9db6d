//! The lease agent logic task.
//!
//! All lease state lives on this single task. API calls from the public
//! wrapper, timer fires, and decoded wire messages all arrive as notices on
//! one channel; outgoing messages leave as actions on another. Timer fires
//! carry a snapshot of the state they were armed under and are revalidated
//! against current state before acting, so a fire that raced a renewal or a
//! termination is simply ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{DurationType, LeaseConfig, LeaseDurations};
use crate::engine::apps::{
    AppEventReceiver, AppHandle, AppStatusView, LeaseEvent, LeasingApplication,
    MAX_ID_LEN,
};
use crate::engine::arbitration::{
    decide_arbitration, ArbitrationOutcome, PendingArbitration,
};
use crate::engine::maintenance::{sweep_apps, sweep_remotes};
use crate::engine::relationship::{ttl_ms, LeaseRelationship, OneWayState};
use crate::engine::remote::{IncomingVerdict, RemoteLeaseAgent};
use crate::protocol::{
    AgentInstance, LeaseHeader, LeaseInstance, LeaseMessage, LeaseMessageType,
    LeaseRelationshipId, MessageId, LEASE_PROTOCOL_MAJOR_VERSION,
    LEASE_PROTOCOL_MINOR_VERSION, TTL_MAX,
};
use crate::utils::{Timer, VigilError};

use rand::Rng;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Opaque handle identifying one established lease of an application.
pub type LeaseHandle = u64;

/// Overall health of the lease agent. `Failed` is sticky.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AgentState {
    /// Normal operation.
    Open,
    /// At least one subject lease has expired and sits in its suspend
    /// window; the agent may still recover.
    Suspended,
    /// A subject lease failed or an arbitration was lost; the hosting
    /// process is expected to go down.
    Failed,
}

/// Notices consumed by the logic task: API calls (with reply channels),
/// decoded incoming messages, and timer fires carrying armed-time snapshots.
pub(crate) enum EngineNotice {
    Register {
        name: String,
        is_arbitration_enabled: bool,
        expiry_timeout_ms: u64,
        reply: oneshot::Sender<Result<(AppHandle, AppEventReceiver), VigilError>>,
    },
    Unregister {
        handle: AppHandle,
        is_delayed: bool,
        reply: oneshot::Sender<Result<Option<Arc<()>>, VigilError>>,
    },
    Establish {
        handle: AppHandle,
        remote_app: String,
        remote_endpoint: String,
        remote_instance_hint: AgentInstance,
        duration_kind: DurationType,
        reply: oneshot::Sender<Result<(LeaseHandle, bool), VigilError>>,
    },
    Terminate {
        handle: AppHandle,
        lease: LeaseHandle,
        remote_app: String,
        reply: oneshot::Sender<bool>,
    },
    UpdateDuration {
        durations: LeaseDurations,
        reply: oneshot::Sender<bool>,
    },
    GetRemoteExpiration {
        handle: AppHandle,
        remote_app: String,
        reply: oneshot::Sender<Result<(i64, i64), VigilError>>,
    },
    QueryDuration {
        handle: AppHandle,
        remote_app: String,
        reply: oneshot::Sender<Result<i64, VigilError>>,
    },
    CompleteArbitration {
        handle: AppHandle,
        remote_endpoint: String,
        remote_instance: AgentInstance,
        local_ttl_ms: i64,
        remote_ttl_ms: i64,
        is_delayed: bool,
        reply: oneshot::Sender<bool>,
    },

    /// A decoded message arrived from the transport.
    RecvMessage { msg: LeaseMessage },

    // timer fires; each carries the snapshot it was armed under
    RenewTimeout {
        endpoint: String,
        rel_id: LeaseRelationshipId,
        lease_instance: LeaseInstance,
    },
    SubjectExpireTimeout {
        endpoint: String,
        rel_id: LeaseRelationshipId,
        lease_instance: LeaseInstance,
        expire_at: Instant,
    },
    SubjectFailTimeout {
        endpoint: String,
        rel_id: LeaseRelationshipId,
        lease_instance: LeaseInstance,
    },
    MonitorExpireTimeout {
        endpoint: String,
        rel_id: LeaseRelationshipId,
        lease_instance: LeaseInstance,
        expire_at: Instant,
    },
    PreArbitrationTimeout {
        endpoint: String,
        rel_id: LeaseRelationshipId,
        lease_instance: LeaseInstance,
    },
    ArbitrationTimeout {
        endpoint: String,
        rel_id: LeaseRelationshipId,
    },
    DelayedTermination {
        endpoint: String,
        rel_id: LeaseRelationshipId,
    },
    PingRetryTimeout { endpoint: String },
}

/// Actions produced by the logic task for the transport layer.
#[derive(Debug)]
pub(crate) enum EngineAction {
    SendMessage { endpoint: String, msg: LeaseMessage },
}

/// The lease agent logic task. Owns every remote lease agent, relationship,
/// application registration, and pending arbitration of this node.
pub(crate) struct LeaseAgentLogicTask {
    /// Canonical listen endpoint of this agent.
    endpoint: String,

    /// Clock-derived incarnation identifier of this agent.
    instance: AgentInstance,

    state: AgentState,
    config: LeaseConfig,

    apps: HashMap<String, LeasingApplication>,
    app_names: HashMap<AppHandle, String>,
    next_app_handle: AppHandle,

    /// Active remote lease agents, one per peer endpoint.
    remotes: HashMap<String, RemoteLeaseAgent>,

    /// Superseded/terminated agents draining until deallocatable.
    retired: Vec<RemoteLeaseAgent>,

    lease_handles: HashMap<LeaseHandle, (String, LeaseRelationshipId)>,
    next_lease_handle: LeaseHandle,

    /// In-flight arbitrations keyed by remote endpoint.
    pending_arbitrations: HashMap<String, PendingArbitration>,

    next_message_id: MessageId,

    /// Published app status for the wrapper's synchronous queries, keyed by
    /// application handle.
    app_views: flashmap::WriteHandle<AppHandle, AppStatusView>,

    /// Cloned into timer callbacks so fires loop back as notices.
    tx_notice: mpsc::UnboundedSender<EngineNotice>,
    rx_notice: mpsc::UnboundedReceiver<EngineNotice>,
    tx_action: mpsc::UnboundedSender<EngineAction>,
}

impl LeaseAgentLogicTask {
    #[allow(clippy::type_complexity)]
    pub(crate) fn new(
        endpoint: String,
        config: LeaseConfig,
    ) -> (
        Self,
        mpsc::UnboundedSender<EngineNotice>,
        mpsc::UnboundedReceiver<EngineAction>,
        flashmap::ReadHandle<AppHandle, AppStatusView>,
    ) {
        let (tx_notice, rx_notice) = mpsc::unbounded_channel();
        let (tx_action, rx_action) = mpsc::unbounded_channel();
        let (views_write, views_read) = flashmap::new();

        // clock-derived so a restarted agent always carries a higher instance
        let instance = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(1);

        let me = LeaseAgentLogicTask {
            endpoint,
            instance,
            state: AgentState::Open,
            config,
            apps: HashMap::new(),
            app_names: HashMap::new(),
            next_app_handle: 0,
            remotes: HashMap::new(),
            retired: Vec::new(),
            lease_handles: HashMap::new(),
            next_lease_handle: 0,
            pending_arbitrations: HashMap::new(),
            next_message_id: 0,
            app_views: views_write,
            tx_notice: tx_notice.clone(),
            rx_notice,
            tx_action,
        };
        (me, tx_notice, rx_action, views_read)
    }

    pub(crate) fn agent_instance(&self) -> AgentInstance {
        self.instance
    }

    /// Main loop: notices in, actions out, plus the periodic maintenance
    /// sweep. Exits when all notice senders have been dropped.
    pub(crate) async fn run(&mut self) {
        pf_debug!("lease agent logic task spawned");

        let mut maintenance = time::interval(Duration::from_millis(
            self.config.maintenance_interval_ms,
        ));
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                notice = self.rx_notice.recv() => {
                    match notice {
                        Some(notice) => {
                            if let Err(e) = self.handle_notice(notice) {
                                pf_error!("error handling notice: {}", e);
                            }
                        }
                        None => break,
                    }
                },

                _ = maintenance.tick() => {
                    self.handle_maintenance();
                },
            }
        }

        pf_debug!("lease agent logic task exited");
    }

    pub(crate) fn handle_notice(
        &mut self,
        notice: EngineNotice,
    ) -> Result<(), VigilError> {
        match notice {
            EngineNotice::Register {
                name,
                is_arbitration_enabled,
                expiry_timeout_ms,
                reply,
            } => {
                let result = self.handle_register(
                    name,
                    is_arbitration_enabled,
                    expiry_timeout_ms,
                );
                if reply.send(result).is_err() {
                    pf_warn!("register reply receiver dropped");
                }
            }
            EngineNotice::Unregister {
                handle,
                is_delayed,
                reply,
            } => {
                let result = self.handle_unregister(handle, is_delayed);
                if reply.send(result).is_err() {
                    pf_warn!("unregister reply receiver dropped");
                }
            }
            EngineNotice::Establish {
                handle,
                remote_app,
                remote_endpoint,
                remote_instance_hint,
                duration_kind,
                reply,
            } => {
                let result = self.handle_establish(
                    handle,
                    remote_app,
                    remote_endpoint,
                    remote_instance_hint,
                    duration_kind,
                );
                if reply.send(result).is_err() {
                    pf_warn!("establish reply receiver dropped");
                }
            }
            EngineNotice::Terminate {
                handle,
                lease,
                remote_app,
                reply,
            } => {
                let done = self.handle_terminate(handle, lease, &remote_app);
                let _ = reply.send(done);
            }
            EngineNotice::UpdateDuration { durations, reply } => {
                let done = self.handle_update_duration(durations);
                let _ = reply.send(done);
            }
            EngineNotice::GetRemoteExpiration {
                handle,
                remote_app,
                reply,
            } => {
                let result = self.handle_get_remote_expiration(handle, &remote_app);
                let _ = reply.send(result);
            }
            EngineNotice::QueryDuration {
                handle,
                remote_app,
                reply,
            } => {
                let result = self.handle_query_duration(handle, &remote_app);
                let _ = reply.send(result);
            }
            EngineNotice::CompleteArbitration {
                handle,
                remote_endpoint,
                remote_instance,
                local_ttl_ms,
                remote_ttl_ms,
                is_delayed,
                reply,
            } => {
                let done = self.handle_complete_arbitration(
                    handle,
                    &remote_endpoint,
                    remote_instance,
                    local_ttl_ms,
                    remote_ttl_ms,
                    is_delayed,
                )?;
                let _ = reply.send(done);
            }

            EngineNotice::RecvMessage { msg } => {
                self.handle_recv_message(msg)?;
            }

            EngineNotice::RenewTimeout {
                endpoint,
                rel_id,
                lease_instance,
            } => {
                self.handle_renew_timeout(&endpoint, &rel_id, lease_instance)?;
            }
            EngineNotice::SubjectExpireTimeout {
                endpoint,
                rel_id,
                lease_instance,
                expire_at,
            } => {
                self.handle_subject_expire_timeout(
                    &endpoint,
                    &rel_id,
                    lease_instance,
                    expire_at,
                )?;
            }
            EngineNotice::SubjectFailTimeout {
                endpoint,
                rel_id,
                lease_instance,
            } => {
                self.handle_subject_fail_timeout(
                    &endpoint,
                    &rel_id,
                    lease_instance,
                )?;
            }
            EngineNotice::MonitorExpireTimeout {
                endpoint,
                rel_id,
                lease_instance,
                expire_at,
            } => {
                self.handle_monitor_expire_timeout(
                    &endpoint,
                    &rel_id,
                    lease_instance,
                    expire_at,
                )?;
            }
            EngineNotice::PreArbitrationTimeout {
                endpoint,
                rel_id,
                lease_instance,
            } => {
                self.handle_pre_arbitration_timeout(
                    &endpoint,
                    &rel_id,
                    lease_instance,
                )?;
            }
            EngineNotice::ArbitrationTimeout { endpoint, rel_id } => {
                self.handle_arbitration_timeout(&endpoint, &rel_id)?;
            }
            EngineNotice::DelayedTermination { endpoint, rel_id } => {
                self.handle_delayed_termination(&endpoint, &rel_id)?;
            }
            EngineNotice::PingRetryTimeout { endpoint } => {
                self.handle_ping_retry_timeout(&endpoint)?;
            }
        }
        Ok(())
    }

    /*
     * small shared helpers
     */

    fn base_header(
        &mut self,
        msg_type: LeaseMessageType,
        target_instance: AgentInstance,
    ) -> LeaseHeader {
        self.next_message_id += 1;
        LeaseHeader {
            msg_type,
            message_id: self.next_message_id,
            sender_endpoint: self.endpoint.clone(),
            sender_instance: self.instance,
            target_instance,
            lease_instance: 0,
            duration_ms: 0,
            expiration_ms: 0,
            suspend_duration_ms: 0,
            arbitration_duration_ms: 0,
            is_two_way_termination: false,
        }
    }

    fn send_to(&self, endpoint: &str, msg: LeaseMessage) {
        if let Err(e) = self.tx_action.send(EngineAction::SendMessage {
            endpoint: endpoint.into(),
            msg,
        }) {
            pf_error!("action channel closed: {}", e);
        }
    }

    fn deliver_to_app(&self, name: &str, event: LeaseEvent) {
        if let Some(app) = self.apps.get(name) {
            app.deliver(event);
        }
    }

    fn gc_delay(&self) -> Duration {
        Duration::from_millis(self.config.retired_gc_delay_ms)
    }

    /// Spawns a one-shot timer whose fire loops back as a notice built from
    /// the given constructor (capturing the armed-time snapshot).
    fn spawn_timer<F>(
        tx: &mpsc::UnboundedSender<EngineNotice>,
        deadline: Instant,
        make_notice: F,
    ) -> Result<Timer, VigilError>
    where
        F: Fn() -> EngineNotice + Send + Sync + 'static,
    {
        let tx = tx.clone();
        let timer = Timer::new(Some(Box::new(move || {
            let _ = tx.send(make_notice());
        })));
        let dur = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        timer.kickoff(dur)?;
        Ok(timer)
    }

    /// Sticky health state transitions, broadcast to every application.
    fn transition_state(&mut self, next: AgentState) {
        if self.state == next || self.state == AgentState::Failed {
            return;
        }
        pf_warn!("lease agent state {:?} -> {:?}", self.state, next);
        self.state = next;
        for app in self.apps.values() {
            app.deliver(LeaseEvent::HealthReport { state: next });
        }
    }

    /// Leaves Suspended once no subject lease sits expired anymore.
    fn maybe_recover_state(&mut self) {
        if self.state != AgentState::Suspended {
            return;
        }
        let any_expired = self
            .remotes
            .values()
            .flat_map(|rla| rla.relationships.values())
            .any(|rel| rel.subject_state == OneWayState::Expired);
        if !any_expired {
            self.transition_state(AgentState::Open);
        }
    }

    /// Re-publishes the wrapper-visible status snapshot of one application.
    /// Removal from the view happens where the application itself is removed.
    fn refresh_app_view(&mut self, name: &str) {
        let Some(app) = self.apps.get(name) else {
            return;
        };
        let min_expire = self
            .remotes
            .values()
            .flat_map(|rla| rla.relationships.values())
            .filter(|rel| {
                rel.id.local_app == name
                    && rel.subject_state == OneWayState::Active
            })
            .filter_map(|rel| rel.subject_expire_time)
            .min();
        let view = AppStatusView {
            is_closing: app.is_closing,
            expiry_timeout: app.expiry_timeout,
            min_subject_expire: min_expire,
        };
        let handle = app.handle;
        let mut guard = self.app_views.guard();
        guard.insert(handle, view);
    }

    /// Re-creates the renewal and expiration timers of one relationship to
    /// match its current state. Arbitration-stage timer slots are preserved.
    fn arm_timers_for(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
    ) -> Result<(), VigilError> {
        let ratio = self.config.renew_begin_ratio;
        let snapshot = {
            let Some(rla) = self.remotes.get(endpoint) else {
                return Ok(());
            };
            let Some(rel) = rla.relationships.get(rel_id) else {
                return Ok(());
            };
            (
                rel.subject_state,
                rel.monitor_state,
                rel.lease_instance,
                rel.renew_at(ratio),
                rel.subject_expire_time,
                rel.subject_fail_time,
                rel.monitor_expire_time,
            )
        };
        let (sub, mon, li, renew_at, sub_expire, sub_fail, mon_expire) = snapshot;

        let mut renew_timer = None;
        let mut sub_expire_timer = None;
        let mut sub_fail_timer = None;
        let mut mon_expire_timer = None;

        if sub == OneWayState::Active {
            if let Some(at) = renew_at {
                let (e, r) = (endpoint.to_string(), rel_id.clone());
                renew_timer =
                    Some(Self::spawn_timer(&self.tx_notice, at, move || {
                        EngineNotice::RenewTimeout {
                            endpoint: e.clone(),
                            rel_id: r.clone(),
                            lease_instance: li,
                        }
                    })?);
            }
            if let Some(at) = sub_expire {
                let (e, r) = (endpoint.to_string(), rel_id.clone());
                sub_expire_timer =
                    Some(Self::spawn_timer(&self.tx_notice, at, move || {
                        EngineNotice::SubjectExpireTimeout {
                            endpoint: e.clone(),
                            rel_id: r.clone(),
                            lease_instance: li,
                            expire_at: at,
                        }
                    })?);
            }
        }
        if sub == OneWayState::Expired {
            if let Some(at) = sub_fail {
                let (e, r) = (endpoint.to_string(), rel_id.clone());
                sub_fail_timer =
                    Some(Self::spawn_timer(&self.tx_notice, at, move || {
                        EngineNotice::SubjectFailTimeout {
                            endpoint: e.clone(),
                            rel_id: r.clone(),
                            lease_instance: li,
                        }
                    })?);
            }
        }
        if mon == OneWayState::Active {
            if let Some(at) = mon_expire {
                let (e, r) = (endpoint.to_string(), rel_id.clone());
                mon_expire_timer =
                    Some(Self::spawn_timer(&self.tx_notice, at, move || {
                        EngineNotice::MonitorExpireTimeout {
                            endpoint: e.clone(),
                            rel_id: r.clone(),
                            lease_instance: li,
                            expire_at: at,
                        }
                    })?);
            }
        }

        if let Some(rla) = self.remotes.get_mut(endpoint) {
            let slots = rla.timers.entry(rel_id.clone()).or_default();
            slots.renew = renew_timer;
            slots.subject_expire = sub_expire_timer;
            slots.subject_fail = sub_fail_timer;
            slots.monitor_expire = mon_expire_timer;
        }
        Ok(())
    }

    /*
     * API notice handlers
     */

    fn handle_register(
        &mut self,
        name: String,
        is_arbitration_enabled: bool,
        expiry_timeout_ms: u64,
    ) -> Result<(AppHandle, AppEventReceiver), VigilError> {
        if self.state == AgentState::Failed {
            return logged_err!("lease agent has failed");
        }
        if name.is_empty() || name.len() > MAX_ID_LEN {
            return logged_err!("invalid application identifier '{}'", name);
        }
        if expiry_timeout_ms == 0 {
            return logged_err!("expiry timeout must be positive");
        }
        if self.apps.contains_key(&name) {
            return logged_err!("application '{}' already registered", name);
        }

        self.next_app_handle += 1;
        let handle = self.next_app_handle;
        let (app, rx_events) = LeasingApplication::new(
            name.clone(),
            handle,
            is_arbitration_enabled,
            Duration::from_millis(expiry_timeout_ms),
            self.config.event_queue_cap,
        );
        self.apps.insert(name.clone(), app);
        self.app_names.insert(handle, name.clone());
        self.refresh_app_view(&name);

        pf_info!(
            "registered application '{}' handle {} arbitration {}",
            name,
            handle,
            is_arbitration_enabled
        );
        Ok((handle, rx_events))
    }

    /// Unregisters an application. For an immediate unregister all of its
    /// relationships are terminated and the returned drain guard lets the
    /// wrapper wait until no delivered event is still alive; a delayed
    /// unregister only marks the application closing and lets the sweep
    /// finish it once its leases drain.
    fn handle_unregister(
        &mut self,
        handle: AppHandle,
        is_delayed: bool,
    ) -> Result<Option<Arc<()>>, VigilError> {
        let Some(name) = self.app_names.get(&handle).cloned() else {
            return logged_err!("unknown application handle {}", handle);
        };

        if let Some(app) = self.apps.get_mut(&name) {
            app.is_closing = true;
            if is_delayed {
                app.is_delayed_unregister = true;
            }
        }

        if is_delayed {
            self.refresh_app_view(&name);
            pf_info!("delayed unregister of application '{}' queued", name);
            return Ok(None);
        }

        // tear down every relationship the application owns and tell peers
        let now = Instant::now();
        let gc_at = now + self.gc_delay();
        let mut outgoing: Vec<(String, AgentInstance, Vec<LeaseRelationshipId>, bool)> =
            Vec::new();
        for rla in self.remotes.values_mut() {
            let ids: Vec<LeaseRelationshipId> = rla
                .relationships
                .keys()
                .filter(|id| id.local_app == name)
                .cloned()
                .collect();
            if ids.is_empty() {
                continue;
            }
            for id in &ids {
                if let Some(rel) = rla.relationships.get_mut(id) {
                    rel.terminate();
                }
                if let Some(slots) = rla.timers.get_mut(id) {
                    slots.disarm_all();
                }
            }
            let two_way = rla.all_relationships_terminal();
            if two_way {
                rla.retire(gc_at);
            }
            outgoing.push((
                rla.endpoint.clone(),
                rla.remote_instance,
                ids,
                two_way,
            ));
        }
        for (endpoint, target, ids, two_way) in outgoing {
            let mut header =
                self.base_header(LeaseMessageType::LeaseRequest, target);
            header.is_two_way_termination = two_way;
            let mut msg = LeaseMessage::new(header);
            msg.lists.subject_terminated = ids.clone();
            msg.lists.monitor_terminated = ids;
            self.send_to(&endpoint, msg);
        }

        self.lease_handles.retain(|_, (_, id)| id.local_app != name);
        self.pending_arbitrations
            .retain(|_, pending| pending.rel_id.local_app != name);

        let drain = self.apps.remove(&name).map(|app| app.drain.clone());
        self.app_names.remove(&handle);
        let mut guard = self.app_views.guard();
        guard.remove(handle);
        drop(guard);

        pf_info!("unregistered application '{}'", name);
        Ok(drain)
    }

    fn handle_establish(
        &mut self,
        handle: AppHandle,
        remote_app: String,
        remote_endpoint: String,
        remote_instance_hint: AgentInstance,
        duration_kind: DurationType,
    ) -> Result<(LeaseHandle, bool), VigilError> {
        // a suspended agent has an expired subject lease of its own; taking
        // on new relationships before recovering would extend a guarantee it
        // may be unable to keep
        if self.state != AgentState::Open {
            return logged_err!("lease agent is {:?}", self.state);
        }
        let Some(name) = self.app_names.get(&handle).cloned() else {
            return logged_err!("unknown application handle {}", handle);
        };
        match self.apps.get(&name) {
            Some(app) if !app.is_closing => {}
            _ => return logged_err!("application '{}' is closing", name),
        }
        if remote_app.is_empty() || remote_app.len() > MAX_ID_LEN {
            return logged_err!("invalid remote application '{}'", remote_app);
        }
        if remote_endpoint.is_empty() || remote_endpoint.len() > MAX_ID_LEN {
            return logged_err!("invalid remote endpoint '{}'", remote_endpoint);
        }
        if remote_endpoint == self.endpoint && remote_app == name {
            return logged_err!("cannot establish a lease with self");
        }

        let now = Instant::now();
        let gc_at = now + self.gc_delay();

        // an establish carrying a higher advertised instance supersedes the
        // current remote lease agent for that endpoint
        if remote_instance_hint != 0 {
            let superseded = self
                .remotes
                .get(&remote_endpoint)
                .is_some_and(|rla| {
                    rla.remote_instance != 0
                        && remote_instance_hint > rla.remote_instance
                });
            if superseded {
                if let Some(mut old) = self.remotes.remove(&remote_endpoint) {
                    pf_info!(
                        "superseding remote lease agent {} (instance {} -> {})",
                        remote_endpoint,
                        old.remote_instance,
                        remote_instance_hint
                    );
                    old.retire(gc_at);
                    self.retired.push(old);
                }
            }
        }

        let config = self.config.clone();
        let rla = self
            .remotes
            .entry(remote_endpoint.clone())
            .or_insert_with(|| {
                RemoteLeaseAgent::new(
                    remote_endpoint.clone(),
                    remote_instance_hint,
                )
            });
        let rel_id = LeaseRelationshipId::new(name.clone(), remote_app);
        let rel = rla
            .relationships
            .entry(rel_id.clone())
            .or_insert_with(|| {
                LeaseRelationship::new(
                    rel_id.clone(),
                    duration_kind,
                    config.duration_for(duration_kind),
                    config.suspend_duration(),
                    config.arbitration_duration(),
                )
            });

        let was_established = rel.establish(now);
        rel.record_renew_sent(now);
        let lease_instance = rel.lease_instance;
        let dur = rel.duration();
        let sus = rel.suspend_duration();
        let arb = rel.arbitration_duration();
        let target = rla.remote_instance;
        if !was_established {
            pf_info!("establishing lease {}", rel.state_tag());
        }

        self.arm_timers_for(&remote_endpoint, &rel_id)?;

        let mut header = self.base_header(LeaseMessageType::LeaseRequest, target);
        header.lease_instance = lease_instance;
        header.duration_ms = dur.as_millis() as i64;
        header.expiration_ms = dur.as_millis() as i64;
        header.suspend_duration_ms = sus.as_millis() as i64;
        header.arbitration_duration_ms = arb.as_millis() as i64;
        let mut msg = LeaseMessage::new(header);
        msg.lists.subject_pending.push(rel_id.clone());
        self.send_to(&remote_endpoint, msg);

        // reuse the existing handle for an idempotent re-establish
        let existing = self
            .lease_handles
            .iter()
            .find(|(_, (ep, id))| *ep == remote_endpoint && *id == rel_id)
            .map(|(lh, _)| *lh);
        let lease_handle = match existing {
            Some(lh) => lh,
            None => {
                self.next_lease_handle += 1;
                self.lease_handles.insert(
                    self.next_lease_handle,
                    (remote_endpoint.clone(), rel_id.clone()),
                );
                self.next_lease_handle
            }
        };

        self.refresh_app_view(&name);
        Ok((lease_handle, was_established))
    }

    fn handle_terminate(
        &mut self,
        handle: AppHandle,
        lease: LeaseHandle,
        remote_app: &str,
    ) -> bool {
        let Some(name) = self.app_names.get(&handle).cloned() else {
            return false;
        };
        let Some((endpoint, rel_id)) = self.lease_handles.get(&lease).cloned()
        else {
            return false;
        };
        if rel_id.local_app != name || rel_id.remote_app != remote_app {
            return false;
        }
        self.lease_handles.remove(&lease);

        let now = Instant::now();
        let gc_at = now + self.gc_delay();
        let mut outgoing = None;
        if let Some(rla) = self.remotes.get_mut(&endpoint) {
            if let Some(rel) = rla.relationships.get_mut(&rel_id) {
                pf_info!("terminating lease {}", rel.state_tag());
                rel.terminate();
            }
            if let Some(slots) = rla.timers.get_mut(&rel_id) {
                slots.disarm_all();
            }
            let two_way = rla.all_relationships_terminal();
            if two_way {
                rla.retire(gc_at);
            }
            outgoing = Some((rla.remote_instance, two_way));
        }
        if let Some((target, two_way)) = outgoing {
            let mut header =
                self.base_header(LeaseMessageType::LeaseRequest, target);
            header.is_two_way_termination = two_way;
            let mut msg = LeaseMessage::new(header);
            msg.lists.subject_terminated.push(rel_id.clone());
            msg.lists.monitor_terminated.push(rel_id);
            self.send_to(&endpoint, msg);
        }

        self.refresh_app_view(&name);
        true
    }

    /// Applies new configured durations. In-force relationship durations
    /// widen on the next renewal exchange; they narrow only once the peer's
    /// recorded request also shrinks.
    fn handle_update_duration(&mut self, durations: LeaseDurations) -> bool {
        if durations.lease_duration_ms == 0
            || durations.lease_duration_across_fd_ms == 0
        {
            pf_warn!("rejecting zero lease duration update");
            return false;
        }
        self.config.lease_duration_ms = durations.lease_duration_ms;
        self.config.lease_duration_across_fd_ms =
            durations.lease_duration_across_fd_ms;

        let config = self.config.clone();
        for rla in self.remotes.values_mut() {
            for rel in rla.relationships.values_mut() {
                rel.local_requested = config.duration_for(rel.duration_kind);
            }
        }
        pf_info!(
            "lease durations updated to {} ms / {} ms across fd",
            durations.lease_duration_ms,
            durations.lease_duration_across_fd_ms
        );
        true
    }

    fn handle_get_remote_expiration(
        &self,
        handle: AppHandle,
        remote_app: &str,
    ) -> Result<(i64, i64), VigilError> {
        let Some(name) = self.app_names.get(&handle) else {
            return logged_err!("unknown application handle {}", handle);
        };
        let rel_id = LeaseRelationshipId::new(name.clone(), remote_app);
        let now = Instant::now();
        for rla in self.remotes.values() {
            if let Some(rel) = rla.relationships.get(&rel_id) {
                return Ok((rel.monitor_ttl_ms(now), rel.subject_ttl_ms(now)));
            }
        }
        logged_err!("no lease relationship {}", rel_id)
    }

    fn handle_query_duration(
        &self,
        handle: AppHandle,
        remote_app: &str,
    ) -> Result<i64, VigilError> {
        let Some(name) = self.app_names.get(&handle) else {
            return logged_err!("unknown application handle {}", handle);
        };
        let rel_id = LeaseRelationshipId::new(name.clone(), remote_app);
        for rla in self.remotes.values() {
            if let Some(rel) = rla.relationships.get(&rel_id) {
                return Ok(rel.duration().as_millis() as i64);
            }
        }
        logged_err!("no lease relationship {}", rel_id)
    }

    /// Applies an arbitrator verdict. Deterministic: `local_ttl == 0` means
    /// the local side lost; `local_ttl == TTL_MAX` means it survives and the
    /// remote is declared failed once `remote_ttl` has lapsed (never, for
    /// `TTL_MAX`); anything else is inconclusive and holds the remote agent
    /// in a neutral grace period.
    fn handle_complete_arbitration(
        &mut self,
        handle: AppHandle,
        remote_endpoint: &str,
        remote_instance: AgentInstance,
        local_ttl_ms: i64,
        remote_ttl_ms: i64,
        is_delayed: bool,
    ) -> Result<bool, VigilError> {
        let Some(caller) = self.app_names.get(&handle) else {
            return Ok(false);
        };
        let Some(pending) = self.pending_arbitrations.get(remote_endpoint)
        else {
            pf_warn!("no pending arbitration for {}", remote_endpoint);
            return Ok(false);
        };
        // only the application the dispute was dispatched to may answer
        if *caller != pending.arbitrator_app {
            pf_warn!(
                "ignoring arbitration verdict from '{}'; '{}' was asked",
                caller,
                pending.arbitrator_app
            );
            return Ok(false);
        }
        let rel_id = pending.rel_id.clone();
        let elapsed = pending.started_at.elapsed();
        let Some(rla) = self.remotes.get_mut(remote_endpoint) else {
            self.pending_arbitrations.remove(remote_endpoint);
            return Ok(false);
        };
        if remote_instance != 0 && remote_instance != rla.remote_instance {
            pf_trace!(
                "ignoring arbitration verdict for stale instance {}",
                remote_instance
            );
            return Ok(false);
        }
        self.pending_arbitrations.remove(remote_endpoint);
        if let Some(slots) = self
            .remotes
            .get_mut(remote_endpoint)
            .and_then(|rla| rla.timers.get_mut(&rel_id))
        {
            slots.arbitration = None;
            slots.pre_arbitration = None;
        }
        pf_debug!(
            "arbitration verdict ({}, {}) for {} after {} ms",
            local_ttl_ms,
            remote_ttl_ms,
            remote_endpoint,
            elapsed.as_millis()
        );

        let now = Instant::now();
        match decide_arbitration(local_ttl_ms, remote_ttl_ms) {
            ArbitrationOutcome::LocalFails => {
                pf_warn!(
                    "arbitration lost against {}; failing local lease",
                    remote_endpoint
                );
                self.fail_relationship_locally(remote_endpoint, &rel_id);
            }
            ArbitrationOutcome::LocalSurvives {
                terminate_remote_after,
            } => {
                pf_info!(
                    "arbitration won against {}; remote declared failed in {} ms",
                    remote_endpoint,
                    terminate_remote_after.as_millis()
                );
                self.declare_remote_failed(remote_endpoint, &rel_id);
                // the loser's granted TTL must lapse before the failure
                // broadcast; a delayed verdict adds the suspend window
                let mut after = terminate_remote_after;
                if is_delayed {
                    after += self.config.suspend_duration();
                }
                let (e, r) = (remote_endpoint.to_string(), rel_id.clone());
                let timer =
                    Self::spawn_timer(&self.tx_notice, now + after, move || {
                        EngineNotice::DelayedTermination {
                            endpoint: e.clone(),
                            rel_id: r.clone(),
                        }
                    })?;
                if let Some(rla) = self.remotes.get_mut(remote_endpoint) {
                    rla.timers
                        .entry(rel_id.clone())
                        .or_default()
                        .delayed_termination = Some(timer);
                }
            }
            ArbitrationOutcome::LocalSurvivesRemoteUnkillable => {
                pf_info!(
                    "arbitration won against {}; remote unkillable, no termination sent",
                    remote_endpoint
                );
                self.declare_remote_failed(remote_endpoint, &rel_id);
            }
            ArbitrationOutcome::Neutral => {
                pf_info!(
                    "arbitration against {} inconclusive; holding neutral",
                    remote_endpoint
                );
                let hold = self.config.arbitration_duration();
                let retry =
                    Duration::from_millis(self.config.ping_retry_interval_ms);
                let e = remote_endpoint.to_string();
                let timer =
                    Self::spawn_timer(&self.tx_notice, now + retry, move || {
                        EngineNotice::PingRetryTimeout {
                            endpoint: e.clone(),
                        }
                    })?;
                if let Some(rla) = self.remotes.get_mut(remote_endpoint) {
                    rla.arbitration_neutral = true;
                    rla.time_to_be_failed = Some(now + hold);
                    rla.ping_retry = Some(timer);
                }
            }
        }
        Ok(true)
    }

    /// The local side of a relationship lost (arbitration or fail-closed):
    /// notify the owner, tear the relationship down, and mark the agent
    /// failed.
    fn fail_relationship_locally(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
    ) {
        self.deliver_to_app(&rel_id.local_app, LeaseEvent::LeaseFailed);
        let gc_at = Instant::now() + self.gc_delay();
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                rel.terminate();
            }
            if let Some(slots) = rla.timers.get_mut(rel_id) {
                slots.disarm_all();
            }
            if rla.all_relationships_terminal() {
                rla.retire(gc_at);
            }
        }
        self.transition_state(AgentState::Failed);
        self.refresh_app_view(&rel_id.local_app);
    }

    /// The monitored remote side was declared failed: notify the owner and
    /// fail the monitor side of the relationship.
    fn declare_remote_failed(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
    ) {
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                if rel.fail_monitor() {
                    pf_warn!("remote declared failed {}", rel.state_tag());
                }
            }
        }
        self.deliver_to_app(
            &rel_id.local_app,
            LeaseEvent::RemoteExpired {
                remote_app: rel_id.remote_app.clone(),
                remote_endpoint: endpoint.to_string(),
            },
        );
    }

    /*
     * incoming message handlers
     */

    fn handle_recv_message(
        &mut self,
        msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        // a message addressed to a previous incarnation of this agent is
        // stale no matter its content
        if msg.header.target_instance != 0
            && msg.header.target_instance != self.instance
        {
            pf_trace!(
                "dropping message targeting foreign instance {}",
                msg.header.target_instance
            );
            return Ok(());
        }

        match msg.header.msg_type {
            LeaseMessageType::LeaseRequest | LeaseMessageType::RelayRequest => {
                self.handle_lease_request(msg)
            }
            LeaseMessageType::LeaseResponse
            | LeaseMessageType::ForwardResponse => {
                self.handle_lease_response(msg)
            }
            LeaseMessageType::PingRequest => self.handle_ping_request(msg),
            LeaseMessageType::PingResponse => self.handle_ping_response(msg),
            LeaseMessageType::ForwardRequest => self.handle_forward_request(msg),
            LeaseMessageType::RelayResponse => self.handle_relay_response(msg),
        }
    }

    /// Instance- and message-id-ordering gate for a message from `peer`.
    /// Creates the remote lease agent on first contact; on a higher incoming
    /// instance the current one is superseded and its owners are notified.
    fn admit_incoming(&mut self, peer: &str, header: &LeaseHeader) -> bool {
        let now = Instant::now();
        let gc_at = now + self.gc_delay();

        if let Some(rla) = self.remotes.get(peer) {
            match rla.check_incoming(header.sender_instance, header.message_id)
            {
                IncomingVerdict::Fresh => {}
                IncomingVerdict::StaleDrop => {
                    pf_trace!(
                        "dropping stale message {} from {} instance {}",
                        header.message_id,
                        peer,
                        header.sender_instance
                    );
                    return false;
                }
                IncomingVerdict::NewerInstance => {
                    pf_info!(
                        "peer {} restarted with instance {}; superseding",
                        peer,
                        header.sender_instance
                    );
                    if let Some(mut old) = self.remotes.remove(peer) {
                        // leases held against the old incarnation are gone
                        for rel in old.relationships.values_mut() {
                            if rel.monitor_state == OneWayState::Active
                                || rel.monitor_state == OneWayState::Expired
                            {
                                if let Some(app) =
                                    self.apps.get(&rel.id.local_app)
                                {
                                    app.deliver(LeaseEvent::RemoteExpired {
                                        remote_app: rel.id.remote_app.clone(),
                                        remote_endpoint: peer.to_string(),
                                    });
                                }
                            }
                            rel.terminate();
                        }
                        old.retire(gc_at);
                        self.retired.push(old);
                    }
                }
            }
        }

        // a retired shell (e.g. after a two-way termination) must not be
        // mutated by fresh traffic; park it and start a clean agent
        let is_shell = self
            .remotes
            .get(peer)
            .is_some_and(|rla| !rla.is_active);
        if is_shell {
            if let Some(old) = self.remotes.remove(peer) {
                self.retired.push(old);
            }
        }

        let rla = self
            .remotes
            .entry(peer.to_string())
            .or_insert_with(|| {
                RemoteLeaseAgent::new(peer.to_string(), header.sender_instance)
            });
        rla.record_incoming(header.sender_instance, header.message_id, now);
        true
    }

    fn handle_lease_request(
        &mut self,
        msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let is_relay = msg.header.msg_type == LeaseMessageType::RelayRequest;
        let peer = msg.header.sender_endpoint.clone();
        // a relayed request is answered back through the relay node
        let reply_to = if is_relay {
            msg.relay_target.clone()
        } else {
            peer.clone()
        };

        if !self.admit_incoming(&peer, &msg.header) {
            return Ok(());
        }

        let mut accepted: Vec<LeaseRelationshipId> = Vec::new();
        let mut rejected: Vec<LeaseRelationshipId> = Vec::new();
        let mut max_granted = Duration::ZERO;
        let mut events: Vec<(String, LeaseEvent)> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();
        let mut rearm: Vec<LeaseRelationshipId> = Vec::new();

        let gc_at = now + self.gc_delay();
        let config = self.config.clone();
        let apps = &self.apps;
        let Some(rla) = self.remotes.get_mut(&peer) else {
            return Ok(());
        };

        for their_id in &msg.lists.subject_pending {
            let our_id = their_id.reversed();
            match apps.get(&our_id.local_app) {
                Some(app) if !app.is_closing => {
                    let rel = rla
                        .relationships
                        .entry(our_id.clone())
                        .or_insert_with(|| {
                            LeaseRelationship::new(
                                our_id.clone(),
                                DurationType::Regular,
                                config.duration_for(DurationType::Regular),
                                config.suspend_duration(),
                                config.arbitration_duration(),
                            )
                        });
                    if msg.header.lease_instance < rel.remote_lease_instance {
                        pf_trace!(
                            "ignoring outdated lease_instance {} for {}",
                            msg.header.lease_instance,
                            our_id
                        );
                        continue;
                    }
                    rel.remote_lease_instance = msg.header.lease_instance;
                    let granted = rel.apply_request(
                        Duration::from_millis(
                            msg.header.duration_ms.max(0) as u64
                        ),
                        Duration::from_millis(
                            msg.header.suspend_duration_ms.max(0) as u64,
                        ),
                        Duration::from_millis(
                            msg.header.arbitration_duration_ms.max(0) as u64,
                        ),
                        now,
                    );
                    max_granted = max_granted.max(granted);
                    accepted.push(their_id.clone());
                    touched.insert(our_id.local_app.clone());
                    rearm.push(our_id);
                }
                _ => {
                    pf_debug!(
                        "rejecting lease request for unknown/closing app '{}'",
                        our_id.local_app
                    );
                    rejected.push(their_id.clone());
                }
            }
        }

        for their_id in &msg.lists.subject_failed {
            let our_id = their_id.reversed();
            if let Some(rel) = rla.relationships.get_mut(&our_id) {
                if rel.fail_monitor() {
                    pf_warn!("remote subject failed {}", rel.state_tag());
                    events.push((
                        our_id.local_app.clone(),
                        LeaseEvent::RemoteExpired {
                            remote_app: our_id.remote_app.clone(),
                            remote_endpoint: peer.clone(),
                        },
                    ));
                }
                rel.terminate();
                if let Some(slots) = rla.timers.get_mut(&our_id) {
                    slots.disarm_all();
                }
                touched.insert(our_id.local_app.clone());
            }
        }

        for their_id in &msg.lists.monitor_failed {
            let our_id = their_id.reversed();
            if let Some(rel) = rla.relationships.get_mut(&our_id) {
                // a crossing declaration for a side that already failed or
                // terminated locally must not fire the callback again
                if !rel.fail_subject_declared() {
                    pf_trace!(
                        "failure declaration for settled {}",
                        rel.state_tag()
                    );
                    continue;
                }
                pf_warn!("declared failed by remote monitor {}", rel.state_tag());
                rel.terminate();
                if let Some(slots) = rla.timers.get_mut(&our_id) {
                    slots.disarm_all();
                }
                events.push((our_id.local_app.clone(), LeaseEvent::LeaseFailed));
                touched.insert(our_id.local_app.clone());
            }
        }

        for their_id in &msg.lists.subject_terminated {
            let our_id = their_id.reversed();
            if let Some(rel) = rla.relationships.get_mut(&our_id) {
                pf_debug!("remote terminated its subject side {}", rel.state_tag());
                rel.monitor_state = OneWayState::Inactive;
                rel.monitor_expire_time = None;
                if let Some(slots) = rla.timers.get_mut(&our_id) {
                    slots.monitor_expire = None;
                    slots.pre_arbitration = None;
                }
                touched.insert(our_id.local_app.clone());
            }
        }

        for their_id in &msg.lists.monitor_terminated {
            let our_id = their_id.reversed();
            if let Some(rel) = rla.relationships.get_mut(&our_id) {
                pf_debug!("remote terminated its monitor side {}", rel.state_tag());
                rel.subject_state = OneWayState::Inactive;
                rel.subject_expire_time = None;
                rel.subject_fail_time = None;
                if let Some(slots) = rla.timers.get_mut(&our_id) {
                    slots.renew = None;
                    slots.subject_expire = None;
                    slots.subject_fail = None;
                }
                touched.insert(our_id.local_app.clone());
            }
        }

        if msg.header.is_two_way_termination {
            pf_info!("two-way termination from {}", peer);
            for rel in rla.relationships.values_mut() {
                touched.insert(rel.id.local_app.clone());
                rel.terminate();
            }
            rla.retire(gc_at);
        }

        let target = rla.remote_instance;

        for rel_id in &rearm {
            self.arm_timers_for(&peer, rel_id)?;
        }

        if !accepted.is_empty() || !rejected.is_empty() {
            let reply_type = if is_relay {
                LeaseMessageType::RelayResponse
            } else {
                LeaseMessageType::LeaseResponse
            };
            let mut header = self.base_header(reply_type, target);
            header.lease_instance = msg.header.lease_instance;
            header.duration_ms = max_granted.as_millis() as i64;
            header.expiration_ms = max_granted.as_millis() as i64;
            header.suspend_duration_ms =
                self.config.suspend_duration_ms as i64;
            header.arbitration_duration_ms =
                self.config.arbitration_duration_ms as i64;
            let mut reply = LeaseMessage::new(header);
            reply.lists.subject_accepted = accepted;
            reply.lists.subject_rejected = rejected;
            if is_relay {
                reply.relay_origin = msg.relay_origin.clone();
            }
            self.send_to(&reply_to, reply);
        }

        for (name, event) in events {
            self.deliver_to_app(&name, event);
        }
        for name in touched {
            self.refresh_app_view(&name);
        }
        Ok(())
    }

    fn handle_lease_response(
        &mut self,
        msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let indirect =
            msg.header.msg_type == LeaseMessageType::ForwardResponse;
        let peer = msg.header.sender_endpoint.clone();

        if !self.admit_incoming(&peer, &msg.header) {
            return Ok(());
        }

        let max_indirect =
            Duration::from_millis(self.config.max_indirect_lease_ms);
        let mut events: Vec<(String, LeaseEvent)> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();
        let mut rearm: Vec<LeaseRelationshipId> = Vec::new();

        let Some(rla) = self.remotes.get_mut(&peer) else {
            return Ok(());
        };

        for our_id in &msg.lists.subject_accepted {
            let Some(rel) = rla.relationships.get_mut(our_id) else {
                continue;
            };
            if rel.lease_instance != msg.header.lease_instance {
                pf_trace!(
                    "ignoring outdated lease_instance {} response for {}",
                    msg.header.lease_instance,
                    our_id
                );
                continue;
            }
            if indirect {
                // indirect renewals may only bridge a bounded outage
                if let Some(first) = rel.first_indirect_at {
                    if now.saturating_duration_since(first) > max_indirect {
                        pf_warn!(
                            "indirect renewal window exhausted for {}",
                            our_id
                        );
                        continue;
                    }
                }
            }
            if !rel.apply_response(
                Duration::from_millis(msg.header.duration_ms.max(0) as u64),
                now,
            ) {
                continue;
            }
            if indirect {
                if rel.first_indirect_at.is_none() {
                    rel.first_indirect_at = Some(now);
                }
                rel.indirect_cnt += 1;
            }
            if !rel.establish_notified {
                rel.establish_notified = true;
                events.push((
                    our_id.local_app.clone(),
                    LeaseEvent::LeaseEstablished {
                        remote_app: our_id.remote_app.clone(),
                        remote_endpoint: peer.clone(),
                    },
                ));
            }
            touched.insert(our_id.local_app.clone());
            rearm.push(our_id.clone());
        }

        for our_id in &msg.lists.subject_rejected {
            if let Some(rel) = rla.relationships.get_mut(our_id) {
                if !rel.fail_subject_declared() {
                    pf_trace!("rejection for settled {}", rel.state_tag());
                    continue;
                }
                pf_warn!("lease request rejected by remote {}", rel.state_tag());
                rel.terminate();
                if let Some(slots) = rla.timers.get_mut(our_id) {
                    slots.disarm_all();
                }
                events.push((our_id.local_app.clone(), LeaseEvent::LeaseFailed));
                touched.insert(our_id.local_app.clone());
            }
        }

        for rel_id in &rearm {
            self.arm_timers_for(&peer, rel_id)?;
        }
        for (name, event) in events {
            self.deliver_to_app(&name, event);
        }
        for name in touched {
            self.refresh_app_view(&name);
        }
        self.maybe_recover_state();
        Ok(())
    }

    fn handle_ping_request(
        &mut self,
        msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        let peer = msg.header.sender_endpoint.clone();
        if !self.admit_incoming(&peer, &msg.header) {
            return Ok(());
        }
        let target = msg.header.sender_instance;
        let header = self.base_header(LeaseMessageType::PingResponse, target);
        self.send_to(&peer, LeaseMessage::new(header));
        Ok(())
    }

    fn handle_ping_response(
        &mut self,
        msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let peer = msg.header.sender_endpoint.clone();
        if !self.admit_incoming(&peer, &msg.header) {
            return Ok(());
        }

        // once arbitration is in flight only the verdict decides
        if self.pending_arbitrations.contains_key(&peer) {
            pf_trace!("ping response from {} during arbitration, ignored", peer);
            return Ok(());
        }

        let mut rearm: Vec<LeaseRelationshipId> = Vec::new();
        if let Some(rla) = self.remotes.get_mut(&peer) {
            rla.ping_in_progress = false;
            if rla.arbitration_neutral {
                pf_info!("peer {} responsive again after neutral arbitration", peer);
                rla.arbitration_neutral = false;
                rla.ping_retry = None;
                rla.time_to_be_failed = None;
            }
            for (rel_id, rel) in rla.relationships.iter_mut() {
                if rel.revive_monitor(now) {
                    pf_info!("monitor side revived by ping {}", rel.state_tag());
                    rearm.push(rel_id.clone());
                }
            }
            for rel_id in &rearm {
                if let Some(slots) = rla.timers.get_mut(rel_id) {
                    slots.pre_arbitration = None;
                }
            }
        }
        for rel_id in &rearm {
            self.arm_timers_for(&peer, rel_id)?;
        }
        Ok(())
    }

    /// Relay leg: this node forwards an origin's renewal to the target it
    /// cannot reach directly. The origin's header is passed through; only
    /// the routing fields change.
    fn handle_forward_request(
        &mut self,
        mut msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        let target = msg.relay_target.clone();
        if target.is_empty() || target == self.endpoint {
            pf_warn!("dropping forward request with bad relay target");
            return Ok(());
        }
        pf_debug!(
            "relaying renewal from {} to {}",
            msg.relay_origin,
            target
        );
        msg.header.msg_type = LeaseMessageType::RelayRequest;
        // the target replies back through this node
        msg.relay_target = self.endpoint.clone();
        self.send_to(&target, msg);
        Ok(())
    }

    /// Relay leg: the target's response travels back to the origin.
    fn handle_relay_response(
        &mut self,
        mut msg: LeaseMessage,
    ) -> Result<(), VigilError> {
        let origin = msg.relay_origin.clone();
        if origin.is_empty() || origin == self.endpoint {
            pf_warn!("dropping relay response with bad origin");
            return Ok(());
        }
        msg.header.msg_type = LeaseMessageType::ForwardResponse;
        self.send_to(&origin, msg);
        Ok(())
    }

    /*
     * timer fire handlers
     */

    fn handle_renew_timeout(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
        lease_instance: LeaseInstance,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let retry_count = self.config.renew_retry_count;
        let retry_pct = self.config.renew_retry_interval_pct;
        let max_indirect =
            Duration::from_millis(self.config.max_indirect_lease_ms);

        // deterministic relay choice among the other peers recently heard
        // from; a silent peer cannot vouch for anyone's renewals
        let unresponsive =
            Duration::from_millis(self.config.unresponsive_duration_ms);
        let relay: Option<String> = self
            .remotes
            .iter()
            .filter(|(e, rla)| {
                e.as_str() != endpoint
                    && rla.is_active
                    && rla.last_incoming_at.is_some_and(|at| {
                        now.saturating_duration_since(at) < unresponsive
                    })
            })
            .map(|(e, _)| e.clone())
            .min();

        let Some(rla) = self.remotes.get_mut(endpoint) else {
            return Ok(());
        };
        if !rla.is_active {
            return Ok(());
        }
        let target = rla.remote_instance;
        let Some(rel) = rla.relationships.get_mut(rel_id) else {
            return Ok(());
        };
        if rel.lease_instance != lease_instance
            || rel.subject_state != OneWayState::Active
        {
            pf_trace!("ignoring outdated renew fire for {}", rel_id);
            return Ok(());
        }

        rel.renew_retry_cnt += 1;
        let mut go_indirect =
            rel.renew_retry_cnt > retry_count && relay.is_some();
        if go_indirect {
            if let Some(first) = rel.first_indirect_at {
                if now.saturating_duration_since(first) > max_indirect {
                    pf_trace!("indirect window exhausted for {}", rel_id);
                    go_indirect = false;
                }
            }
        }
        rel.record_renew_sent(now);
        if rel.renew_retry_cnt > 1 {
            pf_debug!(
                "renew retry #{} for {}{}",
                rel.renew_retry_cnt,
                rel_id,
                if go_indirect { " (indirect)" } else { "" }
            );
        }

        let li = rel.lease_instance;
        let dur = rel.duration();
        let sus = rel.suspend_duration();
        let arb = rel.arbitration_duration();

        let msg_type = if go_indirect {
            LeaseMessageType::ForwardRequest
        } else {
            LeaseMessageType::LeaseRequest
        };
        let mut header = self.base_header(msg_type, target);
        header.lease_instance = li;
        header.duration_ms = dur.as_millis() as i64;
        header.expiration_ms = dur.as_millis() as i64;
        header.suspend_duration_ms = sus.as_millis() as i64;
        header.arbitration_duration_ms = arb.as_millis() as i64;
        let mut msg = LeaseMessage::new(header);
        msg.lists.subject_pending.push(rel_id.clone());

        if go_indirect {
            msg.relay_target = endpoint.to_string();
            msg.relay_origin = self.endpoint.clone();
            if let Some(relay) = relay {
                self.send_to(&relay, msg);
            }
        } else {
            self.send_to(endpoint, msg);
        }

        // retries are spaced a small fraction of the lease duration apart,
        // jittered so the two sides of a pair don't stay in lockstep
        let base_ms =
            (dur.as_millis() as u64 * retry_pct as u64 / 100).max(2);
        let retry_after = Duration::from_millis(
            rand::thread_rng().gen_range(base_ms..=base_ms * 5 / 4),
        );
        let (e, r) = (endpoint.to_string(), rel_id.clone());
        let timer =
            Self::spawn_timer(&self.tx_notice, now + retry_after, move || {
                EngineNotice::RenewTimeout {
                    endpoint: e.clone(),
                    rel_id: r.clone(),
                    lease_instance: li,
                }
            })?;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            rla.timers.entry(rel_id.clone()).or_default().renew = Some(timer);
        }
        Ok(())
    }

    fn handle_subject_expire_timeout(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
        lease_instance: LeaseInstance,
        expire_at: Instant,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let mut expired = false;
        let mut moved_later = false;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                if rel.lease_instance != lease_instance
                    || rel.subject_state != OneWayState::Active
                {
                    return Ok(());
                }
                // a renewal that landed after this fire was armed wins
                if rel.subject_expire_time != Some(expire_at) {
                    moved_later = true;
                } else if rel.expire_subject(now) {
                    pf_warn!("subject lease expired {}", rel.state_tag());
                    expired = true;
                }
            }
        }
        if moved_later || expired {
            self.arm_timers_for(endpoint, rel_id)?;
        }
        if expired {
            self.transition_state(AgentState::Suspended);
            self.refresh_app_view(&rel_id.local_app);
        }
        Ok(())
    }

    fn handle_subject_fail_timeout(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
        lease_instance: LeaseInstance,
    ) -> Result<(), VigilError> {
        let mut failed = false;
        let mut target = 0;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            target = rla.remote_instance;
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                if rel.lease_instance != lease_instance {
                    return Ok(());
                }
                if rel.fail_subject() {
                    pf_error!("subject lease failed {}", rel.state_tag());
                    failed = true;
                }
            }
        }
        if !failed {
            return Ok(());
        }

        self.deliver_to_app(&rel_id.local_app, LeaseEvent::LeaseFailed);

        // best-effort broadcast; the guarantee window has already lapsed on
        // the monitor side
        let header = self.base_header(LeaseMessageType::LeaseRequest, target);
        let mut msg = LeaseMessage::new(header);
        msg.lists.subject_failed.push(rel_id.clone());
        self.send_to(endpoint, msg);

        let gc_at = Instant::now() + self.gc_delay();
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                rel.terminate();
            }
            if let Some(slots) = rla.timers.get_mut(rel_id) {
                slots.disarm_all();
            }
            if rla.all_relationships_terminal() {
                rla.retire(gc_at);
            }
        }
        self.transition_state(AgentState::Failed);
        self.refresh_app_view(&rel_id.local_app);
        Ok(())
    }

    fn handle_monitor_expire_timeout(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
        lease_instance: LeaseInstance,
        expire_at: Instant,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let pre_arb = Duration::from_millis(self.config.pre_arbitration_ms);
        let mut expired = false;
        let mut moved_later = false;
        let mut target = 0;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            target = rla.remote_instance;
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                if rel.lease_instance != lease_instance
                    || rel.monitor_state != OneWayState::Active
                {
                    return Ok(());
                }
                if rel.monitor_expire_time != Some(expire_at) {
                    moved_later = true;
                } else if rel.expire_monitor() {
                    pf_warn!("monitor lease expired {}", rel.state_tag());
                    expired = true;
                }
            }
        }
        if moved_later {
            self.arm_timers_for(endpoint, rel_id)?;
            return Ok(());
        }
        if !expired {
            return Ok(());
        }

        // before arbitrating, give the peer one ping round-trip to prove it
        // is merely slow
        let header = self.base_header(LeaseMessageType::PingRequest, target);
        self.send_to(endpoint, LeaseMessage::new(header));

        let (e, r) = (endpoint.to_string(), rel_id.clone());
        let timer =
            Self::spawn_timer(&self.tx_notice, now + pre_arb, move || {
                EngineNotice::PreArbitrationTimeout {
                    endpoint: e.clone(),
                    rel_id: r.clone(),
                    lease_instance,
                }
            })?;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            rla.ping_in_progress = true;
            rla.timers
                .entry(rel_id.clone())
                .or_default()
                .pre_arbitration = Some(timer);
        }
        Ok(())
    }

    fn handle_pre_arbitration_timeout(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
        lease_instance: LeaseInstance,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        if self.pending_arbitrations.contains_key(endpoint) {
            return Ok(());
        }

        let arbitrator: Option<String> = self
            .apps
            .values()
            .filter(|app| app.is_arbitration_enabled && !app.is_closing)
            .map(|app| app.name.clone())
            .min();

        let mut snapshot = None;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            rla.ping_in_progress = false;
            if let Some(rel) = rla.relationships.get(rel_id) {
                if rel.lease_instance != lease_instance
                    || rel.monitor_state != OneWayState::Expired
                {
                    return Ok(());
                }
                snapshot = Some((
                    rla.remote_instance,
                    rel.subject_expire_time,
                    rel.monitor_ttl_ms(now),
                    rel.remote_lease_instance,
                    rel.lease_instance,
                    rel.arbitration_duration(),
                ));
            }
        }
        let Some((
            remote_instance,
            subject_expire,
            monitor_ttl,
            monitor_lease_instance,
            subject_lease_instance,
            arb_duration,
        )) = snapshot
        else {
            return Ok(());
        };

        let Some(arbitrator) = arbitrator else {
            // no arbitrator available: degraded mode, declare the remote
            // failed on local evidence alone
            pf_warn!(
                "no arbitrator application; declaring {} failed unarbitrated",
                endpoint
            );
            self.declare_remote_failed(endpoint, rel_id);
            self.finish_failed_relationship(endpoint, rel_id);
            return Ok(());
        };

        // one-way dispute: a side with no subject lease is unkillable
        let local_ttl = subject_expire
            .map_or(TTL_MAX, |e| ttl_ms(now, e).max(0));
        let remote_ttl = monitor_ttl.max(0);
        let remote_arbitration_ubound_ms =
            (-monitor_ttl).max(0) + self.config.pre_arbitration_ms as i64;

        pf_warn!(
            "requesting arbitration against {} via '{}'",
            endpoint,
            arbitrator
        );
        self.deliver_to_app(
            &arbitrator,
            LeaseEvent::ArbitrateRequest {
                local_instance: self.instance,
                local_ttl_ms: local_ttl,
                remote_endpoint: endpoint.to_string(),
                remote_instance,
                remote_app: rel_id.remote_app.clone(),
                remote_ttl_ms: remote_ttl,
                monitor_lease_instance,
                subject_lease_instance,
                remote_arbitration_ubound_ms,
                protocol_version: (
                    LEASE_PROTOCOL_MAJOR_VERSION,
                    LEASE_PROTOCOL_MINOR_VERSION,
                ),
            },
        );
        self.pending_arbitrations.insert(
            endpoint.to_string(),
            PendingArbitration {
                rel_id: rel_id.clone(),
                arbitrator_app: arbitrator,
                started_at: now,
            },
        );

        let (e, r) = (endpoint.to_string(), rel_id.clone());
        let timer = Self::spawn_timer(
            &self.tx_notice,
            now + arb_duration,
            move || EngineNotice::ArbitrationTimeout {
                endpoint: e.clone(),
                rel_id: r.clone(),
            },
        )?;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            rla.timers.entry(rel_id.clone()).or_default().arbitration =
                Some(timer);
        }
        Ok(())
    }

    /// An arbitration left unanswered past its window fails closed: the
    /// local side treats itself as the loser.
    fn handle_arbitration_timeout(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
    ) -> Result<(), VigilError> {
        let matches = self
            .pending_arbitrations
            .get(endpoint)
            .is_some_and(|p| p.rel_id == *rel_id);
        if !matches {
            return Ok(());
        }
        self.pending_arbitrations.remove(endpoint);
        pf_error!(
            "arbitration against {} unanswered; failing closed",
            endpoint
        );
        self.fail_relationship_locally(endpoint, rel_id);
        Ok(())
    }

    fn handle_delayed_termination(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
    ) -> Result<(), VigilError> {
        let Some(rla) = self.remotes.get(endpoint) else {
            return Ok(());
        };
        let target = rla.remote_instance;

        let header = self.base_header(LeaseMessageType::LeaseRequest, target);
        let mut msg = LeaseMessage::new(header);
        msg.lists.monitor_failed.push(rel_id.clone());
        self.send_to(endpoint, msg);

        self.finish_failed_relationship(endpoint, rel_id);
        Ok(())
    }

    /// Common tail for monitor-side failure paths: relationship torn down,
    /// timers disarmed, agent retired if nothing remains.
    fn finish_failed_relationship(
        &mut self,
        endpoint: &str,
        rel_id: &LeaseRelationshipId,
    ) {
        let gc_at = Instant::now() + self.gc_delay();
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            if let Some(rel) = rla.relationships.get_mut(rel_id) {
                rel.terminate();
            }
            if let Some(slots) = rla.timers.get_mut(rel_id) {
                slots.disarm_all();
            }
            if rla.all_relationships_terminal() {
                rla.retire(gc_at);
            }
        }
        self.refresh_app_view(&rel_id.local_app);
    }

    fn handle_ping_retry_timeout(
        &mut self,
        endpoint: &str,
    ) -> Result<(), VigilError> {
        let now = Instant::now();
        let retry =
            Duration::from_millis(self.config.ping_retry_interval_ms);
        let still_neutral = self
            .remotes
            .get(endpoint)
            .is_some_and(|rla| rla.arbitration_neutral);
        if !still_neutral {
            return Ok(());
        }
        let target = self
            .remotes
            .get(endpoint)
            .map_or(0, |rla| rla.remote_instance);

        let header = self.base_header(LeaseMessageType::PingRequest, target);
        self.send_to(endpoint, LeaseMessage::new(header));

        let e = endpoint.to_string();
        let timer =
            Self::spawn_timer(&self.tx_notice, now + retry, move || {
                EngineNotice::PingRetryTimeout {
                    endpoint: e.clone(),
                }
            })?;
        if let Some(rla) = self.remotes.get_mut(endpoint) {
            rla.ping_in_progress = true;
            rla.ping_retry = Some(timer);
        }
        Ok(())
    }

    /*
     * maintenance sweep
     */

    fn handle_maintenance(&mut self) {
        let now = Instant::now();
        let gc_delay = self.gc_delay();
        let mut stats = sweep_remotes(
            &mut self.remotes,
            &mut self.retired,
            gc_delay,
            now,
        );

        let referenced: HashSet<String> = self
            .remotes
            .values()
            .flat_map(|rla| rla.relationships.keys())
            .map(|id| id.local_app.clone())
            .collect();
        let removed_apps =
            sweep_apps(&mut self.apps, |name| referenced.contains(name));
        stats.apps_removed = removed_apps.len();
        for (name, handle) in removed_apps {
            pf_info!("delayed unregister of application '{}' completed", name);
            self.app_names.remove(&handle);
            self.lease_handles
                .retain(|_, (_, id)| id.local_app != name);
            let mut guard = self.app_views.guard();
            guard.remove(handle);
        }

        // drop lease handles whose relationship no longer exists
        let remotes = &self.remotes;
        self.lease_handles.retain(|_, (endpoint, id)| {
            remotes
                .get(endpoint)
                .is_some_and(|rla| rla.relationships.contains_key(id))
        });

        if stats.relationships_removed > 0
            || stats.remotes_removed > 0
            || stats.apps_removed > 0
        {
            pf_debug!(
                "maintenance sweep: {} relationships, {} remotes, {} apps reclaimed",
                stats.relationships_removed,
                stats.remotes_removed,
                stats.apps_removed
            );
        }

        let names: Vec<String> = self.apps.keys().cloned().collect();
        for name in names {
            self.refresh_app_view(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::apps::AppEvent;

    fn test_task(
        endpoint: &str,
    ) -> (
        LeaseAgentLogicTask,
        mpsc::UnboundedReceiver<EngineAction>,
    ) {
        let mut config = LeaseConfig::default();
        config.lease_duration_ms = 1000;
        config.suspend_duration_ms = 200;
        config.arbitration_duration_ms = 3000;
        config.pre_arbitration_ms = 100;
        let (task, _tx, rx_action, _views) =
            LeaseAgentLogicTask::new(endpoint.into(), config);
        (task, rx_action)
    }

    fn register(
        task: &mut LeaseAgentLogicTask,
        name: &str,
        arbitration: bool,
    ) -> (AppHandle, AppEventReceiver) {
        task.handle_register(name.into(), arbitration, 1000)
            .unwrap()
    }

    fn next_send(
        rx: &mut mpsc::UnboundedReceiver<EngineAction>,
    ) -> (String, LeaseMessage) {
        match rx.try_recv().unwrap() {
            EngineAction::SendMessage { endpoint, msg } => (endpoint, msg),
        }
    }

    #[tokio::test]
    async fn establish_sends_request() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        let (handle, _events) = register(&mut task, "fed/A", false);

        let (lease, already) = task
            .handle_establish(
                handle,
                "fed/B".into(),
                "10.0.0.2:9000".into(),
                0,
                DurationType::Regular,
            )
            .unwrap();
        assert!(!already);

        let (to, msg) = next_send(&mut rx);
        assert_eq!(to, "10.0.0.2:9000");
        assert_eq!(msg.header.msg_type, LeaseMessageType::LeaseRequest);
        assert_eq!(
            msg.lists.subject_pending,
            vec![LeaseRelationshipId::new("fed/A", "fed/B")]
        );
        assert_eq!(msg.header.duration_ms, 1000);

        // idempotent re-establish: same handle, already-established flag
        let (lease2, already2) = task
            .handle_establish(
                handle,
                "fed/B".into(),
                "10.0.0.2:9000".into(),
                0,
                DurationType::Regular,
            )
            .unwrap();
        assert_eq!(lease, lease2);
        assert!(already2);
    }

    #[tokio::test]
    async fn incoming_request_accepted_or_rejected() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        register(&mut task, "fed/A", false);

        let mut header = LeaseHeader {
            msg_type: LeaseMessageType::LeaseRequest,
            message_id: 1,
            sender_endpoint: "10.0.0.2:9000".into(),
            sender_instance: 777,
            target_instance: 0,
            lease_instance: 1,
            duration_ms: 2000,
            expiration_ms: 2000,
            suspend_duration_ms: 200,
            arbitration_duration_ms: 3000,
            is_two_way_termination: false,
        };
        let mut msg = LeaseMessage::new(header.clone());
        msg.lists
            .subject_pending
            .push(LeaseRelationshipId::new("fed/B", "fed/A"));
        msg.lists
            .subject_pending
            .push(LeaseRelationshipId::new("fed/B", "fed/NOPE"));
        task.handle_recv_message(msg).unwrap();

        let (to, reply) = next_send(&mut rx);
        assert_eq!(to, "10.0.0.2:9000");
        assert_eq!(reply.header.msg_type, LeaseMessageType::LeaseResponse);
        assert_eq!(
            reply.lists.subject_accepted,
            vec![LeaseRelationshipId::new("fed/B", "fed/A")]
        );
        assert_eq!(
            reply.lists.subject_rejected,
            vec![LeaseRelationshipId::new("fed/B", "fed/NOPE")]
        );
        // granted the wider of the two requests
        assert_eq!(reply.header.duration_ms, 2000);

        // monitor side is now watching the remote subject
        let rla = task.remotes.get("10.0.0.2:9000").unwrap();
        let rel = rla
            .relationships
            .get(&LeaseRelationshipId::new("fed/A", "fed/B"))
            .unwrap();
        assert_eq!(rel.monitor_state, OneWayState::Active);

        // a duplicate message id is dropped without a reply
        header.message_id = 1;
        let mut dup = LeaseMessage::new(header);
        dup.lists
            .subject_pending
            .push(LeaseRelationshipId::new("fed/B", "fed/A"));
        task.handle_recv_message(dup).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_completes_establish() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        let (handle, mut events) = register(&mut task, "fed/A", false);
        task.handle_establish(
            handle,
            "fed/B".into(),
            "10.0.0.2:9000".into(),
            0,
            DurationType::Regular,
        )
        .unwrap();
        let (_, request) = next_send(&mut rx);

        let mut header = LeaseHeader {
            msg_type: LeaseMessageType::LeaseResponse,
            message_id: 1,
            sender_endpoint: "10.0.0.2:9000".into(),
            sender_instance: 777,
            target_instance: 0,
            lease_instance: request.header.lease_instance,
            duration_ms: 1000,
            expiration_ms: 1000,
            suspend_duration_ms: 200,
            arbitration_duration_ms: 3000,
            is_two_way_termination: false,
        };
        let mut reply = LeaseMessage::new(header.clone());
        reply
            .lists
            .subject_accepted
            .push(LeaseRelationshipId::new("fed/A", "fed/B"));
        task.handle_recv_message(reply).unwrap();

        let AppEvent { event, .. } = events.try_recv().unwrap();
        assert_eq!(
            event,
            LeaseEvent::LeaseEstablished {
                remote_app: "fed/B".into(),
                remote_endpoint: "10.0.0.2:9000".into(),
            }
        );

        // a stale lease_instance response delivers nothing further
        header.message_id = 2;
        header.lease_instance = 0;
        let mut stale = LeaseMessage::new(header);
        stale
            .lists
            .subject_accepted
            .push(LeaseRelationshipId::new("fed/A", "fed/B"));
        task.handle_recv_message(stale).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn newer_instance_supersedes_remote_agent() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        register(&mut task, "fed/A", false);

        let header = |message_id, sender_instance| LeaseHeader {
            msg_type: LeaseMessageType::LeaseRequest,
            message_id,
            sender_endpoint: "10.0.0.2:9000".into(),
            sender_instance,
            target_instance: 0,
            lease_instance: 1,
            duration_ms: 1000,
            expiration_ms: 1000,
            suspend_duration_ms: 200,
            arbitration_duration_ms: 3000,
            is_two_way_termination: false,
        };
        let mut first = LeaseMessage::new(header(5, 100));
        first
            .lists
            .subject_pending
            .push(LeaseRelationshipId::new("fed/B", "fed/A"));
        task.handle_recv_message(first).unwrap();
        let _ = next_send(&mut rx);

        // restart: higher instance, message id restarts from 1
        let mut second = LeaseMessage::new(header(1, 200));
        second
            .lists
            .subject_pending
            .push(LeaseRelationshipId::new("fed/B", "fed/A"));
        task.handle_recv_message(second).unwrap();
        let (_, reply) = next_send(&mut rx);
        assert_eq!(reply.lists.subject_accepted.len(), 1);

        let rla = task.remotes.get("10.0.0.2:9000").unwrap();
        assert_eq!(rla.remote_instance, 200);
        assert_eq!(task.retired.len(), 1);
        assert!(!task.retired[0].is_active);
    }

    #[tokio::test]
    async fn unregister_terminates_and_drains() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        let (handle, events) = register(&mut task, "fed/A", false);
        task.handle_establish(
            handle,
            "fed/B".into(),
            "10.0.0.2:9000".into(),
            0,
            DurationType::Regular,
        )
        .unwrap();
        let _ = next_send(&mut rx);

        let drain = task.handle_unregister(handle, false).unwrap();
        let drain = drain.unwrap();

        let (_, msg) = next_send(&mut rx);
        assert_eq!(
            msg.lists.subject_terminated,
            vec![LeaseRelationshipId::new("fed/A", "fed/B")]
        );
        assert_eq!(
            msg.lists.monitor_terminated,
            vec![LeaseRelationshipId::new("fed/A", "fed/B")]
        );
        assert!(msg.header.is_two_way_termination);

        // app gone; the receiver holds no undelivered guards
        assert!(task.apps.is_empty());
        drop(events);
        assert_eq!(Arc::strong_count(&drain), 1);
    }

    #[tokio::test]
    async fn arbitration_verdict_paths() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        let (handle, mut events) = register(&mut task, "fed/A", true);
        task.handle_establish(
            handle,
            "fed/B".into(),
            "10.0.0.2:9000".into(),
            777,
            DurationType::Regular,
        )
        .unwrap();
        let _ = next_send(&mut rx);

        // drive the monitor side to Expired and invoke arbitration directly
        let rel_id = LeaseRelationshipId::new("fed/A", "fed/B");
        let li = {
            let rla = task.remotes.get_mut("10.0.0.2:9000").unwrap();
            let rel = rla.relationships.get_mut(&rel_id).unwrap();
            assert!(rel.expire_monitor());
            rel.lease_instance
        };
        task.handle_pre_arbitration_timeout("10.0.0.2:9000", &rel_id, li)
            .unwrap();

        let AppEvent { event, .. } = events.try_recv().unwrap();
        match event {
            LeaseEvent::ArbitrateRequest {
                remote_endpoint,
                remote_app,
                ..
            } => {
                assert_eq!(remote_endpoint, "10.0.0.2:9000");
                assert_eq!(remote_app, "fed/B");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(task.pending_arbitrations.contains_key("10.0.0.2:9000"));

        // a verdict from an application other than the arbitrator is refused
        let (other, _other_events) = register(&mut task, "fed/Z", false);
        let done = task
            .handle_complete_arbitration(
                other,
                "10.0.0.2:9000",
                777,
                TTL_MAX,
                0,
                false,
            )
            .unwrap();
        assert!(!done);
        assert!(task.pending_arbitrations.contains_key("10.0.0.2:9000"));

        // winning verdict: remote declared failed, termination deferred
        let done = task
            .handle_complete_arbitration(
                handle,
                "10.0.0.2:9000",
                777,
                TTL_MAX,
                0,
                false,
            )
            .unwrap();
        assert!(done);
        assert!(task.pending_arbitrations.is_empty());

        let AppEvent { event, .. } = events.try_recv().unwrap();
        assert_eq!(
            event,
            LeaseEvent::RemoteExpired {
                remote_app: "fed/B".into(),
                remote_endpoint: "10.0.0.2:9000".into(),
            }
        );

        // a second verdict with no pending arbitration is refused
        let done = task
            .handle_complete_arbitration(
                handle,
                "10.0.0.2:9000",
                777,
                TTL_MAX,
                0,
                false,
            )
            .unwrap();
        assert!(!done);
    }

    #[tokio::test]
    async fn arbitration_fail_closed() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        let (handle, mut events) = register(&mut task, "fed/A", true);
        task.handle_establish(
            handle,
            "fed/B".into(),
            "10.0.0.2:9000".into(),
            777,
            DurationType::Regular,
        )
        .unwrap();
        let _ = next_send(&mut rx);

        let rel_id = LeaseRelationshipId::new("fed/A", "fed/B");
        let li = {
            let rla = task.remotes.get_mut("10.0.0.2:9000").unwrap();
            let rel = rla.relationships.get_mut(&rel_id).unwrap();
            assert!(rel.expire_monitor());
            rel.lease_instance
        };
        task.handle_pre_arbitration_timeout("10.0.0.2:9000", &rel_id, li)
            .unwrap();
        let _ = events.try_recv().unwrap(); // the ArbitrateRequest

        task.handle_arbitration_timeout("10.0.0.2:9000", &rel_id)
            .unwrap();
        let AppEvent { event, .. } = events.try_recv().unwrap();
        assert_eq!(event, LeaseEvent::LeaseFailed);
        assert_eq!(task.state, AgentState::Failed);
    }

    #[tokio::test]
    async fn remote_failure_declaration_fires_once() {
        let (mut task, mut rx) = test_task("10.0.0.1:9000");
        let (ha, mut events_a) = register(&mut task, "fed/A", false);
        let (hc, mut events_c) = register(&mut task, "fed/C", false);
        task.handle_establish(
            ha,
            "fed/B".into(),
            "10.0.0.2:9000".into(),
            777,
            DurationType::Regular,
        )
        .unwrap();
        task.handle_establish(
            hc,
            "fed/B".into(),
            "10.0.0.2:9000".into(),
            777,
            DurationType::Regular,
        )
        .unwrap();
        let _ = next_send(&mut rx);
        let _ = next_send(&mut rx);

        // walk fed/A's subject side through expiry to local failure; the
        // second relationship keeps the remote agent (and the terminated
        // relationship entry) alive until the next sweep
        let id_a = LeaseRelationshipId::new("fed/A", "fed/B");
        let li = {
            let rla = task.remotes.get_mut("10.0.0.2:9000").unwrap();
            let rel = rla.relationships.get_mut(&id_a).unwrap();
            assert!(rel.expire_subject(Instant::now()));
            rel.lease_instance
        };
        task.handle_subject_fail_timeout("10.0.0.2:9000", &id_a, li)
            .unwrap();
        let _ = next_send(&mut rx); // the failure broadcast
        let AppEvent { event, .. } = events_a.try_recv().unwrap();
        assert_eq!(event, LeaseEvent::LeaseFailed);
        let AppEvent { event, .. } = events_a.try_recv().unwrap();
        assert!(matches!(event, LeaseEvent::HealthReport { .. }));

        let header = |message_id| LeaseHeader {
            msg_type: LeaseMessageType::LeaseRequest,
            message_id,
            sender_endpoint: "10.0.0.2:9000".into(),
            sender_instance: 777,
            target_instance: 0,
            lease_instance: 1,
            duration_ms: 1000,
            expiration_ms: 1000,
            suspend_duration_ms: 200,
            arbitration_duration_ms: 3000,
            is_two_way_termination: false,
        };

        // the peer's crossing declaration for the already-failed
        // relationship must not fire the callback a second time
        let mut crossing = LeaseMessage::new(header(1));
        crossing.lists.monitor_failed.push(id_a.reversed());
        task.handle_recv_message(crossing).unwrap();
        assert!(events_a.try_recv().is_err());

        // a live relationship gets the declaration exactly once
        let id_c = LeaseRelationshipId::new("fed/C", "fed/B");
        let AppEvent { event, .. } = events_c.try_recv().unwrap();
        assert!(matches!(event, LeaseEvent::HealthReport { .. }));
        let mut declared = LeaseMessage::new(header(2));
        declared.lists.monitor_failed.push(id_c.reversed());
        task.handle_recv_message(declared).unwrap();
        let AppEvent { event, .. } = events_c.try_recv().unwrap();
        assert_eq!(event, LeaseEvent::LeaseFailed);

        let mut dup = LeaseMessage::new(header(3));
        dup.lists.monitor_failed.push(id_c.reversed());
        task.handle_recv_message(dup).unwrap();
        assert!(events_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_request_relayed() {
        let (mut task, mut rx) = test_task("10.0.0.3:9000");

        let header = LeaseHeader {
            msg_type: LeaseMessageType::ForwardRequest,
            message_id: 9,
            sender_endpoint: "10.0.0.1:9000".into(),
            sender_instance: 100,
            target_instance: 0,
            lease_instance: 1,
            duration_ms: 1000,
            expiration_ms: 1000,
            suspend_duration_ms: 200,
            arbitration_duration_ms: 3000,
            is_two_way_termination: false,
        };
        let mut msg = LeaseMessage::new(header);
        msg.relay_target = "10.0.0.2:9000".into();
        msg.relay_origin = "10.0.0.1:9000".into();
        msg.lists
            .subject_pending
            .push(LeaseRelationshipId::new("fed/A", "fed/B"));
        task.handle_recv_message(msg).unwrap();

        let (to, relayed) = next_send(&mut rx);
        assert_eq!(to, "10.0.0.2:9000");
        assert_eq!(relayed.header.msg_type, LeaseMessageType::RelayRequest);
        // the target replies back through this relay node
        assert_eq!(relayed.relay_target, "10.0.0.3:9000");
        assert_eq!(relayed.relay_origin, "10.0.0.1:9000");
        // origin's header passes through untouched
        assert_eq!(relayed.header.sender_endpoint, "10.0.0.1:9000");
        assert_eq!(relayed.header.message_id, 9);
    }
}
