//! A call: its lifecycle state, the active media-server session and the
//! read-only view exposed to observers.

mod client;
mod drop_scheduler;
mod registry;

pub use client::CallClient;
pub use drop_scheduler::CallDropScheduler;
pub use registry::{CallRegistry, CallSummary};

use crate::channel::CredentialsProvider;
use crate::config::ClientConfig;
use crate::coordinator::{CoordinatorApi, HttpCoordinatorApi};
use crate::error::CallError;
use crate::lock;
use crate::media::MediaTransportFactory;
use crate::orchestrator::Orchestrator;
use crate::session::{
    Session, SessionConnector, SessionLink, SessionRequest, SfuSessionConnector, SignalSender,
};
use crate::transport::{TokioWebSocketTransportFactory, UreqHttpClient};
use crate::stats_reporter::{CallStatsReport, StatsReporter, StatsSink};
use crate::types::events::{CallingStateChanged, EventBus, StatsReported};
use callcore::backoff::retry_interval;
use callcore::protocol::coordinator::{
    CallResponse, CoordinatorEvent, GetOrCreateCallRequest, GetOrCreateCallResponse,
    JoinCallRequest, MemberResponse, RejectCallRequest, UserRef,
};
use callcore::protocol::sfu::{ReconnectStrategy, TrackSubscription, TrackType};
use callcore::types::call::CallId;
use callcore::types::state::{CallStateMachine, CallTransition, CallingState};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Everything a call needs from the client that owns it.
pub struct CallEnvironment {
    pub config: ClientConfig,
    pub user: UserRef,
    pub coordinator: Arc<dyn CoordinatorApi>,
    pub connector: Arc<dyn SessionConnector>,
    pub stats_sink: Option<Arc<dyn StatsSink>>,
    pub bus: Arc<EventBus>,
}

impl CallEnvironment {
    /// Talks to the coordinator over HTTP and to media servers over
    /// WebSockets. `media` creates the peer connections.
    pub fn with_defaults(
        config: ClientConfig,
        user: UserRef,
        credentials: Arc<dyn CredentialsProvider>,
        media: Arc<dyn MediaTransportFactory>,
    ) -> Self {
        let coordinator = HttpCoordinatorApi::new(
            Arc::new(UreqHttpClient::new()),
            config.coordinator_base_url.clone(),
            config.api_key.clone(),
            config.client_details.clone(),
            credentials,
        );
        let connector = SfuSessionConnector::new(
            Arc::new(TokioWebSocketTransportFactory::new()),
            media,
            config.client_details.clone(),
            config.channel.clone(),
            config.media.clone(),
            config.stats.trace_capacity,
        );
        Self {
            config,
            user,
            coordinator: Arc::new(coordinator),
            connector: Arc::new(connector),
            stats_sink: None,
            bus: Arc::new(EventBus::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RingDirection {
    Incoming,
    Outgoing,
}

/// Read-only view of a call.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub cid: String,
    pub calling_state: CallingState,
    pub session: Option<Session>,
    pub stats: Option<CallStatsReport>,
    pub last_error: Option<CallError>,
    pub metadata: Option<CallResponse>,
    pub own_capabilities: Vec<String>,
    pub ring: Option<RingDirection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOptions {
    /// Create the call if it does not exist yet.
    pub create: bool,
    /// Ring the other members once joined.
    pub ring: bool,
}

/// How a terminated ringing call is reported back to the coordinator.
pub(crate) enum RingResponse {
    /// Decline an incoming ring, cancel an outgoing one.
    Default,
    Reject(Option<String>),
    /// The coordinator already knows.
    Silent,
}

pub(crate) struct CallInner {
    pub(crate) machine: CallStateMachine,
    pub(crate) session: Option<Arc<dyn SessionLink>>,
    /// Session id of the link a join attempt is still setting up.
    pub(crate) joining: Option<String>,
    pub(crate) reporter: Option<StatsReporter>,
    pub(crate) published: Vec<TrackType>,
    pub(crate) subscriptions: Vec<TrackSubscription>,
    pub(crate) join_options: JoinOptions,
    pub(crate) orchestrator: Orchestrator,
    metadata: Option<CallResponse>,
    members: Vec<String>,
    rejected_by: HashSet<String>,
    capabilities: Vec<String>,
    pub(crate) last_error: Option<CallError>,
    ring: Option<RingDirection>,
}

pub struct Call {
    id: CallId,
    cid: String,
    pub(crate) env: Arc<CallEnvironment>,
    pub(crate) this: Weak<Call>,
    registry: Weak<CallRegistry>,
    drops: CallDropScheduler,
    inner: Mutex<CallInner>,
    snapshot: watch::Sender<CallSnapshot>,
    /// Bumped whenever in-flight work must stop having effects.
    epoch: watch::Sender<u64>,
    signals: SignalSender,
    signal_task: AbortHandle,
}

impl Drop for Call {
    fn drop(&mut self) {
        self.signal_task.abort();
    }
}

impl Call {
    pub fn new(id: CallId, env: Arc<CallEnvironment>, registry: Weak<CallRegistry>) -> Arc<Self> {
        let cid = id.cid();
        let (signals, signals_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this: &Weak<Call>| {
            let signal_task = tokio::spawn(Self::signal_loop(this.clone(), signals_rx)).abort_handle();
            Self {
                drops: CallDropScheduler::new(env.config.ring.clone(), registry.clone()),
                inner: Mutex::new(CallInner {
                    machine: CallStateMachine::new(),
                    session: None,
                    joining: None,
                    reporter: None,
                    published: Vec::new(),
                    subscriptions: Vec::new(),
                    join_options: JoinOptions::default(),
                    orchestrator: Orchestrator::new(env.config.reconnect.clone(), &env.config.stats),
                    metadata: None,
                    members: Vec::new(),
                    rejected_by: HashSet::new(),
                    capabilities: Vec::new(),
                    last_error: None,
                    ring: None,
                }),
                snapshot: watch::Sender::new(CallSnapshot {
                    cid: cid.clone(),
                    calling_state: CallingState::Idle,
                    session: None,
                    stats: None,
                    last_error: None,
                    metadata: None,
                    own_capabilities: Vec::new(),
                    ring: None,
                }),
                epoch: watch::Sender::new(0),
                id,
                cid,
                env,
                this: this.clone(),
                registry,
                signals,
                signal_task,
            }
        })
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Subscribes to the call's read-only view.
    pub fn state(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn calling_state(&self) -> CallingState {
        self.snapshot.borrow().calling_state
    }

    pub fn last_error(&self) -> Option<CallError> {
        self.snapshot.borrow().last_error.clone()
    }

    async fn signal_loop(this: Weak<Call>, mut signals: mpsc::UnboundedReceiver<(String, crate::session::SessionSignal)>) {
        while let Some((session_id, signal)) = signals.recv().await {
            let Some(call) = this.upgrade() else { break };
            call.on_session_signal(&session_id, signal);
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, CallInner> {
        lock(&self.inner)
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.send_modify(|epoch| *epoch += 1);
        self.current_epoch()
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    pub(crate) fn ensure_current(&self, epoch: u64) -> Result<(), CallError> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    /// Resolves once `epoch` is no longer the current attempt.
    pub(crate) async fn superseded(&self, epoch: u64) {
        let mut epochs = self.epoch.subscribe();
        let _ = epochs.wait_for(|current| *current != epoch).await;
    }

    /// Sleeps for `delay` unless the attempt is superseded first.
    pub(crate) async fn sleep_unless_superseded(&self, delay: Duration, epoch: u64) -> Result<(), CallError> {
        self.ensure_current(epoch)?;
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.superseded(epoch) => Err(CallError::Cancelled),
        }
    }

    /// Applies `transition` and notifies the registry, the bus and the
    /// snapshot, once each.
    pub(crate) fn transition(
        &self,
        inner: &mut CallInner,
        transition: CallTransition,
    ) -> Result<CallingState, CallError> {
        let previous = inner.machine.state();
        let current = inner.machine.apply_transition(transition)?;
        if previous != current {
            debug!(target: "Call", "[{}] {previous} -> {current} ({transition:?})", self.cid);
            if let Some(registry) = self.registry.upgrade() {
                if current.is_left() {
                    registry.remove(&self.cid);
                } else {
                    registry.set_state(&self.cid, current);
                }
            }
            let _ = self
                .env
                .bus
                .calling_state_changed
                .send(Arc::new(CallingStateChanged {
                    cid: self.cid.clone(),
                    previous,
                    current,
                }));
        }
        self.commit(inner);
        Ok(current)
    }

    /// Publishes the current inner state to the snapshot.
    pub(crate) fn commit(&self, inner: &CallInner) {
        let session = inner.session.as_ref().map(|link| link.session());
        self.snapshot.send_modify(|snapshot| {
            snapshot.calling_state = inner.machine.state();
            snapshot.session = session;
            snapshot.last_error = inner.last_error.clone();
            snapshot.metadata = inner.metadata.clone();
            snapshot.own_capabilities = inner.capabilities.clone();
            snapshot.ring = inner.ring;
        });
    }

    pub(crate) fn tracks(&self) -> (Vec<TrackType>, Vec<TrackSubscription>) {
        let inner = self.lock_inner();
        (inner.published.clone(), inner.subscriptions.clone())
    }

    /// Asks the coordinator for credentials and connects to the media server
    /// it picked. `edge` receives the server's edge name as soon as it is
    /// known, so failures can be attributed to it.
    pub(crate) async fn open_session(
        &self,
        epoch: u64,
        request: &JoinCallRequest,
        strategy: ReconnectStrategy,
        previous: Option<Session>,
        attempt: u32,
        edge: &mut Option<String>,
    ) -> Result<Arc<dyn SessionLink>, CallError> {
        let response = self.env.coordinator.join_call(&self.id, request).await?;
        self.ensure_current(epoch)?;
        *edge = Some(response.credentials.server.edge_name.clone());
        {
            let mut inner = self.lock_inner();
            inner.metadata = Some(response.call.clone());
            inner.capabilities = response.own_capabilities.clone();
            inner.members = member_ids(&response.members);
            self.commit(&inner);
        }

        let link = self
            .env
            .connector
            .connect(SessionRequest {
                call_cid: self.cid.clone(),
                credentials: response.credentials,
                strategy,
                previous,
                migrating_from: request.migrating_from.clone(),
                reconnect_attempt: attempt,
                signals: self.signals.clone(),
            })
            .await?;
        if let Err(e) = self.ensure_current(epoch) {
            link.close("superseded").await;
            return Err(e);
        }
        Ok(link)
    }

    /// Makes `link` the active session through `transition`, closing the one
    /// it replaces. A superseded attempt closes `link` instead.
    pub(crate) async fn install(
        &self,
        epoch: u64,
        link: Arc<dyn SessionLink>,
        transition: CallTransition,
    ) -> Result<(), CallError> {
        let installed = {
            let mut inner = self.lock_inner();
            if !self.is_current(epoch) {
                Err(CallError::Cancelled)
            } else {
                let previous = inner.session.replace(link.clone());
                match self.transition(&mut inner, transition) {
                    Ok(_) => {
                        inner.reporter = Some(self.start_stats(link.as_ref()));
                        inner.orchestrator.on_session_established();
                        self.commit(&inner);
                        Ok(previous)
                    }
                    Err(e) => {
                        inner.session = previous;
                        Err(e)
                    }
                }
            }
        };
        match installed {
            Ok(previous) => {
                if let Some(previous) = previous {
                    if !Arc::ptr_eq(&previous, &link) {
                        previous.close("replaced").await;
                    }
                }
                Ok(())
            }
            Err(e) => {
                link.close("superseded").await;
                Err(e)
            }
        }
    }

    /// Starts sampling `link` with a fresh baseline.
    pub(crate) fn start_stats(&self, link: &dyn SessionLink) -> StatsReporter {
        let session_id = link.session().session_id;
        let this = self.this.clone();
        let reported_session = session_id.clone();
        StatsReporter::start(
            session_id,
            link.media_transports(),
            self.env.config.stats.clone(),
            self.env.stats_sink.clone(),
            self.signals.clone(),
            Arc::new(move |report| {
                if let Some(call) = this.upgrade() {
                    call.on_stats_report(&reported_session, report);
                }
            }),
        )
    }

    fn on_stats_report(&self, session_id: &str, report: CallStatsReport) {
        let current = self
            .snapshot
            .borrow()
            .session
            .as_ref()
            .is_some_and(|session| session.session_id == session_id);
        if !current {
            return;
        }
        self.snapshot
            .send_modify(|snapshot| snapshot.stats = Some(report.clone()));
        let _ = self.env.bus.stats_report.send(Arc::new(StatsReported {
            cid: self.cid.clone(),
            report,
        }));
    }

    /// Joins the call, retrying failed attempts.
    pub async fn join(&self, options: JoinOptions) -> Result<(), CallError> {
        let epoch = {
            let mut inner = self.lock_inner();
            let state = inner.machine.state();
            if matches!(
                state,
                CallingState::Joined | CallingState::Joining | CallingState::Reconnecting | CallingState::Migrating
            ) {
                return Err(CallError::IllegalState(format!("call is already {state}")));
            }
            self.transition(&mut inner, CallTransition::Join)?;
            inner.last_error = None;
            inner.ring = None;
            inner.join_options = options.clone();
            self.commit(&inner);
            self.current_epoch()
        };
        info!(target: "Call", "[{}] Joining", self.cid);

        match self.join_with_retries(epoch, &options).await {
            Ok(()) => {
                info!(target: "Call", "[{}] Joined", self.cid);
                Ok(())
            }
            Err(CallError::Cancelled)
                if matches!(self.calling_state(), CallingState::Reconnecting | CallingState::Joined) =>
            {
                self.await_recovery().await
            }
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(error) => {
                let mut inner = self.lock_inner();
                if self.is_current(epoch) {
                    inner.last_error = Some(error.clone());
                    self.transition(&mut inner, CallTransition::JoinFailed)?;
                }
                Err(error)
            }
        }
    }

    /// Waits for a recovery that took over from a join and reports how it ended.
    async fn await_recovery(&self) -> Result<(), CallError> {
        let mut snapshots = self.snapshot.subscribe();
        let settled = snapshots
            .wait_for(|s| s.calling_state != CallingState::Reconnecting)
            .await
            .map(|s| (s.calling_state, s.last_error.clone()));
        match settled {
            Ok((CallingState::Joined, _)) => {
                info!(target: "Call", "[{}] Joined after recovering", self.cid);
                Ok(())
            }
            Ok((_, Some(error))) => Err(error),
            _ => Err(CallError::Cancelled),
        }
    }

    async fn join_with_retries(&self, epoch: u64, options: &JoinOptions) -> Result<(), CallError> {
        let max_attempts = self.env.config.max_join_retries.max(1);
        let mut failures_per_edge: HashMap<String, u32> = HashMap::new();
        let mut migrating_from = None;
        let mut attempt = 0;
        loop {
            let mut edge = None;
            let request = JoinCallRequest {
                create: options.create,
                ring: options.ring,
                migrating_from: migrating_from.clone(),
                location: None,
            };
            let error = match self.join_once(epoch, &request, attempt, &mut edge).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if matches!(error, CallError::Cancelled) || error.is_unrecoverable() {
                return Err(error);
            }

            attempt += 1;
            if let Some(edge) = edge {
                let failures = failures_per_edge.entry(edge.clone()).or_default();
                *failures += 1;
                // Ask for another server once this one failed twice.
                if *failures >= 2 {
                    migrating_from = Some(edge);
                }
            }
            if attempt >= max_attempts {
                return Err(error);
            }
            warn!(target: "Call", "[{}] Join attempt {attempt} failed, retrying: {error}", self.cid);
            self.sleep_unless_superseded(retry_interval(attempt), epoch).await?;
        }
    }

    async fn join_once(
        &self,
        epoch: u64,
        request: &JoinCallRequest,
        attempt: u32,
        edge: &mut Option<String>,
    ) -> Result<(), CallError> {
        let link = self
            .open_session(epoch, request, ReconnectStrategy::Unspecified, None, attempt, edge)
            .await?;
        let session_id = link.session().session_id;
        self.lock_inner().joining = Some(session_id.clone());
        let _pending = scopeguard::guard((), |_| {
            let mut inner = self.lock_inner();
            if inner.joining.as_deref() == Some(session_id.as_str()) {
                inner.joining = None;
            }
        });

        let (published, subscriptions) = self.tracks();
        if !published.is_empty() || !subscriptions.is_empty() {
            let restored = tokio::select! {
                restored = link.restore_tracks(&published, &subscriptions) => restored.map(|_| ()),
                _ = self.superseded(epoch) => Err(CallError::Cancelled),
            };
            if let Err(e) = restored {
                link.close("join failed").await;
                return Err(e);
            }
        }
        self.install(epoch, link, CallTransition::SessionEstablished).await
    }

    /// Creates the call if needed without joining it.
    pub async fn get_or_create(&self, members: Vec<String>) -> Result<GetOrCreateCallResponse, CallError> {
        let request = GetOrCreateCallRequest {
            ring: false,
            video: false,
            members,
        };
        let response = self.env.coordinator.get_or_create_call(&self.id, &request).await?;
        let mut inner = self.lock_inner();
        self.update_metadata(&mut inner, &response.call, &response.members);
        Ok(response)
    }

    /// Rings `members`. The call stays in `ringing` until someone joins,
    /// everybody rejects, or the ring times out.
    pub async fn ring(&self, members: Vec<String>, video: bool) -> Result<GetOrCreateCallResponse, CallError> {
        let epoch = {
            let inner = self.lock_inner();
            let state = inner.machine.state();
            if state != CallingState::Idle {
                return Err(CallError::IllegalState(format!("cannot ring from {state}")));
            }
            self.current_epoch()
        };
        let request = GetOrCreateCallRequest {
            ring: true,
            video,
            members,
        };
        let response = self.env.coordinator.get_or_create_call(&self.id, &request).await?;
        {
            let mut inner = self.lock_inner();
            self.ensure_current(epoch)?;
            self.update_metadata(&mut inner, &response.call, &response.members);
            inner.ring = Some(RingDirection::Outgoing);
            self.transition(&mut inner, CallTransition::Ring)?;
        }
        if let Some(this) = self.this.upgrade() {
            self.drops.schedule(&this, RingDirection::Outgoing);
        }
        Ok(response)
    }

    /// Accepts an incoming ring and joins.
    pub async fn accept(&self) -> Result<(), CallError> {
        let state = self.calling_state();
        if state != CallingState::Ringing {
            return Err(CallError::IllegalState(format!("cannot accept from {state}")));
        }
        self.env.coordinator.accept_call(&self.id).await?;
        self.join(JoinOptions::default()).await
    }

    /// Rejects a ringing call and leaves it.
    pub async fn reject(&self, reason: Option<String>) -> Result<(), CallError> {
        let state = self.calling_state();
        if state != CallingState::Ringing {
            return Err(CallError::IllegalState(format!("cannot reject from {state}")));
        }
        self.terminate("rejected", RingResponse::Reject(reason)).await
    }

    /// Leaves the call. The state is `left` before this returns; anything
    /// still in flight for the call is cancelled.
    pub async fn leave(&self, reason: &str) -> Result<(), CallError> {
        self.terminate(reason, RingResponse::Default).await
    }

    /// Ends the call for everyone, then leaves it.
    pub async fn end(&self) -> Result<(), CallError> {
        self.env.coordinator.end_call(&self.id).await?;
        self.terminate("call ended", RingResponse::Silent).await
    }

    pub(crate) async fn terminate(&self, reason: &str, response: RingResponse) -> Result<(), CallError> {
        let (previous, ring, session) = {
            let mut inner = self.lock_inner();
            let previous = inner.machine.state();
            if previous.is_left() {
                return Ok(());
            }
            self.bump_epoch();
            inner.reporter = None;
            let session = inner.session.take();
            self.transition(&mut inner, CallTransition::Leave)?;
            (previous, inner.ring, session)
        };
        self.signal_task.abort();
        info!(target: "Call", "[{}] Left: {reason}", self.cid);

        if previous == CallingState::Ringing {
            let reject_reason = match response {
                RingResponse::Default => Some(Some(
                    match ring {
                        Some(RingDirection::Outgoing) => "cancel",
                        _ => "decline",
                    }
                    .to_string(),
                )),
                RingResponse::Reject(reason) => Some(reason),
                RingResponse::Silent => None,
            };
            if let Some(reason) = reject_reason {
                if let Err(e) = self
                    .env
                    .coordinator
                    .reject_call(&self.id, &RejectCallRequest { reason })
                    .await
                {
                    warn!(target: "Call", "[{}] Failed to reject: {e}", self.cid);
                }
            }
        }
        if let Some(session) = session {
            session.close(reason).await;
        }
        Ok(())
    }

    /// Connectivity signal from the host. Calls holding a session go
    /// `offline` and recover once the network is back.
    pub fn set_network_available(&self, online: bool) {
        let mut inner = self.lock_inner();
        let state = inner.machine.state();
        if !online {
            if !matches!(
                state,
                CallingState::Joining | CallingState::Joined | CallingState::Reconnecting | CallingState::Migrating
            ) {
                return;
            }
            self.bump_epoch();
            if self.transition(&mut inner, CallTransition::NetworkLost).is_ok() {
                inner.reporter = None;
                inner.orchestrator.went_offline();
                info!(target: "Call", "[{}] Network lost", self.cid);
            }
        } else if state == CallingState::Offline {
            let strategy = inner.orchestrator.came_online();
            drop(inner);
            info!(target: "Call", "[{}] Network is back, recovering with {strategy:?}", self.cid);
            self.spawn_reconnect(strategy);
        }
    }

    /// Replaces the published tracks. A failed negotiation leaves the
    /// previous set in place.
    pub async fn publish(&self, tracks: Vec<TrackType>) -> Result<(), CallError> {
        let (previous, link) = {
            let mut inner = self.lock_inner();
            let previous = std::mem::replace(&mut inner.published, tracks.clone());
            (previous, inner.session.clone())
        };
        if let Some(link) = link {
            if let Err(e) = link.publish(&tracks).await {
                self.lock_inner().published = previous;
                return Err(e);
            }
            let inner = self.lock_inner();
            self.commit(&inner);
        }
        Ok(())
    }

    pub async fn update_subscriptions(&self, subscriptions: Vec<TrackSubscription>) -> Result<(), CallError> {
        let (previous, link) = {
            let mut inner = self.lock_inner();
            let previous = std::mem::replace(&mut inner.subscriptions, subscriptions.clone());
            (previous, inner.session.clone())
        };
        if let Some(link) = link {
            if let Err(e) = link.update_subscriptions(&subscriptions).await {
                self.lock_inner().subscriptions = previous;
                return Err(e);
            }
            let inner = self.lock_inner();
            self.commit(&inner);
        }
        Ok(())
    }

    fn update_metadata(&self, inner: &mut CallInner, call: &CallResponse, members: &[MemberResponse]) {
        inner.metadata = Some(call.clone());
        if !members.is_empty() {
            inner.members = member_ids(members);
        }
        self.commit(inner);
    }

    /// Rings this call from the other side. Repeated rings and the
    /// `created`/`ring` pair in either order end up in one `ringing` state.
    fn ring_incoming(&self) {
        {
            let mut inner = self.lock_inner();
            if inner.machine.state() != CallingState::Idle {
                return;
            }
            inner.ring = Some(RingDirection::Incoming);
            if self.transition(&mut inner, CallTransition::Ring).is_err() {
                inner.ring = None;
                return;
            }
        }
        info!(target: "Call", "[{}] Incoming ring", self.cid);
        if let Some(this) = self.this.upgrade() {
            self.drops.schedule(&this, RingDirection::Incoming);
        }
    }

    /// Applies one coordinator event addressed to this call. `me` is the id
    /// of the local user.
    pub(crate) async fn handle_coordinator_event(&self, event: &CoordinatorEvent, me: &str) {
        match event {
            CoordinatorEvent::CallCreated { call, members, .. } => {
                self.update_metadata(&mut self.lock_inner(), call, members);
                if call.ringing && call.created_by.id != me {
                    self.ring_incoming();
                }
            }
            CoordinatorEvent::CallRing { call, members, .. } => {
                self.update_metadata(&mut self.lock_inner(), call, members);
                if call.created_by.id != me {
                    self.ring_incoming();
                }
            }
            CoordinatorEvent::CallAccepted { user, call, .. } => {
                self.update_metadata(&mut self.lock_inner(), call, &[]);
                debug!(target: "Call", "[{}] Accepted by {}", self.cid, user.id);
            }
            CoordinatorEvent::CallRejected { user, call, .. } => {
                let leave = {
                    let mut inner = self.lock_inner();
                    self.update_metadata(&mut inner, call, &[]);
                    self.rejection_ends_ring(&mut inner, &user.id, &call.created_by.id, me)
                };
                if leave {
                    let _ = self.terminate("rejected", RingResponse::Silent).await;
                }
            }
            CoordinatorEvent::CallEnded { reason, .. } => {
                let reason = reason.as_deref().unwrap_or("call ended");
                let _ = self.terminate(reason, RingResponse::Silent).await;
            }
            CoordinatorEvent::CallUpdated { call, .. } => {
                self.update_metadata(&mut self.lock_inner(), call, &[]);
            }
            CoordinatorEvent::CallPermissionsUpdated {
                user,
                own_capabilities,
                ..
            } if user.id == me => {
                let mut inner = self.lock_inner();
                inner.capabilities = own_capabilities.clone();
                self.commit(&inner);
            }
            _ => {}
        }
    }

    /// An incoming ring ends when the caller cancels or the local user
    /// rejects on another device; an outgoing one once every callee rejected.
    fn rejection_ends_ring(&self, inner: &mut CallInner, rejected_by: &str, creator: &str, me: &str) -> bool {
        if inner.machine.state() != CallingState::Ringing {
            return false;
        }
        match inner.ring {
            Some(RingDirection::Incoming) => rejected_by == me || rejected_by == creator,
            Some(RingDirection::Outgoing) => {
                inner.rejected_by.insert(rejected_by.to_string());
                let mut callees = inner.members.iter().filter(|id| id.as_str() != me).peekable();
                callees.peek().is_some() && callees.all(|id| inner.rejected_by.contains(id))
            }
            None => false,
        }
    }
}

fn member_ids(members: &[MemberResponse]) -> Vec<String> {
    members.iter().map(|member| member.user.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Credentials, StaticCredentials};
    use crate::media::{MediaEvent, MediaTransport, PeerSide};
    use async_trait::async_trait;

    struct NoMedia;

    #[async_trait]
    impl MediaTransportFactory for NoMedia {
        async fn create(
            &self,
            _side: PeerSide,
        ) -> anyhow::Result<(Arc<dyn MediaTransport>, mpsc::Receiver<MediaEvent>)> {
            anyhow::bail!("no media in this test")
        }
    }

    #[tokio::test]
    async fn default_environment_starts_idle_calls() {
        let env = CallEnvironment::with_defaults(
            ClientConfig::default(),
            UserRef::new("alice"),
            Arc::new(StaticCredentials(Credentials::new("token"))),
            Arc::new(NoMedia),
        );
        let client = CallClient::new(env);

        let call = client.call("default", "lobby");

        assert_eq!(call.cid(), "default:lobby");
        assert_eq!(call.calling_state(), CallingState::Idle);
        assert_eq!(client.registry().len(), 1);
        let snapshot = call.state().borrow().clone();
        assert!(snapshot.session.is_none());
        assert!(snapshot.last_error.is_none());
    }
}
