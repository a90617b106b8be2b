#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use video_call::call::{Call, CallClient, CallEnvironment};
use video_call::coordinator::CoordinatorApi;
use video_call::media::{PeerSide, TracedMediaTransport};
use video_call::protocol::coordinator::{
    CallResponse, GetOrCreateCallRequest, GetOrCreateCallResponse, JoinCallRequest, JoinCallResponse,
    RejectCallRequest, UserRef,
};
use video_call::protocol::sfu::{ReconnectStrategy, TrackSubscription, TrackType};
use video_call::session::{
    RestoreOutcome, Session, SessionConnector, SessionLink, SessionRequest, SessionSignal, SignalSender,
};
use video_call::transport::{Transport, TransportEvent, TransportFactory};
use video_call::types::call::CallId;
use video_call::types::events::EventBus;
use video_call::types::state::CallingState;
use video_call::{CallError, ClientConfig};

pub const ME: &str = "alice";

pub fn call_json(id: &str, created_by: &str, ringing: bool) -> Value {
    json!({
        "cid": format!("default:{id}"),
        "id": id,
        "type": "default",
        "created_by": {"id": created_by},
        "ringing": ringing,
    })
}

fn call_response(call: &CallId) -> CallResponse {
    serde_json::from_value(call_json(&call.id, ME, false)).unwrap()
}

/// Coordinator double: hands out credentials for scripted edges and records
/// every request.
pub struct ScriptedCoordinator {
    joins: Mutex<Vec<JoinCallRequest>>,
    rejects: Mutex<Vec<Option<String>>>,
    accepts: AtomicU32,
    edges: Mutex<VecDeque<String>>,
    join_failures: Mutex<VecDeque<CallError>>,
}

impl ScriptedCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            rejects: Mutex::new(Vec::new()),
            accepts: AtomicU32::new(0),
            edges: Mutex::new(VecDeque::new()),
            join_failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Edges for the next joins, in order. The last one keeps being used.
    pub fn with_edges(self: Arc<Self>, edges: &[&str]) -> Arc<Self> {
        *self.edges.lock().unwrap() = edges.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn fail_next_join(&self, error: CallError) {
        self.join_failures.lock().unwrap().push_back(error);
    }

    pub fn joins(&self) -> Vec<JoinCallRequest> {
        self.joins.lock().unwrap().clone()
    }

    pub fn rejects(&self) -> Vec<Option<String>> {
        self.rejects.lock().unwrap().clone()
    }

    pub fn accepts(&self) -> u32 {
        self.accepts.load(Ordering::SeqCst)
    }

    fn next_edge(&self) -> String {
        let mut edges = self.edges.lock().unwrap();
        match edges.len() {
            0 => "edge-1".to_string(),
            1 => edges[0].clone(),
            _ => edges.pop_front().unwrap(),
        }
    }
}

#[async_trait]
impl CoordinatorApi for ScriptedCoordinator {
    async fn get_or_create_call(
        &self,
        call: &CallId,
        request: &GetOrCreateCallRequest,
    ) -> Result<GetOrCreateCallResponse, CallError> {
        let members: Vec<Value> = request
            .members
            .iter()
            .chain(std::iter::once(&ME.to_string()))
            .map(|id| json!({"user": {"id": id}}))
            .collect();
        Ok(serde_json::from_value(json!({
            "call": call_json(&call.id, ME, request.ring),
            "members": members,
            "created": true,
        }))
        .unwrap())
    }

    async fn join_call(&self, call: &CallId, request: &JoinCallRequest) -> Result<JoinCallResponse, CallError> {
        self.joins.lock().unwrap().push(request.clone());
        if let Some(error) = self.join_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let edge = self.next_edge();
        Ok(serde_json::from_value(json!({
            "call": serde_json::to_value(call_response(call)).unwrap(),
            "credentials": {
                "server": {
                    "url": format!("https://{edge}.example.com"),
                    "ws_endpoint": format!("wss://{edge}.example.com/ws"),
                    "edge_name": edge,
                },
                "token": "sfu-token",
            },
            "own_capabilities": ["send-audio", "send-video"],
        }))
        .unwrap())
    }

    async fn accept_call(&self, _call: &CallId) -> Result<(), CallError> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject_call(&self, _call: &CallId, request: &RejectCallRequest) -> Result<(), CallError> {
        self.rejects.lock().unwrap().push(request.reason.clone());
        Ok(())
    }

    async fn end_call(&self, _call: &CallId) -> Result<(), CallError> {
        Ok(())
    }
}

/// How the next session behaves.
#[derive(Clone)]
pub struct LinkScript {
    pub connect_error: Option<CallError>,
    pub resume_ok: bool,
    pub restore: RestoreOutcome,
    pub media_flows: bool,
    pub healthy: bool,
    /// Restoring tracks waits for this before returning.
    pub restore_gate: Option<Arc<Notify>>,
}

impl Default for LinkScript {
    fn default() -> Self {
        Self {
            connect_error: None,
            resume_ok: true,
            restore: RestoreOutcome::Identical,
            media_flows: true,
            healthy: true,
            restore_gate: None,
        }
    }
}

impl LinkScript {
    pub fn failing() -> Self {
        Self {
            connect_error: Some(CallError::Transport("media server unreachable".into())),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub strategy: ReconnectStrategy,
    pub edge: String,
    pub migrating_from: Option<String>,
    pub previous_session: Option<String>,
}

pub struct FakeLink {
    pub session_id: String,
    pub edge: String,
    script: LinkScript,
    signals: SignalSender,
    closed: AtomicBool,
    resumes: AtomicU32,
    restored: Mutex<Vec<Vec<TrackType>>>,
    started_at: chrono::DateTime<Utc>,
}

impl FakeLink {
    /// Raises `signal` as this session would.
    pub fn signal(&self, signal: SessionSignal) {
        let _ = self.signals.send((self.session_id.clone(), signal));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> u32 {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn restored(&self) -> Vec<Vec<TrackType>> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionLink for FakeLink {
    fn session(&self) -> Session {
        Session {
            session_id: self.session_id.clone(),
            edge_name: self.edge.clone(),
            started_at: self.started_at,
            published_tracks: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    fn is_healthy(&self) -> bool {
        self.script.healthy
    }

    async fn resume(&self, _attempt: u32) -> Result<(), CallError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        if self.script.resume_ok {
            Ok(())
        } else {
            Err(CallError::Transport("resume refused".into()))
        }
    }

    async fn restore_tracks(
        &self,
        published: &[TrackType],
        _subscriptions: &[TrackSubscription],
    ) -> Result<RestoreOutcome, CallError> {
        self.restored.lock().unwrap().push(published.to_vec());
        if let Some(gate) = &self.script.restore_gate {
            gate.notified().await;
        }
        Ok(self.script.restore)
    }

    async fn await_media_flow(&self, _subscriptions: &[TrackSubscription]) -> Result<(), CallError> {
        if !self.script.media_flows {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn publish(&self, _tracks: &[TrackType]) -> Result<(), CallError> {
        Ok(())
    }

    async fn update_subscriptions(&self, _subscriptions: &[TrackSubscription]) -> Result<(), CallError> {
        Ok(())
    }

    fn media_transports(&self) -> Vec<(PeerSide, Arc<TracedMediaTransport>)> {
        Vec::new()
    }

    async fn close(&self, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connects scripted sessions and keeps every one it created.
pub struct FakeConnector {
    scripts: Mutex<VecDeque<LinkScript>>,
    requests: Mutex<Vec<RecordedRequest>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
    hold: Mutex<Option<Arc<Notify>>>,
    counter: AtomicU32,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
            counter: AtomicU32::new(0),
        })
    }

    /// Scripts for the next connects, in order; later ones use the default.
    pub fn script(&self, scripts: Vec<LinkScript>) {
        self.scripts.lock().unwrap().extend(scripts);
    }

    /// Makes connects wait until the returned notify fires.
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, request: SessionRequest) -> Result<Arc<dyn SessionLink>, CallError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            strategy: request.strategy,
            edge: request.credentials.server.edge_name.clone(),
            migrating_from: request.migrating_from.clone(),
            previous_session: request.previous.as_ref().map(|s| s.session_id.clone()),
        });
        let hold = self.hold.lock().unwrap().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        if let Some(error) = script.connect_error.clone() {
            return Err(error);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Arc::new(FakeLink {
            session_id: format!("session-{n}"),
            edge: request.credentials.server.edge_name.clone(),
            script,
            signals: request.signals,
            closed: AtomicBool::new(false),
            resumes: AtomicU32::new(0),
            restored: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

/// Short delays so recovery scenarios finish quickly in paused time.
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.reconnect.initial_delay = Duration::from_millis(10);
    config.reconnect.max_delay = Duration::from_millis(50);
    config.reconnect.jitter = false;
    config.reconnect.migration_timeout = Duration::from_secs(1);
    config.stats.interval = Duration::from_secs(60);
    config.ring.auto_reject_timeout = Duration::ZERO;
    config.ring.auto_cancel_timeout = Duration::ZERO;
    config
}

pub struct Harness {
    pub client: Arc<CallClient>,
    pub coordinator: Arc<ScriptedCoordinator>,
    pub connector: Arc<FakeConnector>,
}

pub fn harness(config: ClientConfig) -> Harness {
    harness_with(config, ScriptedCoordinator::new())
}

pub fn harness_with(config: ClientConfig, coordinator: Arc<ScriptedCoordinator>) -> Harness {
    let connector = FakeConnector::new();
    let client = CallClient::new(CallEnvironment {
        config,
        user: UserRef::new(ME),
        coordinator: coordinator.clone(),
        connector: connector.clone(),
        stats_sink: None,
        bus: Arc::new(EventBus::new()),
    });
    Harness {
        client,
        coordinator,
        connector,
    }
}

pub async fn wait_for_state(call: &Call, state: CallingState) {
    let mut snapshots = call.state();
    let reached = tokio::time::timeout(
        Duration::from_secs(30),
        snapshots.wait_for(|snapshot| snapshot.calling_state == state),
    )
    .await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "call never reached {state}, stuck in {}",
        call.calling_state()
    );
}

pub async fn next_event<T: Clone>(events: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("no event within 30s")
        .expect("event bus closed")
}

pub fn drain<T: Clone>(events: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Coordinator push endpoint: accepts any token and lets the test push
/// events to the latest connection.
pub struct CoordinatorServer {
    connections: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

struct ServerSideTransport {
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for ServerSideTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let message: Value = serde_json::from_slice(data)?;
        if message.get("token").is_some() {
            let ok = json!({"type": "connection.ok", "connection_id": "conn-1"});
            let _ = self
                .events
                .send(TransportEvent::DataReceived(Bytes::from(ok.to_string())))
                .await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.events.send(TransportEvent::Disconnected).await;
    }
}

impl CoordinatorServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
        })
    }

    pub async fn push(&self, event: Value) {
        let latest = self.connections.lock().unwrap().last().cloned();
        if let Some(events) = latest {
            let _ = events
                .send(TransportEvent::DataReceived(Bytes::from(event.to_string())))
                .await;
        }
    }
}

#[async_trait]
impl TransportFactory for CoordinatorServer {
    async fn create_transport(
        &self,
        _endpoint: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (events_tx, events_rx) = mpsc::channel(32);
        let _ = events_tx.send(TransportEvent::Connected).await;
        self.connections.lock().unwrap().push(events_tx.clone());
        Ok((Arc::new(ServerSideTransport { events: events_tx }), events_rx))
    }
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn event(value: Value) -> video_call::protocol::coordinator::CoordinatorEvent {
    serde_json::from_value(value).unwrap()
}
