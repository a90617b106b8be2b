//! A reconnecting duplex message channel.
//!
//! A [`TransportChannel`] owns one logical connection to a signaling
//! endpoint. Physical connections come from a [`TransportFactory`]; each one
//! gets a new generation number and anything still queued from an older
//! generation is dropped instead of delivered. Inbound messages reach
//! handlers in receipt order through a single dispatcher task.

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::lock;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use callcore::backoff::retry_interval;
use log::{debug, info, trace, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Supplies tokens to a channel. `refresh` is called once after the server
/// reports the current token as expired.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn current(&self) -> Result<Credentials, ChannelError>;
    async fn refresh(&self) -> Result<Credentials, ChannelError>;
}

/// A fixed token that cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn current(&self) -> Result<Credentials, ChannelError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<Credentials, ChannelError> {
        Err(ChannelError::AuthExpired)
    }
}

/// What the channel itself makes of an inbound message.
#[derive(Debug, Clone)]
pub enum InboundClass {
    /// The server accepted the auth message.
    ConnectionOk,
    /// The server refused the connection.
    ConnectionError(ChannelError),
    HealthCheck,
    Event,
}

/// Message schema and handshake of one kind of channel.
pub trait ChannelProtocol: Send + Sync + 'static {
    const NAME: &'static str;

    type Outbound: Serialize + Send + Sync;
    type Inbound: DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Sent right after the transport opens. When `None` the channel counts
    /// as connected as soon as the transport is up.
    fn auth_message(&self, credentials: &Credentials) -> Option<Self::Outbound>;

    fn keepalive_message(&self) -> Self::Outbound;

    fn classify(&self, message: &Self::Inbound) -> InboundClass;

    fn kind(message: &Self::Inbound) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Waiting for connectivity before retrying.
    Offline,
    /// Credentials were rejected and could not be refreshed.
    AuthExpired,
    Closed,
    /// Gave up after a fatal error or too many failures.
    Failed,
}

type Callback<P> = Arc<dyn Fn(&<P as ChannelProtocol>::Inbound) + Send + Sync>;

struct Handler<P: ChannelProtocol> {
    id: u64,
    kind: Option<P::Kind>,
    callback: Callback<P>,
}

struct Handlers<P: ChannelProtocol> {
    next_id: u64,
    entries: Vec<Handler<P>>,
}

/// Returned by [`TransportChannel::on`]. The handler stays registered until
/// [`Subscription::unsubscribe`] is called or the channel is closed.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// One physical connection.
pub(crate) struct Connection {
    pub(crate) generation: u64,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) lost: Notify,
    last_seen: Mutex<Instant>,
}

impl Connection {
    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        lock(&self.last_seen).elapsed()
    }
}

type ReadyTx = oneshot::Sender<Result<(), ChannelError>>;

pub struct TransportChannel<P: ChannelProtocol> {
    pub(crate) protocol: P,
    endpoint: String,
    pub(crate) config: ChannelConfig,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialsProvider>,
    status_tx: watch::Sender<ChannelStatus>,
    online_tx: watch::Sender<bool>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    generation: AtomicU64,
    current: Mutex<Option<Arc<Connection>>>,
    handlers: Arc<Mutex<Handlers<P>>>,
    dispatch_tx: mpsc::UnboundedSender<(u64, P::Inbound)>,
}

/// Why a live connection ended.
enum Ended {
    Lost,
    Shutdown,
    Offline,
    Refused(ChannelError),
}

impl<P: ChannelProtocol> TransportChannel<P> {
    /// Opens the channel. Resolves once the first connection is
    /// established, or with the error of the first attempt. An expired token
    /// is refreshed once before giving up. Afterwards the channel reconnects
    /// on its own until [`close`](Self::close) is called.
    pub async fn connect(
        protocol: P,
        endpoint: impl Into<String>,
        credentials: Arc<dyn CredentialsProvider>,
        factory: Arc<dyn TransportFactory>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, ChannelError> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            protocol,
            endpoint: endpoint.into(),
            config,
            factory,
            credentials,
            status_tx: watch::Sender::new(ChannelStatus::Idle),
            online_tx: watch::Sender::new(true),
            shutdown_tx: watch::Sender::new(false),
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
            handlers: Arc::new(Mutex::new(Handlers {
                next_id: 0,
                entries: Vec::new(),
            })),
            dispatch_tx,
        });

        tokio::spawn(channel.clone().dispatch_loop(dispatch_rx));
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(channel.clone().supervise(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(channel),
            Ok(Err(e)) => {
                channel.close().await;
                Err(e)
            }
            Err(_) => Err(ChannelError::Closed),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.status_tx.borrow() == ChannelStatus::Connected
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Registers `handler` for messages of `kind`, or for every message when
    /// `kind` is `None`. Handlers run on the dispatcher task in registration
    /// order and must not block.
    pub fn on<F>(&self, kind: Option<P::Kind>, handler: F) -> Subscription
    where
        F: Fn(&P::Inbound) + Send + Sync + 'static,
    {
        let id = {
            let mut handlers = lock(&self.handlers);
            handlers.next_id += 1;
            let id = handlers.next_id;
            handlers.entries.push(Handler {
                id,
                kind,
                callback: Arc::new(handler),
            });
            id
        };
        let weak: Weak<Mutex<Handlers<P>>> = Arc::downgrade(&self.handlers);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(handlers) = weak.upgrade() {
                    lock(&handlers).entries.retain(|h| h.id != id);
                }
            })),
        }
    }

    pub async fn send(&self, message: &P::Outbound) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let connection = lock(&self.current).clone().ok_or(ChannelError::NotConnected)?;
        self.send_on(connection.transport.as_ref(), message).await
    }

    pub(crate) async fn send_on(
        &self,
        transport: &dyn Transport,
        message: &P::Outbound,
    ) -> Result<(), ChannelError> {
        let data = serde_json::to_vec(message)?;
        transport
            .send(&data)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    /// Connectivity signal. While offline no connection attempt is made and
    /// the live connection, if any, is dropped.
    pub fn set_online(&self, online: bool) {
        if self.online_tx.send_replace(online) != online {
            info!(target: "Channel", "{} connectivity changed: online={online}", P::NAME);
        }
    }

    /// Stops reconnecting, drops the connection and every handler.
    pub async fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        debug!(target: "Channel", "Closing {} channel", P::NAME);
        self.set_status(ChannelStatus::Closed);
        lock(&self.handlers).entries.clear();
        let connection = lock(&self.current).take();
        if let Some(connection) = connection {
            connection.transport.disconnect().await;
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(target: "Channel", "{} status {previous:?} -> {status:?}", P::NAME);
        }
    }

    fn decode(&self, data: &[u8]) -> Result<P::Inbound, ChannelError> {
        Ok(serde_json::from_slice(data)?)
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(u64, P::Inbound)>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let (generation, message) = tokio::select! {
                biased;
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
                _ = shutdown.wait_for(|closed| *closed) => return,
            };
            if generation != self.generation() {
                trace!(target: "Channel", "Dropping stale {} message from generation {generation}", P::NAME);
                continue;
            }
            let kind = P::kind(&message);
            let callbacks: Vec<Callback<P>> = lock(&self.handlers)
                .entries
                .iter()
                .filter(|h| h.kind.is_none_or(|k| k == kind))
                .map(|h| h.callback.clone())
                .collect();
            for callback in callbacks {
                callback(&message);
            }
        }
    }

    async fn supervise(self: Arc<Self>, ready: ReadyTx) {
        let mut ready = Some(ready);
        let mut failures = 0u32;
        let mut refresh_pending = false;
        let mut refreshed = false;
        let mut online = self.online_tx.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();

        let report = |ready: &mut Option<ReadyTx>, result: Result<(), ChannelError>| {
            if let Some(tx) = ready.take() {
                let _ = tx.send(result);
            }
        };

        loop {
            if self.is_closed() {
                break;
            }
            if !*online.borrow_and_update() {
                self.set_status(ChannelStatus::Offline);
                if ready.is_some() {
                    report(&mut ready, Err(ChannelError::NetworkUnavailable));
                    break;
                }
                tokio::select! {
                    _ = online.wait_for(|o| *o) => {}
                    _ = shutdown.wait_for(|s| *s) => break,
                }
                continue;
            }

            if ready.is_some() {
                self.set_status(ChannelStatus::Connecting);
            } else {
                self.set_status(ChannelStatus::Reconnecting {
                    attempt: failures + 1,
                });
                info!(target: "Channel", "Reconnecting {} channel, attempt {}", P::NAME, failures + 1);
            }

            let credentials = if refresh_pending {
                refresh_pending = false;
                self.credentials.refresh().await
            } else {
                self.credentials.current().await
            };

            let attempt = match credentials {
                Ok(credentials) => self.establish(&credentials).await,
                Err(e) => Err(e),
            };

            let error = match attempt {
                Ok((connection, events, early)) => {
                    failures = 0;
                    refreshed = false;
                    self.set_status(ChannelStatus::Connected);
                    report(&mut ready, Ok(()));
                    match self.run_connection(connection, events, early).await {
                        Ended::Shutdown => break,
                        Ended::Offline => continue,
                        Ended::Lost => None,
                        Ended::Refused(e) => Some(e),
                    }
                }
                Err(e) => Some(e),
            };

            match error {
                Some(ChannelError::AuthExpired) if !refreshed => {
                    warn!(target: "Channel", "{} credentials expired, refreshing", P::NAME);
                    self.set_status(ChannelStatus::AuthExpired);
                    refreshed = true;
                    refresh_pending = true;
                    continue;
                }
                Some(ChannelError::AuthExpired) => {
                    warn!(target: "Channel", "{} credentials rejected after refresh", P::NAME);
                    self.set_status(ChannelStatus::AuthExpired);
                    report(&mut ready, Err(ChannelError::AuthExpired));
                    break;
                }
                Some(e @ ChannelError::Protocol(_)) => {
                    warn!(target: "Channel", "{} protocol error: {e}", P::NAME);
                    self.set_status(ChannelStatus::Failed);
                    report(&mut ready, Err(e));
                    break;
                }
                Some(e) => {
                    if ready.is_some() {
                        report(&mut ready, Err(e));
                        break;
                    }
                    failures += 1;
                    warn!(target: "Channel", "{} connection attempt failed ({failures}): {e}", P::NAME);
                    if self.config.max_consecutive_failures > 0
                        && failures >= self.config.max_consecutive_failures
                    {
                        self.set_status(ChannelStatus::Failed);
                        break;
                    }
                }
                None => {
                    if !self.config.auto_reconnect {
                        debug!(target: "Channel", "{} connection lost, not reconnecting", P::NAME);
                        self.set_status(ChannelStatus::Failed);
                        break;
                    }
                    info!(target: "Channel", "{} connection lost", P::NAME);
                }
            }

            let delay = retry_interval(failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|s| *s) => break,
            }
        }
        debug!(target: "Channel", "{} supervisor exiting", P::NAME);
    }

    /// Opens one transport and completes the handshake. Messages that arrive
    /// before the server accepts the connection are returned for delivery.
    async fn establish(
        &self,
        credentials: &Credentials,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<TransportEvent>, Vec<P::Inbound>), ChannelError> {
        let timeout = self.config.connect_timeout;
        let (transport, mut events) =
            tokio::time::timeout(timeout, self.factory.create_transport(&self.endpoint))
                .await
                .map_err(|_| ChannelError::Timeout(timeout))?
                .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let mut early = Vec::new();
        if let Some(auth) = self.protocol.auth_message(credentials) {
            self.send_on(transport.as_ref(), &auth).await?;
            let handshake = async {
                loop {
                    match events.recv().await {
                        Some(TransportEvent::DataReceived(data)) => {
                            let message = match self.decode(&data) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!(target: "Channel", "Undecodable {} message during handshake: {e}", P::NAME);
                                    continue;
                                }
                            };
                            match self.protocol.classify(&message) {
                                InboundClass::ConnectionOk => return Ok(()),
                                InboundClass::ConnectionError(e) => return Err(e),
                                InboundClass::HealthCheck | InboundClass::Event => early.push(message),
                            }
                        }
                        Some(TransportEvent::Connected) => {}
                        Some(TransportEvent::Disconnected) | None => {
                            return Err(ChannelError::Transport(
                                "connection closed during handshake".to_string(),
                            ));
                        }
                    }
                }
            };
            let result = match tokio::time::timeout(timeout, handshake).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout(timeout)),
            };
            if let Err(e) = result {
                transport.disconnect().await;
                return Err(e);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(Connection {
            generation,
            transport,
            lost: Notify::new(),
            last_seen: Mutex::new(Instant::now()),
        });
        *lock(&self.current) = Some(connection.clone());
        debug!(target: "Channel", "{} connected to {} (generation {generation})", P::NAME, self.endpoint);
        Ok((connection, events, early))
    }

    async fn run_connection(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        mut events: mpsc::Receiver<TransportEvent>,
        early: Vec<P::Inbound>,
    ) -> Ended {
        for message in early {
            let _ = self.dispatch_tx.send((connection.generation, message));
        }

        let keepalive = tokio::spawn(self.clone().keepalive_loop(connection.clone()));
        let _keepalive_guard = scopeguard::guard(keepalive, |handle| handle.abort());

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut online = self.online_tx.subscribe();

        let ended = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::DataReceived(data)) => {
                        connection.touch();
                        let message = match self.decode(&data) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(target: "Channel", "Undecodable {} message: {e}", P::NAME);
                                continue;
                            }
                        };
                        match self.protocol.classify(&message) {
                            InboundClass::ConnectionError(e) => break Ended::Refused(e),
                            _ => {
                                let _ = self.dispatch_tx.send((connection.generation, message));
                            }
                        }
                    }
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => break Ended::Lost,
                },
                _ = connection.lost.notified() => break Ended::Lost,
                _ = shutdown.wait_for(|s| *s) => break Ended::Shutdown,
                _ = online.wait_for(|o| !*o) => break Ended::Offline,
            }
        };

        {
            let mut current = lock(&self.current);
            if current.as_ref().is_some_and(|c| c.generation == connection.generation) {
                current.take();
            }
        }
        connection.transport.disconnect().await;
        ended
    }
}
