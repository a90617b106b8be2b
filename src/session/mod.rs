//! A media-server session: one successful join of a call to one server.

pub mod sfu;

use crate::error::CallError;
use crate::media::{PeerSide, TracedMediaTransport};
use async_trait::async_trait;
use callcore::protocol::coordinator::SfuCredentials;
use callcore::protocol::sfu::{ReconnectStrategy, TrackSubscription, TrackType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use sfu::{SfuProtocol, SfuSessionConnector, SfuSessionLink};

/// Metadata of the active session, as exposed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub edge_name: String,
    pub started_at: DateTime<Utc>,
    pub published_tracks: Vec<TrackType>,
    pub subscriptions: Vec<TrackSubscription>,
}

/// Something the session noticed that the call has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// The signaling connection to the media server is gone.
    TransportLost,
    /// The media server is draining and asks the client to move.
    GoAway { reason: String },
    /// The media server reported an error and how to recover from it.
    ServerError {
        strategy: ReconnectStrategy,
        message: String,
    },
    CallEnded { reason: String },
    /// A peer connection failed while the signaling link is fine.
    PeerUnhealthy(PeerSide),
    /// Round trip time measured by the stats sampler.
    Quality { rtt_ms: f64 },
}

/// Signals tagged with the id of the session that raised them.
pub type SignalSender = mpsc::UnboundedSender<(String, SessionSignal)>;

/// Result of replaying tracks onto a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every previous subscription is available again.
    Identical,
    /// Some subscriptions could not be restored as they were.
    Diverged,
}

pub struct SessionRequest {
    pub call_cid: String,
    pub credentials: SfuCredentials,
    pub strategy: ReconnectStrategy,
    /// The session being replaced, if any.
    pub previous: Option<Session>,
    /// Edge the coordinator was asked to avoid.
    pub migrating_from: Option<String>,
    pub reconnect_attempt: u32,
    pub signals: SignalSender,
}

/// A live session, owned by the call.
#[async_trait]
pub trait SessionLink: Send + Sync {
    fn session(&self) -> Session;

    /// Whether both peer connections are still usable, which makes resuming
    /// the session worthwhile.
    fn is_healthy(&self) -> bool;

    /// Re-opens signaling for the same session and restarts ICE.
    async fn resume(&self, attempt: u32) -> Result<(), CallError>;

    /// Publishes `published` and subscribes to `subscriptions` again.
    async fn restore_tracks(
        &self,
        published: &[TrackType],
        subscriptions: &[TrackSubscription],
    ) -> Result<RestoreOutcome, CallError>;

    /// Resolves once at least one frame arrived for every subscription.
    async fn await_media_flow(&self, subscriptions: &[TrackSubscription]) -> Result<(), CallError>;

    async fn publish(&self, tracks: &[TrackType]) -> Result<(), CallError>;

    async fn update_subscriptions(&self, subscriptions: &[TrackSubscription]) -> Result<(), CallError>;

    fn media_transports(&self) -> Vec<(PeerSide, Arc<TracedMediaTransport>)>;

    async fn close(&self, reason: &str);
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, request: SessionRequest) -> Result<Arc<dyn SessionLink>, CallError>;
}
