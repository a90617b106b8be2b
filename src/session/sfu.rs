//! Sessions on a media server reached over its JSON signaling channel.

use super::{RestoreOutcome, Session, SessionConnector, SessionLink, SessionRequest, SessionSignal, SignalSender};
use crate::channel::{
    ChannelProtocol, ChannelStatus, Credentials, InboundClass, StaticCredentials, Subscription,
    TransportChannel,
};
use crate::config::{ChannelConfig, MediaConfig};
use crate::error::{CallError, ChannelError};
use crate::lock;
use crate::media::{MediaEvent, MediaTransport, MediaTransportFactory, PeerSide, TracedMediaTransport};
use crate::transport::TransportFactory;
use async_trait::async_trait;
use callcore::protocol::coordinator::ClientDetails;
use callcore::protocol::sfu::{
    Participant, PeerType, ReconnectDetails, ReconnectStrategy, SfuEvent, SfuEventKind, SfuRequest,
    TrackInfo, TrackSubscription, TrackType,
};
use callcore::sdp::{self, SessionDescription, TransceiverInfo, munge};
use callcore::trace::TraceLog;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

pub struct SfuProtocol {
    session_id: String,
}

impl SfuProtocol {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

impl ChannelProtocol for SfuProtocol {
    const NAME: &'static str = "sfu";
    type Outbound = SfuRequest;
    type Inbound = SfuEvent;
    type Kind = SfuEventKind;

    /// The join request carries the token, so there is no separate handshake.
    fn auth_message(&self, _credentials: &Credentials) -> Option<SfuRequest> {
        None
    }

    fn keepalive_message(&self) -> SfuRequest {
        SfuRequest::HealthCheckRequest {
            session_id: self.session_id.clone(),
        }
    }

    fn classify(&self, message: &SfuEvent) -> InboundClass {
        match message {
            SfuEvent::HealthCheckResponse => InboundClass::HealthCheck,
            _ => InboundClass::Event,
        }
    }

    fn kind(message: &SfuEvent) -> SfuEventKind {
        message.kind()
    }
}

fn new_session_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

/// Splits a remote stream id of the form `<lookup prefix>:<track type>`.
fn parse_stream_id(stream_id: &str) -> Option<(String, TrackType)> {
    let (prefix, raw) = stream_id.split_once(':')?;
    let raw = raw.trim_start_matches("TRACK_TYPE_").to_ascii_lowercase();
    let track_type = serde_json::from_value(serde_json::Value::String(raw)).ok()?;
    Some((prefix.to_string(), track_type))
}

#[derive(Default)]
struct LinkState {
    published: Vec<TrackType>,
    subscriptions: Vec<TrackSubscription>,
    participants: Vec<Participant>,
    unhealthy: bool,
}

struct LinkInner {
    session_id: String,
    edge_name: String,
    ws_endpoint: String,
    token: String,
    started_at: DateTime<Utc>,
    client_details: ClientDetails,
    channel_config: ChannelConfig,
    media_config: MediaConfig,
    transports: Arc<dyn TransportFactory>,
    channel: Mutex<Option<(Arc<TransportChannel<SfuProtocol>>, Subscription)>>,
    publisher: Arc<TracedMediaTransport>,
    subscriber: Arc<TracedMediaTransport>,
    state: Mutex<LinkState>,
    arrived: watch::Sender<HashSet<(String, TrackType)>>,
    signals: SignalSender,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

pub struct SfuSessionLink {
    inner: Arc<LinkInner>,
}

impl LinkInner {
    fn signal(&self, signal: SessionSignal) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.signals.send((self.session_id.clone(), signal));
    }

    fn channel(&self) -> Result<Arc<TransportChannel<SfuProtocol>>, CallError> {
        lock(&self.channel)
            .as_ref()
            .map(|(channel, _)| channel.clone())
            .ok_or(CallError::Channel(ChannelError::NotConnected))
    }

    async fn send(&self, request: SfuRequest) -> Result<(), CallError> {
        self.channel()?.send(&request).await?;
        Ok(())
    }

    /// Keeps `handle` so closing aborts it. Tasks started after the link
    /// closed are aborted right away.
    fn track_task(&self, handle: AbortHandle) {
        let mut tasks = lock(&self.tasks);
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Opens the signaling channel and joins the session on it.
    async fn open_signaling(
        self: &Arc<Self>,
        reconnect_details: Option<ReconnectDetails>,
    ) -> Result<(), CallError> {
        let channel = TransportChannel::connect(
            SfuProtocol::new(self.session_id.clone()),
            self.ws_endpoint.clone(),
            Arc::new(StaticCredentials(Credentials::new(self.token.clone()))),
            self.transports.clone(),
            ChannelConfig {
                auto_reconnect: false,
                ..self.channel_config.clone()
            },
        )
        .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = channel.on(None, move |event: &SfuEvent| {
            let _ = tx.send(event.clone());
        });

        let joined = async {
            let subscriber_sdp = self
                .subscriber
                .create_offer(false)
                .await
                .map_err(CallError::media)?;
            channel
                .send(&SfuRequest::JoinRequest {
                    token: self.token.clone(),
                    session_id: self.session_id.clone(),
                    subscriber_sdp,
                    client_details: self.client_details.clone(),
                    reconnect_details,
                })
                .await?;

            let mut early = Vec::new();
            let timeout = self.channel_config.connect_timeout;
            let response = tokio::time::timeout(timeout, async {
                while let Some(event) = rx.recv().await {
                    match event {
                        SfuEvent::JoinResponse { participants, .. } => return Ok(participants),
                        SfuEvent::Error { error, .. } => {
                            return Err(CallError::Protocol(format!("{}: {}", error.code, error.message)));
                        }
                        other => early.push(other),
                    }
                }
                Err(CallError::Channel(ChannelError::Closed))
            })
            .await
            .map_err(|_| CallError::Channel(ChannelError::Timeout(timeout)))??;
            Ok::<_, CallError>((response, early))
        };

        let (participants, early) = match joined.await {
            Ok(joined) => joined,
            Err(e) => {
                subscription.unsubscribe();
                channel.close().await;
                return Err(e);
            }
        };
        let installed = {
            let mut slot = lock(&self.channel);
            if self.closed.load(Ordering::SeqCst) {
                Err(subscription)
            } else {
                Ok(slot.replace((channel.clone(), subscription)))
            }
        };
        let previous = match installed {
            Ok(previous) => previous,
            Err(subscription) => {
                debug!(target: "Session", "Session {} closed while joining", self.session_id);
                subscription.unsubscribe();
                channel.close().await;
                return Err(CallError::Cancelled);
            }
        };
        lock(&self.state).participants = participants;
        if let Some((old, old_subscription)) = previous {
            old_subscription.unsubscribe();
            old.close().await;
        }

        let pump = tokio::spawn({
            let inner = self.clone();
            let channel = channel.clone();
            async move {
                for event in early {
                    inner.handle_event(&channel, event).await;
                }
                while let Some(event) = rx.recv().await {
                    inner.handle_event(&channel, event).await;
                }
            }
        });
        self.track_task(pump.abort_handle());

        let watcher = tokio::spawn({
            let inner = self.clone();
            let mut status = channel.status();
            async move {
                if status
                    .wait_for(|s| matches!(s, ChannelStatus::Failed))
                    .await
                    .is_ok()
                {
                    info!(target: "Session", "Signaling lost for session {}", inner.session_id);
                    inner.signal(SessionSignal::TransportLost);
                }
            }
        });
        self.track_task(watcher.abort_handle());
        Ok(())
    }

    async fn handle_event(&self, channel: &TransportChannel<SfuProtocol>, event: SfuEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            SfuEvent::SubscriberOffer { sdp, .. } => {
                match self.answer_subscriber(&sdp).await {
                    Ok(answer) => {
                        let request = SfuRequest::SendAnswer {
                            session_id: self.session_id.clone(),
                            peer_type: PeerType::Subscriber,
                            sdp: answer,
                        };
                        if let Err(e) = channel.send(&request).await {
                            warn!(target: "Session", "Failed to send subscriber answer: {e}");
                        }
                    }
                    Err(e) => warn!(target: "Session", "Subscriber negotiation failed: {e:#}"),
                }
            }
            SfuEvent::PublisherAnswer { sdp } => {
                if let Err(e) = self.publisher.set_remote_description(&sdp).await {
                    warn!(target: "Session", "Publisher answer rejected: {e:#}");
                }
            }
            SfuEvent::IceTrickle {
                peer_type,
                ice_candidate,
            } => {
                let transport = match peer_type {
                    PeerType::Subscriber => &self.subscriber,
                    PeerType::PublisherUnspecified => &self.publisher,
                };
                if let Err(e) = transport.add_ice_candidate(&ice_candidate).await {
                    debug!(target: "Session", "Dropping ICE candidate: {e}");
                }
            }
            SfuEvent::ParticipantJoined { participant } => {
                let mut state = lock(&self.state);
                state.participants.retain(|p| p.session_id != participant.session_id);
                state.participants.push(participant);
            }
            SfuEvent::ParticipantLeft { participant } => {
                lock(&self.state)
                    .participants
                    .retain(|p| p.session_id != participant.session_id);
            }
            SfuEvent::TrackPublished {
                session_id,
                track_type,
                ..
            } => {
                let mut state = lock(&self.state);
                if let Some(p) = state.participants.iter_mut().find(|p| p.session_id == session_id) {
                    if !p.published_tracks.contains(&track_type) {
                        p.published_tracks.push(track_type);
                    }
                }
            }
            SfuEvent::TrackUnpublished {
                session_id,
                track_type,
                ..
            } => {
                let mut state = lock(&self.state);
                if let Some(p) = state.participants.iter_mut().find(|p| p.session_id == session_id) {
                    p.published_tracks.retain(|t| *t != track_type);
                }
            }
            SfuEvent::GoAway { reason } => self.signal(SessionSignal::GoAway { reason }),
            SfuEvent::Error {
                error,
                reconnect_strategy,
            } => {
                warn!(target: "Session", "Media server error {}: {}", error.code, error.message);
                self.signal(SessionSignal::ServerError {
                    strategy: reconnect_strategy,
                    message: error.message,
                });
            }
            SfuEvent::CallEnded { reason } => self.signal(SessionSignal::CallEnded { reason }),
            SfuEvent::JoinResponse { .. }
            | SfuEvent::ParticipantMigrationComplete
            | SfuEvent::HealthCheckResponse
            | SfuEvent::Unknown => {}
        }
    }

    async fn answer_subscriber(&self, offer: &str) -> anyhow::Result<String> {
        self.subscriber.set_remote_description(offer).await?;
        let answer = self.subscriber.create_answer().await?;
        let answer = munge::enable_stereo(offer, &answer)?;
        self.subscriber.set_local_description(&answer).await?;
        Ok(answer)
    }

    /// Applies the configured codec and bitrate preferences to a publisher offer.
    fn munge_publisher_offer(&self, offer: &str) -> Result<SessionDescription, CallError> {
        let config = &self.media_config;
        let mut sdp = SessionDescription::parse(offer)?;
        if let Some(codec) = &config.video_codec {
            sdp = sdp::remove_codecs_except(&sdp, codec, config.video_fmtp_profile.as_deref())?;
            let name = codec.rsplit('/').next().unwrap_or(codec);
            sdp = sdp::set_preferred_codec(&sdp, "video", name);
        }
        if let Some(max_kbps) = config.max_video_bitrate_kbps {
            sdp = sdp::set_start_bitrate(&sdp, max_kbps, config.start_bitrate_factor, &config.video_mid);
        }
        Ok(sdp::toggle_dtx(&sdp, config.dtx))
    }

    /// Pairs each track with the mid of the transceiver sending it.
    fn announced_tracks(&self, tracks: &[TrackType], offer: &SessionDescription) -> Vec<TrackInfo> {
        let transceivers = self.publisher.transceivers();
        tracks
            .iter()
            .map(|&track_type| {
                let index = transceivers.iter().position(|(t, _)| *t == track_type);
                let transceiver = match index {
                    Some(i) => transceivers[i].1.clone(),
                    None => TransceiverInfo {
                        kind: track_type.media_kind().to_string(),
                        ..TransceiverInfo::default()
                    },
                };
                let mid = sdp::extract_mid(&transceiver, index, Some(offer));
                if mid.is_empty() {
                    debug!(target: "Session", "No mid found for {track_type:?} track");
                }
                TrackInfo { track_type, mid }
            })
            .collect()
    }

    async fn negotiate_publisher(&self, tracks: &[TrackType], ice_restart: bool) -> Result<(), CallError> {
        let offer = self
            .publisher
            .create_offer(ice_restart)
            .await
            .map_err(CallError::media)?;
        let munged = self.munge_publisher_offer(&offer)?;
        let announced = self.announced_tracks(tracks, &munged);
        let offer = munged.to_string();
        self.publisher
            .set_local_description(&offer)
            .await
            .map_err(CallError::media)?;
        self.send(SfuRequest::SetPublisher {
            session_id: self.session_id.clone(),
            sdp: offer,
            tracks: announced,
        })
        .await?;
        lock(&self.state).published = tracks.to_vec();
        Ok(())
    }

    fn handle_media_event(&self, side: PeerSide, transport: &TracedMediaTransport, event: MediaEvent) {
        transport.record_event(&event);
        match event {
            MediaEvent::IceCandidate(candidate) => {
                let peer_type = match side {
                    PeerSide::Publisher => PeerType::PublisherUnspecified,
                    PeerSide::Subscriber => PeerType::Subscriber,
                };
                let request = SfuRequest::IceTrickle {
                    session_id: self.session_id.clone(),
                    peer_type,
                    ice_candidate: candidate,
                };
                if let Ok(channel) = self.channel() {
                    tokio::spawn(async move {
                        if let Err(e) = channel.send(&request).await {
                            debug!(target: "Session", "Failed to trickle candidate: {e}");
                        }
                    });
                }
            }
            MediaEvent::ConnectionStateChange(state) => {
                let failed = matches!(state.as_str(), "failed" | "disconnected");
                let was_unhealthy = std::mem::replace(&mut lock(&self.state).unhealthy, failed);
                if failed && !was_unhealthy {
                    warn!(target: "Session", "{} peer connection {state}", side.as_str());
                    self.signal(SessionSignal::PeerUnhealthy(side));
                }
            }
            MediaEvent::Track { stream_id, .. } => match parse_stream_id(&stream_id) {
                Some(key) => {
                    self.arrived.send_modify(|arrived| {
                        arrived.insert(key);
                    });
                }
                None => warn!(target: "Session", "Unrecognised stream id {stream_id}"),
            },
            MediaEvent::IceConnectionStateChange(_) | MediaEvent::NegotiationNeeded => {}
        }
    }
}

#[async_trait]
impl SessionLink for SfuSessionLink {
    fn session(&self) -> Session {
        let state = lock(&self.inner.state);
        Session {
            session_id: self.inner.session_id.clone(),
            edge_name: self.inner.edge_name.clone(),
            started_at: self.inner.started_at,
            published_tracks: state.published.clone(),
            subscriptions: state.subscriptions.clone(),
        }
    }

    fn is_healthy(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && !lock(&self.inner.state).unhealthy
    }

    async fn resume(&self, attempt: u32) -> Result<(), CallError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CallError::Cancelled);
        }
        let (published, subscriptions) = {
            let state = lock(&self.inner.state);
            (state.published.clone(), state.subscriptions.clone())
        };
        self.inner
            .open_signaling(Some(ReconnectDetails {
                strategy: ReconnectStrategy::Fast,
                announced_tracks: published.clone(),
                subscriptions,
                reconnect_attempt: attempt,
                from_sfu_id: None,
                previous_session_id: Some(self.inner.session_id.clone()),
            }))
            .await?;
        if !published.is_empty() {
            self.inner.negotiate_publisher(&published, true).await?;
        }
        Ok(())
    }

    async fn restore_tracks(
        &self,
        published: &[TrackType],
        subscriptions: &[TrackSubscription],
    ) -> Result<RestoreOutcome, CallError> {
        if !published.is_empty() && lock(&self.inner.state).published != published {
            self.inner.negotiate_publisher(published, false).await?;
        }
        self.update_subscriptions(subscriptions).await?;

        let state = lock(&self.inner.state);
        let available = subscriptions.iter().all(|sub| {
            state
                .participants
                .iter()
                .any(|p| p.session_id == sub.session_id && p.published_tracks.contains(&sub.track_type))
        });
        Ok(if available {
            RestoreOutcome::Identical
        } else {
            RestoreOutcome::Diverged
        })
    }

    async fn await_media_flow(&self, subscriptions: &[TrackSubscription]) -> Result<(), CallError> {
        let wanted: Vec<(String, TrackType)> = subscriptions
            .iter()
            .map(|s| (s.session_id.clone(), s.track_type))
            .collect();
        let mut arrived = self.inner.arrived.subscribe();
        arrived
            .wait_for(|arrived| wanted.iter().all(|key| arrived.contains(key)))
            .await
            .map_err(|_| CallError::Channel(ChannelError::Closed))?;
        Ok(())
    }

    async fn publish(&self, tracks: &[TrackType]) -> Result<(), CallError> {
        self.inner.negotiate_publisher(tracks, false).await
    }

    async fn update_subscriptions(&self, subscriptions: &[TrackSubscription]) -> Result<(), CallError> {
        self.inner
            .send(SfuRequest::UpdateSubscriptions {
                session_id: self.inner.session_id.clone(),
                tracks: subscriptions.to_vec(),
            })
            .await?;
        lock(&self.inner.state).subscriptions = subscriptions.to_vec();
        Ok(())
    }

    fn media_transports(&self) -> Vec<(PeerSide, Arc<TracedMediaTransport>)> {
        vec![
            (PeerSide::Publisher, self.inner.publisher.clone()),
            (PeerSide::Subscriber, self.inner.subscriber.clone()),
        ]
    }

    async fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "Session", "Closing session {} ({reason})", self.inner.session_id);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        let channel = lock(&self.inner.channel).take();
        if let Some((channel, subscription)) = channel {
            subscription.unsubscribe();
            let leave = SfuRequest::LeaveCallRequest {
                session_id: self.inner.session_id.clone(),
                reason: reason.to_string(),
            };
            if let Err(e) = channel.send(&leave).await {
                debug!(target: "Session", "Leave request not delivered: {e}");
            }
            channel.close().await;
        }
        self.inner.publisher.close().await;
        self.inner.subscriber.close().await;
    }
}

/// Builds [`SfuSessionLink`]s from join credentials.
pub struct SfuSessionConnector {
    transports: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaTransportFactory>,
    client_details: ClientDetails,
    channel_config: ChannelConfig,
    media_config: MediaConfig,
    trace_capacity: usize,
    sessions: AtomicU64,
}

impl SfuSessionConnector {
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaTransportFactory>,
        client_details: ClientDetails,
        channel_config: ChannelConfig,
        media_config: MediaConfig,
        trace_capacity: usize,
    ) -> Self {
        Self {
            transports,
            media,
            client_details,
            channel_config,
            media_config,
            trace_capacity,
            sessions: AtomicU64::new(0),
        }
    }

    async fn traced(
        &self,
        side: PeerSide,
        sequence: u64,
    ) -> Result<(Arc<TracedMediaTransport>, mpsc::Receiver<MediaEvent>), CallError> {
        let (transport, events) = self.media.create(side).await.map_err(CallError::media)?;
        let suffix = match side {
            PeerSide::Publisher => "pub",
            PeerSide::Subscriber => "sub",
        };
        let log = TraceLog::new(Some(format!("{sequence}-{suffix}")), self.trace_capacity);
        Ok((Arc::new(TracedMediaTransport::new(transport, log)), events))
    }
}

#[async_trait]
impl SessionConnector for SfuSessionConnector {
    async fn connect(&self, request: SessionRequest) -> Result<Arc<dyn SessionLink>, CallError> {
        let sequence = self.sessions.fetch_add(1, Ordering::SeqCst);
        let (publisher, publisher_events) = self.traced(PeerSide::Publisher, sequence).await?;
        let (subscriber, subscriber_events) = self.traced(PeerSide::Subscriber, sequence).await?;

        let server = &request.credentials.server;
        info!(
            target: "Session",
            "Joining {} on edge {} ({:?})",
            request.call_cid, server.edge_name, request.strategy
        );
        let inner = Arc::new(LinkInner {
            session_id: new_session_id(),
            edge_name: server.edge_name.clone(),
            ws_endpoint: server.ws_endpoint.clone(),
            token: request.credentials.token.clone(),
            started_at: Utc::now(),
            client_details: self.client_details.clone(),
            channel_config: self.channel_config.clone(),
            media_config: self.media_config.clone(),
            transports: self.transports.clone(),
            channel: Mutex::new(None),
            publisher,
            subscriber,
            state: Mutex::new(LinkState::default()),
            arrived: watch::Sender::new(HashSet::new()),
            signals: request.signals,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        for (side, mut events) in [
            (PeerSide::Publisher, publisher_events),
            (PeerSide::Subscriber, subscriber_events),
        ] {
            let task = tokio::spawn({
                let inner = inner.clone();
                async move {
                    while let Some(event) = events.recv().await {
                        let transport = match side {
                            PeerSide::Publisher => inner.publisher.clone(),
                            PeerSide::Subscriber => inner.subscriber.clone(),
                        };
                        inner.handle_media_event(side, &transport, event);
                    }
                }
            });
            inner.track_task(task.abort_handle());
        }

        let reconnect_details = request.previous.as_ref().map(|previous| ReconnectDetails {
            strategy: request.strategy,
            announced_tracks: previous.published_tracks.clone(),
            subscriptions: previous.subscriptions.clone(),
            reconnect_attempt: request.reconnect_attempt,
            from_sfu_id: request.migrating_from.clone(),
            previous_session_id: Some(previous.session_id.clone()),
        });

        let link = SfuSessionLink { inner };
        if let Err(e) = link.inner.open_signaling(reconnect_details).await {
            link.close("join failed").await;
            return Err(e);
        }
        Ok(Arc::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockMediaTransport;
    use crate::transport::mock::MockTransportFactory;
    use callcore::protocol::coordinator::{SfuCredentials, SfuServer};
    use serde_json::json;
    use std::time::Duration;

    const OPUS_STEREO_OFFER: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10;stereo=1\r\n";
    const OPUS_ANSWER: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10\r\n";

    struct Media;

    #[async_trait]
    impl MediaTransportFactory for Media {
        async fn create(
            &self,
            _side: PeerSide,
        ) -> anyhow::Result<(Arc<dyn MediaTransport>, mpsc::Receiver<MediaEvent>)> {
            let (_tx, rx) = mpsc::channel(4);
            Ok((Arc::new(MockMediaTransport::new(OPUS_ANSWER, OPUS_ANSWER)), rx))
        }
    }

    fn request(signals: SignalSender) -> SessionRequest {
        SessionRequest {
            call_cid: "default:1".into(),
            credentials: SfuCredentials {
                server: SfuServer {
                    url: "https://sfu".into(),
                    ws_endpoint: "wss://sfu/ws".into(),
                    edge_name: "edge-1".into(),
                },
                token: "sfu-token".into(),
            },
            strategy: ReconnectStrategy::Unspecified,
            previous: None,
            migrating_from: None,
            reconnect_attempt: 0,
            signals,
        }
    }

    fn connector(factory: MockTransportFactory) -> SfuSessionConnector {
        SfuSessionConnector::new(
            Arc::new(factory),
            Arc::new(Media),
            ClientDetails::default(),
            ChannelConfig {
                connect_timeout: Duration::from_secs(2),
                ..ChannelConfig::default()
            },
            MediaConfig::default(),
            100,
        )
    }

    #[test]
    fn stream_ids_name_the_track() {
        assert_eq!(
            parse_stream_id("abc:TRACK_TYPE_VIDEO"),
            Some(("abc".to_string(), TrackType::Video))
        );
        assert_eq!(
            parse_stream_id("abc:screen_share"),
            Some(("abc".to_string(), TrackType::ScreenShare))
        );
        assert_eq!(parse_stream_id("abc"), None);
    }

    #[tokio::test]
    async fn joins_answers_with_stereo_and_reports_loss() {
        let (factory, mut peers) = MockTransportFactory::new();
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let connector = connector(factory);

        let connecting = tokio::spawn(async move { connector.connect(request(signals_tx)).await });

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.endpoint, "wss://sfu/ws");
        let join = peer.next_sent().await.unwrap();
        assert_eq!(join["type"], "join_request");
        assert_eq!(join["token"], "sfu-token");
        peer.push_json(json!({"type": "join_response", "participants": []}))
            .await;
        let link = connecting.await.unwrap().unwrap();
        assert_eq!(link.session().edge_name, "edge-1");

        peer.push_json(json!({"type": "subscriber_offer", "sdp": OPUS_STEREO_OFFER}))
            .await;
        let answer = peer.next_sent().await.unwrap();
        assert_eq!(answer["type"], "send_answer");
        assert!(answer["sdp"].as_str().unwrap().contains("stereo=1"));

        peer.drop_connection().await;
        let (session_id, signal) = signals_rx.recv().await.unwrap();
        assert_eq!(session_id, link.session().session_id);
        assert_eq!(signal, SessionSignal::TransportLost);
        link.close("test").await;
    }

    #[tokio::test]
    async fn go_away_is_forwarded() {
        let (factory, mut peers) = MockTransportFactory::new();
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let connector = connector(factory);
        let connecting = tokio::spawn(async move { connector.connect(request(signals_tx)).await });

        let mut peer = peers.recv().await.unwrap();
        peer.next_sent().await.unwrap();
        peer.push_json(json!({"type": "join_response"})).await;
        let link = connecting.await.unwrap().unwrap();

        peer.push_json(json!({"type": "go_away", "reason": "draining"})).await;
        let (_, signal) = signals_rx.recv().await.unwrap();
        assert_eq!(
            signal,
            SessionSignal::GoAway {
                reason: "draining".into()
            }
        );
        link.close("test").await;
    }

    #[tokio::test]
    async fn published_tracks_are_announced_with_their_mids() {
        let (factory, mut peers) = MockTransportFactory::new();
        let (signals_tx, _signals_rx) = mpsc::unbounded_channel();
        let connector = connector(factory);
        let connecting = tokio::spawn(async move { connector.connect(request(signals_tx)).await });

        let mut peer = peers.recv().await.unwrap();
        peer.next_sent().await.unwrap();
        peer.push_json(json!({"type": "join_response"})).await;
        let link = connecting.await.unwrap().unwrap();

        link.publish(&[TrackType::Audio, TrackType::Video]).await.unwrap();
        let announce = peer.next_sent().await.unwrap();
        assert_eq!(announce["type"], "set_publisher");
        assert_eq!(
            announce["tracks"],
            json!([
                {"track_type": "audio", "mid": "0"},
                {"track_type": "video", "mid": ""},
            ])
        );
        assert_eq!(link.session().published_tracks, vec![TrackType::Audio, TrackType::Video]);
        link.close("test").await;
    }

    #[tokio::test]
    async fn closing_during_resume_leaves_the_new_channel_unused() {
        let (factory, mut peers) = MockTransportFactory::new();
        let (signals_tx, _signals_rx) = mpsc::unbounded_channel();
        let connector = connector(factory);
        let connecting = tokio::spawn(async move { connector.connect(request(signals_tx)).await });

        let mut first = peers.recv().await.unwrap();
        first.next_sent().await.unwrap();
        first.push_json(json!({"type": "join_response"})).await;
        let link = connecting.await.unwrap().unwrap();

        let resuming = tokio::spawn({
            let link = link.clone();
            async move { link.resume(1).await }
        });
        let mut second = peers.recv().await.unwrap();
        let join = second.next_sent().await.unwrap();
        assert_eq!(join["type"], "join_request");
        assert_eq!(join["reconnect_details"]["strategy"], "fast");

        link.close("leave").await;
        second.push_json(json!({"type": "join_response"})).await;
        let resumed = resuming.await.unwrap();
        assert!(matches!(resumed, Err(CallError::Cancelled)));

        second
            .push_json(json!({"type": "subscriber_offer", "sdp": OPUS_STEREO_OFFER}))
            .await;
        while let Ok(Some(sent)) = tokio::time::timeout(Duration::from_millis(200), second.next_sent()).await {
            assert_ne!(sent["type"], "send_answer");
        }
        assert!(matches!(link.resume(2).await, Err(CallError::Cancelled)));
        assert!(!link.is_healthy());
    }
}
