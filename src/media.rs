//! The narrow surface of the media transport primitive that the call engine
//! drives, plus a decorator that traces every call made through it.

use anyhow::Result;
use async_trait::async_trait;
use callcore::protocol::sfu::TrackType;
use callcore::sdp::TransceiverInfo;
use callcore::stats::StatsSnapshot;
use callcore::trace::TraceLog;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which of the two peer connections of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSide {
    Publisher,
    Subscriber,
}

impl PeerSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

/// Callbacks raised by a media transport.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    ConnectionStateChange(String),
    IceConnectionStateChange(String),
    IceCandidate(String),
    /// A remote track started. `stream_id` is `<track lookup prefix>:<track type>`.
    Track { track_id: String, stream_id: String },
    NegotiationNeeded,
}

impl MediaEvent {
    fn trace_entry(&self) -> (&'static str, Value) {
        match self {
            Self::ConnectionStateChange(state) => ("onconnectionstatechange", json!(state)),
            Self::IceConnectionStateChange(state) => ("oniceconnectionstatechange", json!(state)),
            Self::IceCandidate(candidate) => ("onicecandidate", json!(candidate)),
            Self::Track {
                track_id,
                stream_id,
            } => ("ontrack", json!(format!("{stream_id} {track_id}"))),
            Self::NegotiationNeeded => ("onnegotiationneeded", Value::Null),
        }
    }
}

/// One peer connection. Descriptions cross this boundary as SDP text.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn get_stats(&self) -> Result<StatsSnapshot>;
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_local_description(&self, sdp: &str) -> Result<()>;
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;
    /// Sending transceivers in creation order, with the track each one carries.
    fn transceivers(&self) -> Vec<(TrackType, TransceiverInfo)>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(
        &self,
        side: PeerSide,
    ) -> Result<(Arc<dyn MediaTransport>, mpsc::Receiver<MediaEvent>)>;
}

/// Records a [`TraceRecord`](callcore::trace::TraceRecord) for every
/// operation and callback of the wrapped transport.
pub struct TracedMediaTransport {
    inner: Arc<dyn MediaTransport>,
    log: TraceLog,
}

impl TracedMediaTransport {
    pub fn new(inner: Arc<dyn MediaTransport>, log: TraceLog) -> Self {
        log.trace("create", json!({ "transceivers": inner.transceivers().len() }));
        Self { inner, log }
    }

    pub fn trace_log(&self) -> &TraceLog {
        &self.log
    }

    pub fn record_event(&self, event: &MediaEvent) {
        let (tag, payload) = event.trace_entry();
        self.log.trace(tag, payload);
    }

    fn traced<T>(&self, tag: &str, result: Result<T>, on_success: impl FnOnce(&T) -> Option<Value>) -> Result<T> {
        match &result {
            Ok(value) => {
                if let Some(payload) = on_success(value) {
                    self.log.trace(format!("{tag}OnSuccess"), payload);
                }
            }
            Err(e) => self.log.trace(format!("{tag}OnFailure"), json!(e.to_string())),
        }
        result
    }
}

#[async_trait]
impl MediaTransport for TracedMediaTransport {
    async fn get_stats(&self) -> Result<StatsSnapshot> {
        let result = self.inner.get_stats().await;
        if let Err(e) = &result {
            self.log.trace("getstatsOnFailure", json!(e.to_string()));
        }
        result
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        self.log.trace("createOffer", json!({ "iceRestart": ice_restart }));
        let result = self.inner.create_offer(ice_restart).await;
        self.traced("createOffer", result, |sdp| Some(json!(sdp)))
    }

    async fn create_answer(&self) -> Result<String> {
        self.log.trace("createAnswer", Value::Null);
        let result = self.inner.create_answer().await;
        self.traced("createAnswer", result, |sdp| Some(json!(sdp)))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        self.log.trace("setLocalDescription", json!(sdp));
        let result = self.inner.set_local_description(sdp).await;
        self.traced("setLocalDescription", result, |_| None)
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        self.log.trace("setRemoteDescription", json!(sdp));
        let result = self.inner.set_remote_description(sdp).await;
        self.traced("setRemoteDescription", result, |_| None)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.log.trace("addIceCandidate", json!(candidate));
        let result = self.inner.add_ice_candidate(candidate).await;
        self.traced("addIceCandidate", result, |_| None)
    }

    fn transceivers(&self) -> Vec<(TrackType, TransceiverInfo)> {
        self.inner.transceivers()
    }

    async fn close(&self) {
        self.log.trace("close", Value::Null);
        self.inner.close().await;
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockMediaTransport;
    use super::*;

    #[tokio::test]
    async fn records_operations_and_failures() {
        let mut inner = MockMediaTransport::new("v=0\r\n", "v=0\r\n");
        inner.fail_remote_description = true;
        let log = TraceLog::new(Some("0-pub".into()), 100);
        let traced = TracedMediaTransport::new(Arc::new(inner), log.clone());

        traced.create_offer(false).await.unwrap();
        assert!(traced.set_remote_description("v=0\r\n").await.is_err());
        traced.record_event(&MediaEvent::IceCandidate("candidate:1".into()));
        traced.close().await;

        let tags: Vec<String> = log.take().records.into_iter().map(|r| r.tag).collect();
        assert_eq!(
            tags,
            [
                "create",
                "createOffer",
                "createOfferOnSuccess",
                "setRemoteDescription",
                "setRemoteDescriptionOnFailure",
                "onicecandidate",
                "close",
            ]
        );
    }
}
