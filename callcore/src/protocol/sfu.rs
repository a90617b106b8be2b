//! Messages exchanged with a media server over its signaling channel.
//!
//! The wire format is JSON with a `type` tag per message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Audio,
    Video,
    ScreenShare,
    ScreenShareAudio,
}

/// How the media server asks the client to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    #[default]
    Unspecified,
    Disconnect,
    Fast,
    Rejoin,
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    PublisherUnspecified,
    Subscriber,
}

impl TrackType {
    /// The media section kind carrying this track.
    pub fn media_kind(&self) -> &'static str {
        match self {
            TrackType::Audio | TrackType::ScreenShareAudio => "audio",
            TrackType::Video | TrackType::ScreenShare => "video",
        }
    }
}

/// A published track as announced to the media server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_type: TrackType,
    pub mid: String,
}

/// One remote track this client receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackSubscription {
    pub user_id: String,
    pub session_id: String,
    pub track_type: TrackType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub published_tracks: Vec<TrackType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub should_retry: bool,
}

/// State replayed to a media server when resuming or replacing a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectDetails {
    pub strategy: ReconnectStrategy,
    #[serde(default)]
    pub announced_tracks: Vec<TrackType>,
    #[serde(default)]
    pub subscriptions: Vec<TrackSubscription>,
    pub reconnect_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_sfu_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SfuRequest {
    JoinRequest {
        token: String,
        session_id: String,
        subscriber_sdp: String,
        client_details: super::coordinator::ClientDetails,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_details: Option<ReconnectDetails>,
    },
    SetPublisher {
        session_id: String,
        sdp: String,
        tracks: Vec<TrackInfo>,
    },
    SendAnswer {
        session_id: String,
        peer_type: PeerType,
        sdp: String,
    },
    IceTrickle {
        session_id: String,
        peer_type: PeerType,
        ice_candidate: String,
    },
    UpdateSubscriptions {
        session_id: String,
        tracks: Vec<TrackSubscription>,
    },
    HealthCheckRequest {
        session_id: String,
    },
    LeaveCallRequest {
        session_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SfuEvent {
    JoinResponse {
        #[serde(default)]
        participants: Vec<Participant>,
        #[serde(default)]
        reconnected: bool,
        #[serde(default)]
        fast_reconnect_deadline_seconds: u32,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        participant: Participant,
    },
    TrackPublished {
        user_id: String,
        session_id: String,
        track_type: TrackType,
    },
    TrackUnpublished {
        user_id: String,
        session_id: String,
        track_type: TrackType,
    },
    SubscriberOffer {
        sdp: String,
        #[serde(default)]
        ice_restart: bool,
    },
    PublisherAnswer {
        sdp: String,
    },
    IceTrickle {
        peer_type: PeerType,
        ice_candidate: String,
    },
    GoAway {
        #[serde(default)]
        reason: String,
    },
    Error {
        error: SfuError,
        #[serde(default)]
        reconnect_strategy: ReconnectStrategy,
    },
    ParticipantMigrationComplete,
    HealthCheckResponse,
    CallEnded {
        #[serde(default)]
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SfuEventKind {
    JoinResponse,
    ParticipantJoined,
    ParticipantLeft,
    TrackPublished,
    TrackUnpublished,
    SubscriberOffer,
    PublisherAnswer,
    IceTrickle,
    GoAway,
    Error,
    ParticipantMigrationComplete,
    HealthCheckResponse,
    CallEnded,
    Unknown,
}

impl SfuEvent {
    pub fn kind(&self) -> SfuEventKind {
        use SfuEventKind as K;
        match self {
            Self::JoinResponse { .. } => K::JoinResponse,
            Self::ParticipantJoined { .. } => K::ParticipantJoined,
            Self::ParticipantLeft { .. } => K::ParticipantLeft,
            Self::TrackPublished { .. } => K::TrackPublished,
            Self::TrackUnpublished { .. } => K::TrackUnpublished,
            Self::SubscriberOffer { .. } => K::SubscriberOffer,
            Self::PublisherAnswer { .. } => K::PublisherAnswer,
            Self::IceTrickle { .. } => K::IceTrickle,
            Self::GoAway { .. } => K::GoAway,
            Self::Error { .. } => K::Error,
            Self::ParticipantMigrationComplete => K::ParticipantMigrationComplete,
            Self::HealthCheckResponse => K::HealthCheckResponse,
            Self::CallEnded { .. } => K::CallEnded,
            Self::Unknown => K::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_event_carries_strategy() {
        let event: SfuEvent = serde_json::from_value(json!({
            "type": "error",
            "error": {"code": "PARTICIPANT_SIGNAL_LOST", "message": "lost"},
            "reconnect_strategy": "rejoin"
        }))
        .unwrap();
        assert_eq!(
            event,
            SfuEvent::Error {
                error: SfuError {
                    code: "PARTICIPANT_SIGNAL_LOST".into(),
                    message: "lost".into(),
                    should_retry: false,
                },
                reconnect_strategy: ReconnectStrategy::Rejoin,
            }
        );
    }

    #[test]
    fn unit_events_parse() {
        let event: SfuEvent = serde_json::from_value(json!({"type": "participant_migration_complete"})).unwrap();
        assert_eq!(event.kind(), SfuEventKind::ParticipantMigrationComplete);
        let event: SfuEvent = serde_json::from_value(json!({"type": "pin_update"})).unwrap();
        assert_eq!(event, SfuEvent::Unknown);
    }

    #[test]
    fn join_request_is_tagged() {
        let request = SfuRequest::HealthCheckRequest {
            session_id: "s1".into(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "health_check_request", "session_id": "s1"})
        );
    }
}
