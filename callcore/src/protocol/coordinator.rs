//! Messages exchanged with the coordination service, over its push channel
//! and its request/response API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error code the coordinator uses for an expired token.
pub const TOKEN_EXPIRED_CODE: i64 = 40;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Identifies this client in auth messages and request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientDetails {
    pub sdk_name: String,
    pub sdk_version: String,
    pub os: String,
    pub device: Option<String>,
}

impl Default for ClientDetails {
    fn default() -> Self {
        Self {
            sdk_name: "video-call-rust".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            device: None,
        }
    }
}

impl ClientDetails {
    /// Value of the `X-Stream-Client` header.
    pub fn header_value(&self) -> String {
        format!("{}-v{}|os={}", self.sdk_name, self.sdk_version, self.os)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub unrecoverable: bool,
}

impl ApiError {
    pub fn is_token_expired(&self) -> bool {
        self.code == TOKEN_EXPIRED_CODE
    }
}

/// Call metadata as returned by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub cid: String,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub created_by: UserRef,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ringing: bool,
    #[serde(default)]
    pub custom: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberResponse {
    pub user: UserRef,
    #[serde(default)]
    pub role: Option<String>,
}

/// Events pushed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinatorEvent {
    #[serde(rename = "connection.ok")]
    ConnectionOk {
        connection_id: String,
        #[serde(default)]
        me: Option<UserRef>,
    },
    #[serde(rename = "connection.error")]
    ConnectionError { error: ApiError },
    #[serde(rename = "health.check")]
    HealthCheck {
        #[serde(default)]
        connection_id: Option<String>,
    },
    #[serde(rename = "call.created")]
    CallCreated {
        call_cid: String,
        call: CallResponse,
        #[serde(default)]
        members: Vec<MemberResponse>,
    },
    #[serde(rename = "call.ring")]
    CallRing {
        call_cid: String,
        call: CallResponse,
        #[serde(default)]
        members: Vec<MemberResponse>,
        #[serde(default)]
        video: bool,
    },
    #[serde(rename = "call.accepted")]
    CallAccepted {
        call_cid: String,
        user: UserRef,
        call: CallResponse,
    },
    #[serde(rename = "call.rejected")]
    CallRejected {
        call_cid: String,
        user: UserRef,
        call: CallResponse,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "call.ended")]
    CallEnded {
        call_cid: String,
        #[serde(default)]
        user: Option<UserRef>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "call.updated")]
    CallUpdated { call_cid: String, call: CallResponse },
    #[serde(rename = "call.permissions_updated")]
    CallPermissionsUpdated {
        call_cid: String,
        user: UserRef,
        own_capabilities: Vec<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Discriminant of [`CoordinatorEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorEventKind {
    ConnectionOk,
    ConnectionError,
    HealthCheck,
    CallCreated,
    CallRing,
    CallAccepted,
    CallRejected,
    CallEnded,
    CallUpdated,
    CallPermissionsUpdated,
    Unknown,
}

impl CoordinatorEvent {
    pub fn kind(&self) -> CoordinatorEventKind {
        use CoordinatorEventKind as K;
        match self {
            Self::ConnectionOk { .. } => K::ConnectionOk,
            Self::ConnectionError { .. } => K::ConnectionError,
            Self::HealthCheck { .. } => K::HealthCheck,
            Self::CallCreated { .. } => K::CallCreated,
            Self::CallRing { .. } => K::CallRing,
            Self::CallAccepted { .. } => K::CallAccepted,
            Self::CallRejected { .. } => K::CallRejected,
            Self::CallEnded { .. } => K::CallEnded,
            Self::CallUpdated { .. } => K::CallUpdated,
            Self::CallPermissionsUpdated { .. } => K::CallPermissionsUpdated,
            Self::Unknown => K::Unknown,
        }
    }

    /// The call this event is about, if any.
    pub fn call_cid(&self) -> Option<&str> {
        match self {
            Self::CallCreated { call_cid, .. }
            | Self::CallRing { call_cid, .. }
            | Self::CallAccepted { call_cid, .. }
            | Self::CallRejected { call_cid, .. }
            | Self::CallEnded { call_cid, .. }
            | Self::CallUpdated { call_cid, .. }
            | Self::CallPermissionsUpdated { call_cid, .. } => Some(call_cid),
            _ => None,
        }
    }
}

/// Messages sent over the coordinator push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinatorRequest {
    Auth(WsAuthMessage),
    HealthCheck(HealthCheckMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsAuthMessage {
    pub token: String,
    pub user_details: UserRef,
    pub client_details: ClientDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl HealthCheckMessage {
    pub fn new(client_id: Option<String>) -> Self {
        Self {
            kind: "health.check".to_string(),
            client_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetOrCreateCallRequest {
    #[serde(default)]
    pub ring: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetOrCreateCallResponse {
    pub call: CallResponse,
    #[serde(default)]
    pub members: Vec<MemberResponse>,
    #[serde(default)]
    pub own_capabilities: Vec<String>,
    #[serde(default)]
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinCallRequest {
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub ring: bool,
    /// Edge to avoid when assigning a media server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrating_from: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Where and how to reach the media server assigned to this join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuCredentials {
    pub server: SfuServer,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuServer {
    pub url: String,
    pub ws_endpoint: String,
    pub edge_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinCallResponse {
    pub call: CallResponse,
    pub credentials: SfuCredentials,
    #[serde(default)]
    pub own_capabilities: Vec<String>,
    #[serde(default)]
    pub members: Vec<MemberResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectCallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> serde_json::Value {
        json!({"cid": "default:123", "id": "123", "type": "default", "created_by": {"id": "alice"}})
    }

    #[test]
    fn parses_tagged_events() {
        let ring: CoordinatorEvent = serde_json::from_value(json!({
            "type": "call.ring", "call_cid": "default:123", "call": call(), "video": true
        }))
        .unwrap();
        assert_eq!(ring.kind(), CoordinatorEventKind::CallRing);
        assert_eq!(ring.call_cid(), Some("default:123"));

        let error: CoordinatorEvent = serde_json::from_value(json!({
            "type": "connection.error", "error": {"code": 40, "message": "token expired"}
        }))
        .unwrap();
        match error {
            CoordinatorEvent::ConnectionError { error } => assert!(error.is_token_expired()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let event: CoordinatorEvent =
            serde_json::from_value(json!({"type": "call.reaction_new", "call_cid": "x:y"})).unwrap();
        assert_eq!(event, CoordinatorEvent::Unknown);
        assert_eq!(event.call_cid(), None);
    }

    #[test]
    fn health_check_message_shape() {
        let msg = CoordinatorRequest::HealthCheck(HealthCheckMessage::new(Some("c1".into())));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "health.check", "client_id": "c1"})
        );
    }
}
