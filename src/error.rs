use callcore::sdp::SdpError;
use callcore::types::state::InvalidTransition;
use std::sync::Arc;
use thiserror::Error;

/// Failures of a single transport channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The server rejected the credentials; they must be refreshed first.
    #[error("credentials expired")]
    AuthExpired,

    #[error("network unavailable")]
    NetworkUnavailable,

    /// Fatal for this channel instance.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel closed")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ChannelError {
    /// Whether another attempt may succeed without outside intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::NotConnected | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The single error type surfaced by a call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] SdpError),

    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("attempt cancelled")]
    Cancelled,

    #[error("session could not be resumed with identical subscriptions")]
    ResumeDiverged,

    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),

    #[error("coordinator returned {status}: {message}")]
    Coordinator {
        status: u16,
        code: Option<i64>,
        message: String,
        unrecoverable: bool,
    },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("media transport error: {0}")]
    Media(Arc<anyhow::Error>),
}

impl CallError {
    /// Errors that retrying cannot fix.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Coordinator { unrecoverable, .. } => *unrecoverable,
            Self::Auth(_)
            | Self::Protocol(_)
            | Self::Negotiation(_)
            | Self::InvalidTransition(_)
            | Self::NotFound(_)
            | Self::IllegalState(_) => true,
            Self::Channel(e) => matches!(e, ChannelError::Protocol(_) | ChannelError::AuthExpired),
            _ => false,
        }
    }

    pub fn media(err: anyhow::Error) -> Self {
        Self::Media(Arc::new(err))
    }
}
