use callcore::backoff::Backoff;
use callcore::protocol::coordinator::ClientDetails;
use callcore::trace::DEFAULT_TRACE_CAPACITY;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Durations are written as milliseconds in config documents.
mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_key: String,
    pub coordinator_ws_url: String,
    pub coordinator_base_url: String,
    pub client_details: ClientDetails,
    pub channel: ChannelConfig,
    pub reconnect: ReconnectPolicy,
    pub stats: StatsConfig,
    pub ring: RingConfig,
    pub media: MediaConfig,
    pub max_join_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            coordinator_ws_url: "wss://video.stream-io-api.com/video/connect".to_string(),
            coordinator_base_url: "https://video.stream-io-api.com/video".to_string(),
            client_details: ClientDetails::default(),
            channel: ChannelConfig::default(),
            reconnect: ReconnectPolicy::default(),
            stats: StatsConfig::default(),
            ring: RingConfig::default(),
            media: MediaConfig::default(),
            max_join_retries: 3,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&text)?)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// Without any inbound traffic for this long the connection is considered dead.
    #[serde(with = "duration_ms")]
    pub connection_check_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Consecutive failed connection attempts before the channel gives up; 0 retries forever.
    pub max_consecutive_failures: u32,
    /// Whether the channel re-establishes itself after a drop.
    pub auto_reconnect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let keepalive_interval = Duration::from_secs(25);
        Self {
            keepalive_interval,
            connection_check_timeout: keepalive_interval + Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_consecutive_failures: 0,
            auto_reconnect: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Fast attempts before falling back to a full rejoin.
    pub max_fast_attempts: u32,
    /// Full rejoin attempts before giving up.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Offline (or failing) for longer than this and the session is rejoined.
    #[serde(with = "duration_ms")]
    pub fast_reconnect_deadline: Duration,
    /// Overall limit for one recovery; zero means no limit.
    #[serde(with = "duration_ms")]
    pub disconnection_timeout: Duration,
    /// How long a replacement session gets to show media flowing.
    #[serde(with = "duration_ms")]
    pub migration_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_fast_attempts: 3,
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            fast_reconnect_deadline: Duration::from_secs(10),
            disconnection_timeout: Duration::ZERO,
            migration_timeout: Duration::from_secs(7),
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Round trip time (ms) above which the media server is considered degraded.
    pub rtt_migration_threshold_ms: f64,
    /// Consecutive degraded samples before a migration is requested.
    pub rtt_strikes: u32,
    pub trace_capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            rtt_migration_threshold_ms: 1000.0,
            rtt_strikes: 3,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    #[serde(with = "duration_ms")]
    pub auto_reject_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub auto_cancel_timeout: Duration,
    pub auto_reject_when_in_call: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            auto_reject_timeout: Duration::from_secs(45),
            auto_cancel_timeout: Duration::from_secs(45),
            auto_reject_when_in_call: false,
        }
    }
}

/// How outgoing media is negotiated.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Restrict the published video to this codec, e.g. `video/vp9`.
    pub video_codec: Option<String>,
    /// Required fmtp parameters of the codec above, e.g. `profile-id=2`.
    pub video_fmtp_profile: Option<String>,
    /// Cap used to derive the encoder start bitrate.
    pub max_video_bitrate_kbps: Option<u32>,
    pub start_bitrate_factor: f64,
    /// Mid of the published video section.
    pub video_mid: String,
    pub dtx: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_codec: None,
            video_fmtp_profile: None,
            max_video_bitrate_kbps: None,
            start_bitrate_factor: 0.7,
            video_mid: "1".to_string(),
            dtx: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{"api_key": "k", "reconnect": {"max_attempts": 2, "initial_delay": 10}, "stats": {"interval": 500}}"#,
        )
        .unwrap();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(10));
        assert_eq!(config.reconnect.max_fast_attempts, 3);
        assert_eq!(config.stats.interval, Duration::from_millis(500));
        assert_eq!(config.channel.connection_check_timeout, Duration::from_secs(35));
        assert_eq!(config.max_join_retries, 3);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ring": {{"auto_reject_when_in_call": true}}}}"#).unwrap();
        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert!(config.ring.auto_reject_when_in_call);
        assert_eq!(config.ring.auto_reject_timeout, Duration::from_secs(45));
    }
}
