use crate::channel::ChannelStatus;
use crate::error::CallError;
use crate::stats_reporter::CallStatsReport;
use callcore::protocol::coordinator::CoordinatorEvent;
use callcore::protocol::sfu::ReconnectStrategy;
use callcore::types::state::CallingState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct CallingStateChanged {
    pub cid: String,
    pub previous: CallingState,
    pub current: CallingState,
}

/// A recovery or migration finished and media is flowing again.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconnected {
    pub cid: String,
    pub strategy: ReconnectStrategy,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconnectFailed {
    pub cid: String,
    pub error: CallError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationAborted {
    pub cid: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct StatsReported {
    pub cid: String,
    pub report: CallStatsReport,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle
    (calling_state_changed, Arc<CallingStateChanged>),
    (reconnected, Arc<Reconnected>),
    (reconnect_failed, Arc<ReconnectFailed>),
    (migration_aborted, Arc<MigrationAborted>),
    (stats_report, Arc<StatsReported>),

    // Coordinator push channel
    (coordinator_event, Arc<CoordinatorEvent>),
    (channel_status, ChannelStatus),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
