// Runtime-agnostic pieces live in callcore; re-export the ones callers need.
pub use callcore::{backoff, protocol, sdp, stats, trace};

pub mod types {
    pub use callcore::types::*;
    pub mod events;
}

pub mod call;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod keepalive;
pub mod media;
pub mod orchestrator;
pub mod session;
pub mod stats_reporter;
pub mod transport;

pub use call::{Call, CallClient, CallEnvironment, CallSnapshot, JoinOptions};
pub use config::ClientConfig;
pub use error::{CallError, ChannelError};

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
