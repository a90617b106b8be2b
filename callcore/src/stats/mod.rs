//! Media transport statistics: snapshots, delta compression and derived
//! performance metrics.

mod delta;
mod metrics;
mod performance;

pub use delta::{StatsDelta, delta_compress};
pub use metrics::{PublisherMetrics, SubscriberMetrics, publisher_metrics, round_trip_time_ms, subscriber_metrics};
pub use performance::{DecodeTracker, EncodeTracker, PerformanceStats, codec_name};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One report entry: named metrics as reported by the media transport.
pub type StatsEntry = Map<String, Value>;

/// A report taken from the media transport, keyed by entry id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsSnapshot {
    pub entries: BTreeMap<String, StatsEntry>,
}

impl StatsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, entry: StatsEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&StatsEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose `type` field equals `kind` (e.g. `outbound-rtp`).
    pub fn of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a String, &'a StatsEntry)> + 'a {
        self.entries
            .iter()
            .filter(move |(_, e)| e.get("type").and_then(Value::as_str) == Some(kind))
    }

    /// The newest `timestamp` across all entries.
    pub fn max_timestamp(&self) -> Option<f64> {
        self.entries
            .values()
            .filter_map(|e| number(e, "timestamp"))
            .fold(None, |acc, ts| Some(acc.map_or(ts, |a: f64| a.max(ts))))
    }
}

impl FromIterator<(String, StatsEntry)> for StatsSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, StatsEntry)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub(crate) fn number(entry: &StatsEntry, field: &str) -> Option<f64> {
    entry.get(field).and_then(Value::as_f64)
}

pub(crate) fn string<'a>(entry: &'a StatsEntry, field: &str) -> Option<&'a str> {
    entry.get(field).and_then(Value::as_str)
}
