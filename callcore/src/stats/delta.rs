use super::{StatsEntry, StatsSnapshot, number};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const TIMESTAMP: &str = "timestamp";

/// A snapshot with every field that did not change since the previous one
/// removed. The newest timestamp is carried once at the top level and the
/// entries holding it are set to the integer `0`. A timestamp that really is
/// zero is written as the float `0.0` so it is not mistaken for the newest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub timestamp: f64,
    #[serde(flatten)]
    pub entries: BTreeMap<String, StatsEntry>,
}

/// Computes the delta between `previous` (if any) and `current`.
///
/// Entries missing from `previous` are kept whole; entries present in both
/// keep only the fields whose value differs. An entry that did not change at
/// all is kept as an empty object so its presence survives.
pub fn delta_compress(previous: Option<&StatsSnapshot>, current: &StatsSnapshot) -> StatsDelta {
    let max_timestamp = current.max_timestamp().unwrap_or(0.0);

    let entries = current
        .entries
        .iter()
        .map(|(id, entry)| {
            let mut diff: StatsEntry = match previous.and_then(|p| p.get(id)) {
                Some(old) => entry
                    .iter()
                    .filter(|(k, v)| old.get(k.as_str()) != Some(v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => entry.clone(),
            };
            match number(&diff, TIMESTAMP) {
                Some(ts) if ts == max_timestamp => {
                    diff.insert(TIMESTAMP.to_string(), Value::from(0u64));
                }
                Some(ts) if ts == 0.0 => {
                    diff.insert(TIMESTAMP.to_string(), Value::from(0.0));
                }
                _ => {}
            }
            (id.clone(), diff)
        })
        .collect();

    StatsDelta {
        timestamp: max_timestamp,
        entries,
    }
}

impl StatsDelta {
    /// Rebuilds the snapshot this delta was computed from, given its baseline.
    pub fn apply(&self, baseline: Option<&StatsSnapshot>) -> StatsSnapshot {
        self.entries
            .iter()
            .map(|(id, diff)| {
                let mut entry = baseline
                    .and_then(|b| b.get(id))
                    .cloned()
                    .unwrap_or_default();
                for (key, value) in diff {
                    let restored = if key == TIMESTAMP && value.as_u64() == Some(0) {
                        Value::from(self.timestamp)
                    } else {
                        value.clone()
                    };
                    entry.insert(key.clone(), restored);
                }
                (id.clone(), entry)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.is_empty())
    }
}
