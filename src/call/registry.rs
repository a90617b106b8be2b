use super::Call;
use callcore::types::state::CallingState;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub cid: String,
    pub calling_state: CallingState,
}

/// The calls known to a client, keyed by cid. Calls are added when first
/// referenced and removed when they reach `left`.
pub struct CallRegistry {
    calls: DashMap<String, Arc<Call>>,
    list: watch::Sender<Vec<CallSummary>>,
}

impl CallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: DashMap::new(),
            list: watch::Sender::new(Vec::new()),
        })
    }

    pub fn get(&self, cid: &str) -> Option<Arc<Call>> {
        self.calls.get(cid).map(|entry| entry.value().clone())
    }

    /// Returns the call for `cid`, creating it with `create` if needed. Two
    /// racing lookups for the same cid get the same call.
    pub fn get_or_create(&self, cid: &str, create: impl FnOnce() -> Arc<Call>) -> Arc<Call> {
        let mut created = false;
        let call = self
            .calls
            .entry(cid.to_string())
            .or_insert_with(|| {
                created = true;
                create()
            })
            .value()
            .clone();
        if created {
            let summary = CallSummary {
                cid: cid.to_string(),
                calling_state: call.calling_state(),
            };
            self.list.send_modify(|list| list.push(summary));
        }
        call
    }

    pub fn all(&self) -> Vec<Arc<Call>> {
        self.calls.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Watches the list of calls and their states.
    pub fn calls(&self) -> watch::Receiver<Vec<CallSummary>> {
        self.list.subscribe()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whether a call other than `cid` currently holds a session.
    pub fn in_another_call(&self, cid: &str) -> bool {
        self.list
            .borrow()
            .iter()
            .any(|summary| summary.cid != cid && summary.calling_state.is_in_session())
    }

    pub(crate) fn set_state(&self, cid: &str, state: CallingState) {
        self.list.send_if_modified(|list| match list.iter_mut().find(|s| s.cid == cid) {
            Some(summary) if summary.calling_state != state => {
                summary.calling_state = state;
                true
            }
            _ => false,
        });
    }

    pub(crate) fn remove(&self, cid: &str) {
        self.calls.remove(cid);
        self.list.send_if_modified(|list| {
            let before = list.len();
            list.retain(|summary| summary.cid != cid);
            list.len() != before
        });
    }
}
