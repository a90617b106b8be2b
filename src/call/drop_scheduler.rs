use super::{Call, CallRegistry, RingDirection};
use crate::config::RingConfig;
use callcore::types::state::CallingState;
use log::{info, warn};
use std::sync::{Arc, Weak};

/// Drops ringing calls nobody answers, and incoming ones while the user is
/// busy in another call.
pub struct CallDropScheduler {
    config: RingConfig,
    registry: Weak<CallRegistry>,
}

impl CallDropScheduler {
    pub fn new(config: RingConfig, registry: Weak<CallRegistry>) -> Self {
        Self { config, registry }
    }

    /// Arms the drop for a call that just started ringing. The pending drop
    /// is cancelled as soon as the call leaves `ringing`.
    pub fn schedule(&self, call: &Arc<Call>, direction: RingDirection) {
        if direction == RingDirection::Incoming && self.config.auto_reject_when_in_call {
            let busy = self
                .registry
                .upgrade()
                .is_some_and(|registry| registry.in_another_call(call.cid()));
            if busy {
                info!(target: "Call/Drop", "[{}] Busy in another call, rejecting", call.cid());
                let call = call.clone();
                tokio::spawn(async move {
                    if let Err(e) = call.reject(Some("busy".into())).await {
                        warn!(target: "Call/Drop", "[{}] Failed to reject: {e}", call.cid());
                    }
                });
                return;
            }
        }

        let (timeout, reason) = match direction {
            RingDirection::Incoming => (self.config.auto_reject_timeout, "timeout"),
            RingDirection::Outgoing => (self.config.auto_cancel_timeout, "cancel"),
        };
        if timeout.is_zero() {
            return;
        }

        let mut state = call.state();
        let call = Arc::downgrade(call);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = async {
                    let _ = state.wait_for(|s| s.calling_state != CallingState::Ringing).await;
                } => return,
            }
            let Some(call) = call.upgrade() else { return };
            info!(target: "Call/Drop", "[{}] Nobody answered within {timeout:?}", call.cid());
            if let Err(e) = call.reject(Some(reason.into())).await {
                warn!(target: "Call/Drop", "[{}] Failed to drop: {e}", call.cid());
            }
        });
    }
}
