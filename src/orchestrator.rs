//! Recovery of a call's media session: when to reconnect, with which
//! strategy, and when to move to another media server.

use crate::call::{Call, RingResponse};
use crate::config::{ReconnectPolicy, StatsConfig};
use crate::error::CallError;
use crate::session::{RestoreOutcome, SessionLink, SessionSignal};
use crate::types::events::{MigrationAborted, ReconnectFailed, Reconnected};
use callcore::protocol::coordinator::JoinCallRequest;
use callcore::protocol::sfu::ReconnectStrategy;
use callcore::types::state::{CallTransition, CallingState};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::time::Instant;

/// Decision state kept per call between recovery attempts.
#[derive(Debug)]
pub(crate) struct Orchestrator {
    policy: ReconnectPolicy,
    rtt_threshold_ms: f64,
    rtt_strikes_needed: u32,
    rtt_strikes: u32,
    offline_since: Option<Instant>,
    migration_failed: bool,
}

impl Orchestrator {
    pub(crate) fn new(policy: ReconnectPolicy, stats: &StatsConfig) -> Self {
        Self {
            policy,
            rtt_threshold_ms: stats.rtt_migration_threshold_ms,
            rtt_strikes_needed: stats.rtt_strikes,
            rtt_strikes: 0,
            offline_since: None,
            migration_failed: false,
        }
    }

    /// Counts consecutive samples above the threshold. Returns true, and
    /// starts counting again, once a migration is due.
    pub(crate) fn record_rtt(&mut self, rtt_ms: f64) -> bool {
        if rtt_ms > self.rtt_threshold_ms {
            self.rtt_strikes += 1;
        } else {
            self.rtt_strikes = 0;
        }
        if self.rtt_strikes_needed > 0 && self.rtt_strikes >= self.rtt_strikes_needed {
            self.rtt_strikes = 0;
            return true;
        }
        false
    }

    pub(crate) fn went_offline(&mut self) {
        self.offline_since.get_or_insert_with(Instant::now);
    }

    /// Strategy to recover with once connectivity returns.
    pub(crate) fn came_online(&mut self) -> ReconnectStrategy {
        match self.offline_since.take() {
            Some(since) if since.elapsed() > self.policy.fast_reconnect_deadline => ReconnectStrategy::Rejoin,
            _ => ReconnectStrategy::Fast,
        }
    }

    /// Strategy for the next attempt of a recovery that started at `started`.
    /// Once a recovery falls back to rejoining it does not go back.
    pub(crate) fn next_strategy(
        &self,
        requested: ReconnectStrategy,
        fast_failures: u32,
        started: Instant,
        session_healthy: bool,
    ) -> ReconnectStrategy {
        match requested {
            ReconnectStrategy::Fast | ReconnectStrategy::Unspecified => {
                let rejoin = !session_healthy
                    || self.migration_failed
                    || fast_failures >= self.policy.max_fast_attempts
                    || started.elapsed() > self.policy.fast_reconnect_deadline;
                if rejoin {
                    ReconnectStrategy::Rejoin
                } else {
                    ReconnectStrategy::Fast
                }
            }
            other => other,
        }
    }

    pub(crate) fn on_migration_aborted(&mut self) {
        self.migration_failed = true;
        self.rtt_strikes = 0;
    }

    pub(crate) fn on_session_established(&mut self) {
        self.rtt_strikes = 0;
        self.migration_failed = false;
        self.offline_since = None;
    }
}

impl Call {
    /// Reacts to something a session reported. Signals from sessions that
    /// are no longer active are dropped.
    pub(crate) fn on_session_signal(&self, session_id: &str, signal: SessionSignal) {
        let (state, healthy) = {
            let inner = self.lock_inner();
            match &inner.session {
                Some(link) if link.session().session_id == session_id => {
                    (inner.machine.state(), link.is_healthy())
                }
                // The link a join is still setting up; it cannot be resumed.
                _ if inner.joining.as_deref() == Some(session_id) => (inner.machine.state(), false),
                _ => {
                    debug!(target: "Call/Reconnect", "[{}] Ignoring {signal:?} from session {session_id}", self.cid());
                    return;
                }
            }
        };

        match signal {
            SessionSignal::TransportLost => {
                let strategy = if healthy {
                    ReconnectStrategy::Fast
                } else {
                    ReconnectStrategy::Rejoin
                };
                info!(target: "Call/Reconnect", "[{}] Session transport lost", self.cid());
                self.spawn_reconnect(strategy);
            }
            SessionSignal::PeerUnhealthy(side) => {
                warn!(target: "Call/Reconnect", "[{}] {} peer connection failed", self.cid(), side.as_str());
                self.spawn_reconnect(ReconnectStrategy::Rejoin);
            }
            SessionSignal::GoAway { reason } => {
                info!(target: "Call/Migrate", "[{}] Media server is going away: {reason}", self.cid());
                self.spawn_reconnect(ReconnectStrategy::Migrate);
            }
            SessionSignal::ServerError { strategy, message } => {
                warn!(target: "Call/Reconnect", "[{}] Media server error: {message}", self.cid());
                if strategy != ReconnectStrategy::Unspecified {
                    self.spawn_reconnect(strategy);
                }
            }
            SessionSignal::CallEnded { reason } => {
                if let Some(call) = self.this.upgrade() {
                    tokio::spawn(async move {
                        let _ = call.terminate(&reason, RingResponse::Silent).await;
                    });
                }
            }
            SessionSignal::Quality { rtt_ms } => {
                let migrate = self.lock_inner().orchestrator.record_rtt(rtt_ms);
                if migrate && state == CallingState::Joined {
                    info!(target: "Call/Migrate", "[{}] Round trip time stayed above threshold ({rtt_ms} ms)", self.cid());
                    self.spawn_reconnect(ReconnectStrategy::Migrate);
                }
            }
        }
    }

    pub(crate) fn spawn_reconnect(&self, strategy: ReconnectStrategy) {
        if let Some(call) = self.this.upgrade() {
            tokio::spawn(async move { call.reconnect(strategy).await });
        }
    }

    /// Recovers the session with `strategy` as the first choice. Ends in
    /// `joined`, or in `reconnecting-failed` with the reason recorded.
    pub async fn reconnect(&self, strategy: ReconnectStrategy) {
        match strategy {
            ReconnectStrategy::Disconnect => {
                let _ = self
                    .terminate("media server asked to disconnect", RingResponse::Silent)
                    .await;
                return;
            }
            ReconnectStrategy::Migrate => {
                self.migrate().await;
                return;
            }
            _ => {}
        }

        let started = Instant::now();
        let epoch = {
            let mut inner = self.lock_inner();
            let state = inner.machine.state();
            if !matches!(state, CallingState::Joining | CallingState::Joined | CallingState::Offline) {
                debug!(target: "Call/Reconnect", "[{}] Not reconnecting from {state}", self.cid());
                return;
            }
            if self.transition(&mut inner, CallTransition::ConnectionLost).is_err() {
                return;
            }
            inner.reporter = None;
            self.bump_epoch()
        };

        match self.recover(epoch, strategy, started).await {
            Ok((strategy, attempts)) => {
                let elapsed = started.elapsed();
                info!(
                    target: "Call/Reconnect",
                    "[{}] Reconnected with {strategy:?} after {attempts} attempt(s) in {elapsed:?}",
                    self.cid()
                );
                let _ = self.env.bus.reconnected.send(Arc::new(Reconnected {
                    cid: self.cid().to_string(),
                    strategy,
                    attempts,
                    elapsed,
                }));
            }
            Err(CallError::Cancelled) => {
                debug!(target: "Call/Reconnect", "[{}] Recovery superseded", self.cid());
            }
            Err(failure) => {
                let session = {
                    let mut inner = self.lock_inner();
                    if !self.is_current(epoch) {
                        return;
                    }
                    inner.last_error = Some(failure.clone());
                    let session = inner.session.take();
                    if self
                        .transition(&mut inner, CallTransition::RetriesExhausted)
                        .is_err()
                    {
                        inner.session = session;
                        return;
                    }
                    session
                };
                error!(target: "Call/Reconnect", "[{}] Giving up: {failure}", self.cid());
                let _ = self.env.bus.reconnect_failed.send(Arc::new(ReconnectFailed {
                    cid: self.cid().to_string(),
                    error: failure,
                }));
                if let Some(session) = session {
                    session.close("reconnect failed").await;
                }
            }
        }
    }

    /// Runs attempts until one succeeds, the budget is spent, or the
    /// recovery is superseded. Fast attempts do not count against the budget.
    async fn recover(
        &self,
        epoch: u64,
        requested: ReconnectStrategy,
        started: Instant,
    ) -> Result<(ReconnectStrategy, u32), CallError> {
        let policy = self.env.config.reconnect.clone();
        let backoff = policy.backoff();
        let mut strategy = requested;
        let mut fast_failures = 0;
        let mut rejoin_failures = 0;
        let mut attempt = 0;
        loop {
            self.ensure_current(epoch)?;
            if !policy.disconnection_timeout.is_zero() && started.elapsed() > policy.disconnection_timeout {
                return Err(CallError::ReconnectFailed(format!(
                    "still disconnected after {:?}",
                    started.elapsed()
                )));
            }

            strategy = {
                let inner = self.lock_inner();
                let healthy = inner.session.as_ref().is_some_and(|link| link.is_healthy());
                inner
                    .orchestrator
                    .next_strategy(strategy, fast_failures, started, healthy)
            };
            attempt += 1;
            info!(target: "Call/Reconnect", "[{}] Attempt {attempt} with {strategy:?}", self.cid());

            let result = match strategy {
                ReconnectStrategy::Fast => self.reconnect_fast(epoch, attempt).await,
                _ => self.reconnect_rejoin(epoch, attempt).await,
            };
            let failure = match result {
                Ok(()) => return Ok((strategy, attempt)),
                Err(e) => e,
            };
            match &failure {
                CallError::Cancelled => return Err(failure),
                CallError::Coordinator {
                    unrecoverable: true, ..
                } => return Err(failure),
                _ => {}
            }
            warn!(target: "Call/Reconnect", "[{}] {strategy:?} attempt {attempt} failed: {failure}", self.cid());

            if strategy == ReconnectStrategy::Fast {
                fast_failures += 1;
                if matches!(failure, CallError::ResumeDiverged) {
                    strategy = ReconnectStrategy::Rejoin;
                }
            } else {
                rejoin_failures += 1;
                if rejoin_failures >= policy.max_attempts {
                    return Err(CallError::ReconnectFailed(format!(
                        "{rejoin_failures} attempts failed, last: {failure}"
                    )));
                }
            }
            self.sleep_unless_superseded(backoff.delay(attempt - 1), epoch)
                .await?;
        }
    }

    /// Resumes the current session and checks that every subscription came
    /// back as it was.
    async fn reconnect_fast(&self, epoch: u64, attempt: u32) -> Result<(), CallError> {
        let link = self
            .lock_inner()
            .session
            .clone()
            .ok_or_else(|| CallError::IllegalState("no session to resume".into()))?;
        link.resume(attempt).await?;
        self.ensure_current(epoch)?;

        let (published, subscriptions) = self.tracks();
        if link.restore_tracks(&published, &subscriptions).await? == RestoreOutcome::Diverged {
            return Err(CallError::ResumeDiverged);
        }

        let mut inner = self.lock_inner();
        self.ensure_current(epoch)?;
        self.transition(&mut inner, CallTransition::Restored)?;
        inner.reporter = Some(self.start_stats(link.as_ref()));
        inner.orchestrator.on_session_established();
        Ok(())
    }

    /// Discards the session and joins again from scratch.
    async fn reconnect_rejoin(&self, epoch: u64, attempt: u32) -> Result<(), CallError> {
        let (previous, options) = {
            let inner = self.lock_inner();
            (
                inner.session.as_ref().map(|link| link.session()),
                inner.join_options.clone(),
            )
        };
        let request = JoinCallRequest {
            create: options.create,
            ring: false,
            migrating_from: None,
            location: None,
        };
        let mut edge = None;
        let link = self
            .open_session(epoch, &request, ReconnectStrategy::Rejoin, previous, attempt, &mut edge)
            .await?;
        let (published, subscriptions) = self.tracks();
        if let Err(e) = link.restore_tracks(&published, &subscriptions).await {
            link.close("rejoin failed").await;
            return Err(e);
        }
        self.install(epoch, link, CallTransition::Restored).await
    }

    /// Moves the call to another media server. The new session replaces the
    /// old one only after media arrived for every subscription; otherwise
    /// the old session is kept and the migration reported as aborted.
    pub async fn migrate(&self) {
        let started = Instant::now();
        let (epoch, old, options) = {
            let mut inner = self.lock_inner();
            let Some(old) = inner.session.clone() else {
                return;
            };
            if inner.machine.state() != CallingState::Joined {
                debug!(target: "Call/Migrate", "[{}] Not migrating from {}", self.cid(), inner.machine.state());
                return;
            }
            if self
                .transition(&mut inner, CallTransition::MigrationStarted)
                .is_err()
            {
                return;
            }
            inner.reporter = None;
            (self.bump_epoch(), old, inner.join_options.clone())
        };

        let old_session = old.session();
        info!(target: "Call/Migrate", "[{}] Migrating away from {}", self.cid(), old_session.edge_name);
        let (published, subscriptions) = self.tracks();
        let timeout = self.env.config.reconnect.migration_timeout;
        let mut candidate: Option<Arc<dyn SessionLink>> = None;

        let outcome = tokio::time::timeout(timeout, async {
            let request = JoinCallRequest {
                create: options.create,
                ring: false,
                migrating_from: Some(old_session.edge_name.clone()),
                location: None,
            };
            let mut edge = None;
            let link = self
                .open_session(
                    epoch,
                    &request,
                    ReconnectStrategy::Migrate,
                    Some(old_session.clone()),
                    0,
                    &mut edge,
                )
                .await?;
            candidate = Some(link.clone());
            let flowing = async {
                link.restore_tracks(&published, &subscriptions).await?;
                link.await_media_flow(&subscriptions).await
            };
            tokio::select! {
                flowing = flowing => flowing?,
                _ = self.superseded(epoch) => return Err(CallError::Cancelled),
            }
            Ok::<_, CallError>(link)
        })
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(CallError::MigrationAborted(format!(
                "no media from the new server within {timeout:?}"
            ))),
        };

        match result {
            Ok(link) => match self.install(epoch, link, CallTransition::MigrationCompleted).await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    info!(target: "Call/Migrate", "[{}] Migrated in {elapsed:?}", self.cid());
                    let _ = self.env.bus.reconnected.send(Arc::new(Reconnected {
                        cid: self.cid().to_string(),
                        strategy: ReconnectStrategy::Migrate,
                        attempts: 1,
                        elapsed,
                    }));
                }
                Err(e) => debug!(target: "Call/Migrate", "[{}] Migration superseded: {e}", self.cid()),
            },
            Err(CallError::Cancelled) => {
                if let Some(candidate) = candidate {
                    candidate.close("superseded").await;
                }
            }
            Err(failure) => {
                if let Some(candidate) = candidate {
                    candidate.close("migration aborted").await;
                }
                let reason = match failure {
                    CallError::MigrationAborted(reason) => reason,
                    other => other.to_string(),
                };
                let healthy = {
                    let mut inner = self.lock_inner();
                    if !self.is_current(epoch) {
                        return;
                    }
                    inner.last_error = Some(CallError::MigrationAborted(reason.clone()));
                    if self
                        .transition(&mut inner, CallTransition::MigrationAborted)
                        .is_err()
                    {
                        return;
                    }
                    inner.orchestrator.on_migration_aborted();
                    inner.reporter = Some(self.start_stats(old.as_ref()));
                    old.is_healthy()
                };
                warn!(target: "Call/Migrate", "[{}] Migration aborted, keeping the current server: {reason}", self.cid());
                let _ = self.env.bus.migration_aborted.send(Arc::new(MigrationAborted {
                    cid: self.cid().to_string(),
                    reason,
                }));
                if !healthy {
                    self.spawn_reconnect(ReconnectStrategy::Rejoin);
                }
            }
        }
    }
}
