use crate::channel::{ChannelProtocol, Connection, TransportChannel};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Spread keepalives a little so many channels opened together do not ping in lockstep.
const KEEPALIVE_JITTER_MS: u64 = 500;

impl<P: ChannelProtocol> TransportChannel<P> {
    fn next_keepalive_interval(&self) -> Duration {
        let base = self.config.keepalive_interval;
        let jitter = rand::rng().random_range(0..=KEEPALIVE_JITTER_MS);
        base.saturating_sub(Duration::from_millis(KEEPALIVE_JITTER_MS / 2)) + Duration::from_millis(jitter)
    }

    /// Periodic health check for one connection. Ends when the connection is
    /// replaced, the channel closes, or nothing has been heard for longer than
    /// the connection check timeout; in the last case the connection is
    /// reported lost so the supervisor reconnects.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, connection: Arc<Connection>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut error_count = 0u32;

        loop {
            let interval = self.next_keepalive_interval();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.generation() != connection.generation {
                        debug!(target: "Channel/Keepalive", "{} connection replaced, exiting keepalive loop.", P::NAME);
                        return;
                    }

                    let idle = connection.idle_for();
                    if idle > self.config.connection_check_timeout {
                        warn!(
                            target: "Channel/Keepalive",
                            "{} silent for {}s, dropping connection.",
                            P::NAME,
                            idle.as_secs()
                        );
                        connection.lost.notify_one();
                        return;
                    }

                    debug!(target: "Channel/Keepalive", "Sending {} keepalive", P::NAME);
                    let message = self.protocol.keepalive_message();
                    match self.send_on(connection.transport.as_ref(), &message).await {
                        Ok(()) => {
                            if error_count > 0 {
                                info!(target: "Channel/Keepalive", "{} keepalive restored.", P::NAME);
                            }
                            error_count = 0;
                        }
                        Err(e) => {
                            error_count += 1;
                            warn!(target: "Channel/Keepalive", "{} keepalive failed ({e}), error count: {error_count}", P::NAME);
                        }
                    }
                },
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => {
                    debug!(target: "Channel/Keepalive", "Shutdown signaled, exiting keepalive loop.");
                    return;
                }
            }
        }
    }
}
