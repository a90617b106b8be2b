use super::{Call, CallEnvironment, CallRegistry, CallSummary};
use crate::channel::{ChannelStatus, CredentialsProvider, Subscription, TransportChannel};
use crate::coordinator::CoordinatorProtocol;
use crate::error::CallError;
use crate::lock;
use crate::transport::TransportFactory;
use crate::types::events::EventBus;
use callcore::protocol::coordinator::{CoordinatorEvent, CoordinatorEventKind};
use callcore::types::call::CallId;
use log::{debug, info};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

struct Router {
    subscription: Subscription,
    tasks: Vec<AbortHandle>,
}

/// Owns the coordinator channel and the calls of one user, and routes
/// coordinator events to the call they are about.
pub struct CallClient {
    env: Arc<CallEnvironment>,
    registry: Arc<CallRegistry>,
    channel: Mutex<Option<Arc<TransportChannel<CoordinatorProtocol>>>>,
    router: Mutex<Option<Router>>,
}

impl CallClient {
    pub fn new(env: CallEnvironment) -> Arc<Self> {
        Arc::new(Self {
            env: Arc::new(env),
            registry: CallRegistry::new(),
            channel: Mutex::new(None),
            router: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.env.bus
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn calls(&self) -> watch::Receiver<Vec<CallSummary>> {
        self.registry.calls()
    }

    /// Returns the call with this id, creating a local handle if needed.
    pub fn call(&self, call_type: &str, id: &str) -> Arc<Call> {
        self.call_for(CallId::new(call_type, id))
    }

    fn call_for(&self, id: CallId) -> Arc<Call> {
        let cid = id.cid();
        self.registry.get_or_create(&cid, || {
            Call::new(id, self.env.clone(), Arc::downgrade(&self.registry))
        })
    }

    /// Opens the coordinator channel and starts routing its events. Events
    /// are applied one at a time, in the order they were received.
    pub async fn connect(
        self: &Arc<Self>,
        credentials: Arc<dyn CredentialsProvider>,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<(), CallError> {
        let protocol = CoordinatorProtocol::new(self.env.user.clone(), self.env.config.client_details.clone());
        let channel = TransportChannel::connect(
            protocol,
            self.env.config.coordinator_ws_url.clone(),
            credentials,
            transports,
            self.env.config.channel.clone(),
        )
        .await?;
        info!(target: "CallClient", "Connected to the coordinator as {}", self.env.user.id);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let subscription = channel.on(None, move |event: &CoordinatorEvent| {
            let _ = events_tx.send(event.clone());
        });

        let client = Arc::downgrade(self);
        let routing = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(client) = client.upgrade() else { break };
                client.dispatch(event).await;
            }
        });

        let mut status = channel.status();
        let bus = self.env.bus.clone();
        let status_task = tokio::spawn(async move {
            loop {
                let current: ChannelStatus = *status.borrow_and_update();
                let _ = bus.channel_status.send(current);
                if status.changed().await.is_err() {
                    break;
                }
            }
        });

        *lock(&self.channel) = Some(channel);
        let previous = lock(&self.router).replace(Router {
            subscription,
            tasks: vec![routing.abort_handle(), status_task.abort_handle()],
        });
        if let Some(previous) = previous {
            stop_router(previous);
        }
        Ok(())
    }

    /// Applies one coordinator event. Ring and created events may create the
    /// call; anything else about an unknown call is ignored.
    pub async fn dispatch(&self, event: CoordinatorEvent) {
        let _ = self.env.bus.coordinator_event.send(Arc::new(event.clone()));
        let Some(cid) = event.call_cid() else {
            return;
        };
        let call = match event.kind() {
            CoordinatorEventKind::CallCreated | CoordinatorEventKind::CallRing => match cid.parse::<CallId>() {
                Ok(id) => self.call_for(id),
                Err(e) => {
                    debug!(target: "CallClient", "Ignoring event: {e}");
                    return;
                }
            },
            _ => match self.registry.get(cid) {
                Some(call) => call,
                None => {
                    debug!(target: "CallClient", "Ignoring {:?} for unknown call {cid}", event.kind());
                    return;
                }
            },
        };
        call.handle_coordinator_event(&event, &self.env.user.id).await;
    }

    /// Connectivity signal from the host, fanned out to the coordinator
    /// channel and every call.
    pub fn set_network_available(&self, online: bool) {
        if let Some(channel) = lock(&self.channel).as_ref() {
            channel.set_online(online);
        }
        for call in self.registry.all() {
            call.set_network_available(online);
        }
    }

    /// Leaves every call and closes the coordinator channel.
    pub async fn disconnect(&self) {
        for call in self.registry.all() {
            let _ = call.leave("client disconnected").await;
        }
        let router = lock(&self.router).take();
        if let Some(router) = router {
            stop_router(router);
        }
        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

fn stop_router(router: Router) {
    router.subscription.unsubscribe();
    for task in router.tasks {
        task.abort();
    }
}
