//! Heartbeat runtime.
//!
//! One task owns the [`Coordinator`]. Heartbeat ticks and inbound events are
//! handled from the same `select!` loop, so they never run concurrently
//! against the tree.

use crate::config::SyncConfig;
use crate::coordinator::Coordinator;
use crate::error::NetError;
use crate::transport::Transport;
use scopesync_core::Actor;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Work run against the coordinator on the runtime task.
pub type ApplyFn = Box<dyn FnOnce(&mut Coordinator) + Send>;

/// Events handled between heartbeats.
pub enum RuntimeEvent {
    /// An encoded request arrived
    Request {
        /// Sending actor
        from: Actor,
        /// Encoded request
        payload: Vec<u8>,
    },
    /// An actor joined
    Connected(Actor),
    /// An actor left
    Disconnected(Actor),
    /// Run a closure against the coordinator
    Apply(ApplyFn),
}

impl std::fmt::Debug for RuntimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeEvent::Request { from, payload } => f
                .debug_struct("Request")
                .field("from", from)
                .field("bytes", &payload.len())
                .finish(),
            RuntimeEvent::Connected(actor) => f.debug_tuple("Connected").field(actor).finish(),
            RuntimeEvent::Disconnected(actor) => {
                f.debug_tuple("Disconnected").field(actor).finish()
            }
            RuntimeEvent::Apply(_) => f.write_str("Apply"),
        }
    }
}

/// Sends events to a running [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    sender: mpsc::Sender<RuntimeEvent>,
}

impl RuntimeHandle {
    async fn send(&self, event: RuntimeEvent) -> Result<(), NetError> {
        self.sender.send(event).await.map_err(|_| NetError::RuntimeStopped)
    }

    /// Deliver an encoded request from `from`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeStopped` if the runtime has exited.
    pub async fn deliver(&self, from: Actor, payload: Vec<u8>) -> Result<(), NetError> {
        self.send(RuntimeEvent::Request { from, payload }).await
    }

    /// Report a joined actor.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeStopped` if the runtime has exited.
    pub async fn connect(&self, actor: Actor) -> Result<(), NetError> {
        self.send(RuntimeEvent::Connected(actor)).await
    }

    /// Report a departed actor.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeStopped` if the runtime has exited.
    pub async fn disconnect(&self, actor: Actor) -> Result<(), NetError> {
        self.send(RuntimeEvent::Disconnected(actor)).await
    }

    /// Run `f` on the runtime task and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeStopped` if the runtime exits before running `f`.
    pub async fn apply<R, F>(&self, f: F) -> Result<R, NetError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Coordinator) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(RuntimeEvent::Apply(Box::new(move |coordinator| {
            let _ = tx.send(f(coordinator));
        })))
        .await?;
        rx.await.map_err(|_| NetError::RuntimeStopped)
    }
}

/// Drives one coordinator from a single task.
pub struct Runtime<T> {
    coordinator: Coordinator,
    transport: T,
    events: mpsc::Receiver<RuntimeEvent>,
    tick: Duration,
}

impl<T: Transport> Runtime<T> {
    /// Create a runtime and the handle that feeds it.
    #[must_use]
    pub fn new(
        coordinator: Coordinator,
        transport: T,
        config: &SyncConfig,
    ) -> (Self, RuntimeHandle) {
        let (sender, events) = mpsc::channel(config.inbound_capacity.max(1));
        let runtime = Self {
            coordinator,
            transport,
            events,
            tick: config.tick,
        };
        (runtime, RuntimeHandle { sender })
    }

    /// Run until `shutdown` completes or every handle is dropped. A final tick
    /// flushes anything queued, then the coordinator is handed back.
    pub async fn run<S>(mut self, shutdown: S) -> Coordinator
    where
        S: Future<Output = ()>,
    {
        let mut heartbeat = tokio::time::interval(self.tick);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(tick_ms = self.tick.as_millis(), "Runtime started");

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let report = self.coordinator.tick(&mut self.transport);
                    if report.packets > 0 {
                        tracing::debug!(
                            packets = report.packets,
                            requests = report.requests,
                            failures = report.failures,
                            "Tick"
                        );
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        tracing::info!("All runtime handles dropped");
                        break;
                    }
                },
                () = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.coordinator.tick(&mut self.transport);
        tracing::info!("Runtime stopped");
        self.coordinator
    }

    fn handle(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Request { from, payload } => {
                match self.coordinator.process_request(&payload, from, &mut self.transport) {
                    Ok(()) => {}
                    Err(NetError::Protocol { actor, violation }) => {
                        tracing::debug!(%actor, %violation, "Request refused");
                    }
                    Err(e) => tracing::warn!(%from, error = %e, "Request failed"),
                }
            }
            RuntimeEvent::Connected(actor) => {
                if let Err(e) = self.coordinator.actor_connected(actor) {
                    tracing::warn!(%actor, error = %e, "Failed to register actor");
                }
            }
            RuntimeEvent::Disconnected(actor) => {
                if let Err(e) = self.coordinator.actor_disconnected(actor) {
                    tracing::warn!(%actor, error = %e, "Failed to clean up actor");
                }
            }
            RuntimeEvent::Apply(f) => f(&mut self.coordinator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use scopesync_core::{Definition, ReplicaContext};
    use serde_json::json;

    fn config() -> SyncConfig {
        SyncConfig {
            tick: Duration::from_millis(5),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn apply_runs_on_the_runtime_task() {
        let hub = MemoryHub::new();
        let coordinator = Coordinator::build(
            vec![(
                "Public",
                Definition::public_server(vec![("Round", Definition::leaf(1))]),
            )],
            ReplicaContext::server(),
        )
        .unwrap();
        let (runtime, handle) = Runtime::new(coordinator, hub.transport(Actor::Server), &config());
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(runtime.run(async move {
            let _ = stopped.await;
        }));

        let round = handle
            .apply(|c| {
                let tree = c.tree_mut();
                let key = tree.resolve("Public/Round").unwrap();
                tree.set(key, json!(2)).unwrap();
                tree.value(key).unwrap().cloned()
            })
            .await
            .unwrap();
        assert_eq!(round, Some(json!(2)));

        stop.send(()).unwrap();
        let coordinator = task.await.unwrap();
        assert_eq!(coordinator.phase(), crate::coordinator::Phase::Running);
    }

    #[tokio::test]
    async fn refused_request_keeps_the_runtime_alive() {
        let hub = MemoryHub::new();
        let client = Actor::Client(scopesync_core::ClientId::random());
        let _client_box = hub.register(client);
        let coordinator = Coordinator::build(
            Vec::<(&str, Definition)>::new(),
            ReplicaContext::server(),
        )
        .unwrap();
        let (runtime, handle) = Runtime::new(coordinator, hub.transport(Actor::Server), &config());
        let task = tokio::spawn(runtime.run(std::future::pending()));

        handle.deliver(client, vec![0xff, 0x00]).await.unwrap();
        let connected = handle.apply(|c| c.connected().count()).await.unwrap();
        assert_eq!(connected, 0);
        assert_eq!(hub.disconnects().len(), 1);
        assert_eq!(hub.disconnects()[0].peer, client);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_handles_drop() {
        let hub = MemoryHub::new();
        let coordinator = Coordinator::build(
            Vec::<(&str, Definition)>::new(),
            ReplicaContext::server(),
        )
        .unwrap();
        let (runtime, handle) = Runtime::new(coordinator, hub.transport(Actor::Server), &config());
        drop(handle);
        let coordinator = runtime.run(std::future::pending()).await;
        assert!(coordinator.tree().is_empty());
    }
}
