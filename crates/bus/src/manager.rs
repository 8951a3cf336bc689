//! Shared message-bus connection manager.
//!
//! [`ConnectionManager`] owns the single broker connection used by every
//! tracking session. It coalesces concurrent connect calls into one
//! attempt, runs a reader task per link that feeds the
//! [`SubscriptionRegistry`], and reconnects with bounded exponential
//! backoff when an established link drops on its own.
//!
//! Create one per composition root with [`ConnectionManager::new`] and
//! share the returned `Arc`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitzomax_core::naming::job_id_from_topic;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::StompConnector;
use crate::config::BusConfig;
use crate::registry::SubscriptionRegistry;
use crate::transport::{BusConnector, BusLink, LinkCommand, LinkEvent};

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type ConnectOutcome = Shared<BoxFuture<'static, bool>>;

struct ManagerInner {
    state: ConnectionState,
    endpoint: String,
    /// The in-flight connect attempt, awaited by every concurrent caller.
    pending: Option<ConnectOutcome>,
    /// Bumped by `disconnect`; attempts and reconnect loops started under
    /// an older epoch give up.
    epoch: u64,
    /// Sequence number of the current link, so a stale reader cannot
    /// report a drop for a newer link.
    link_seq: u64,
    link: Option<mpsc::UnboundedSender<LinkCommand>>,
    reconnect_attempts: u32,
    reconnecting: bool,
    /// Cancels reconnect loops; replaced on every `disconnect`.
    cancel: CancellationToken,
}

/// Manages the shared connection to the message bus.
pub struct ConnectionManager {
    config: BusConfig,
    connector: Arc<dyn BusConnector>,
    registry: Arc<SubscriptionRegistry>,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    /// Build a manager around any connector.
    pub fn new(config: BusConfig, connector: Arc<dyn BusConnector>) -> Arc<Self> {
        let endpoint = config.endpoint.clone();
        Arc::new(Self {
            config,
            connector,
            registry: Arc::new(SubscriptionRegistry::new()),
            inner: Mutex::new(ManagerInner {
                state: ConnectionState::Disconnected,
                endpoint,
                pending: None,
                epoch: 0,
                link_seq: 0,
                link: None,
                reconnect_attempts: 0,
                reconnecting: false,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Build a manager that speaks STOMP over WebSocket.
    pub fn stomp(config: BusConfig) -> Arc<Self> {
        let connector = Arc::new(StompConnector::new(config.heart_beat));
        Self::new(config, connector)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Whether an automatic reconnect loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.lock().reconnecting
    }

    /// Attempts made by the current (or last exhausted) reconnect loop.
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// Endpoint used by the next connect attempt.
    pub fn endpoint(&self) -> String {
        self.lock().endpoint.clone()
    }

    /// Connect to the bus, or join the attempt already in flight.
    ///
    /// `endpoint` replaces the remembered endpoint when given. Returns
    /// `true` immediately when already connected. Failures (handshake
    /// rejection, transport error, timeout) yield `false`; they never
    /// start the automatic reconnect loop.
    pub async fn connect(self: &Arc<Self>, endpoint: Option<&str>) -> bool {
        let outcome = {
            let mut inner = self.lock();
            if let Some(endpoint) = endpoint {
                inner.endpoint = endpoint.to_string();
            }
            if inner.state == ConnectionState::Connected {
                return true;
            }
            match &inner.pending {
                Some(pending) => pending.clone(),
                None => {
                    inner.state = ConnectionState::Connecting;
                    let this = Arc::clone(self);
                    let endpoint = inner.endpoint.clone();
                    let epoch = inner.epoch;
                    let attempt = tokio::spawn(this.establish(endpoint, epoch));
                    let outcome = async move { attempt.await.unwrap_or(false) }
                        .boxed()
                        .shared();
                    inner.pending = Some(outcome.clone());
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Close the connection and forget every subscription.
    ///
    /// Abandons any in-flight attempt, stops any reconnect loop, and resets
    /// the attempt counter. Affects every session sharing this manager.
    /// Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        let was_active =
            inner.state != ConnectionState::Disconnected || inner.reconnecting || inner.link.is_some();

        inner.epoch += 1;
        inner.cancel.cancel();
        inner.cancel = CancellationToken::new();
        inner.pending = None;
        inner.reconnect_attempts = 0;
        inner.reconnecting = false;
        inner.state = ConnectionState::Disconnected;

        self.registry.unsubscribe_all();
        self.registry.detach();
        if let Some(link) = inner.link.take() {
            let _ = link.send(LinkCommand::Disconnect);
        }

        if was_active {
            tracing::info!("Disconnected from message bus");
        }
    }

    // ---- private helpers ----

    /// One connect attempt: handshake under the timeout, then install the
    /// link if nobody disconnected in the meantime.
    async fn establish(self: Arc<Self>, endpoint: String, epoch: u64) -> bool {
        tracing::info!(endpoint = %endpoint, "Connecting to message bus");

        let result =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&endpoint))
                .await;

        let link = match result {
            Ok(Ok(link)) => Some(link),
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Message bus connection failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Message bus connection timed out",
                );
                None
            }
        };

        let mut inner = self.lock();
        if inner.epoch != epoch {
            // Disconnected while the attempt was in flight.
            if let Some(link) = link {
                let _ = link.commands.send(LinkCommand::Disconnect);
            }
            return false;
        }
        inner.pending = None;

        let Some(BusLink { commands, events }) = link else {
            inner.state = ConnectionState::Disconnected;
            return false;
        };

        inner.state = ConnectionState::Connected;
        inner.reconnect_attempts = 0;
        inner.link_seq += 1;
        let link_seq = inner.link_seq;
        inner.link = Some(commands.clone());
        let restored = self.registry.attach(commands);
        drop(inner);

        tracing::info!(endpoint = %endpoint, restored, "Connected to message bus");

        tokio::spawn(Arc::clone(&self).read_link(events, link_seq));
        true
    }

    /// Dispatch inbound messages until the link ends, then report the drop.
    async fn read_link(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>, link_seq: u64) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Message {
                    subscription,
                    destination,
                    body,
                } => {
                    if !self.registry.dispatch(&subscription, &body) {
                        tracing::debug!(
                            subscription = %subscription,
                            destination = %destination,
                            job_id = job_id_from_topic(&destination).unwrap_or("-"),
                            "Dropping message for inactive subscription",
                        );
                    }
                }
                LinkEvent::Error { message } => {
                    tracing::warn!(message = %message, "Message bus reported an error");
                }
            }
        }

        self.handle_link_lost(link_seq);
    }

    fn handle_link_lost(self: &Arc<Self>, link_seq: u64) {
        let mut inner = self.lock();
        if inner.link_seq != link_seq || inner.link.is_none() {
            // Explicit disconnect, or a newer link already replaced this one.
            return;
        }

        inner.link = None;
        inner.state = ConnectionState::Disconnected;
        inner.reconnecting = true;
        self.registry.detach();
        let cancel = inner.cancel.clone();
        let epoch = inner.epoch;
        drop(inner);

        tracing::warn!("Message bus connection lost, entering reconnect loop");
        tokio::spawn(Arc::clone(self).reconnect_loop(epoch, cancel));
    }

    /// End a successful reconnect loop. A link that already dropped again
    /// has started a newer loop, which keeps the flag.
    fn finish_reconnect(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch == epoch && inner.link.is_some() {
            inner.reconnecting = false;
        }
    }

    /// Retry with capped exponential backoff until connected, cancelled,
    /// or out of attempts.
    async fn reconnect_loop(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        let policy = &self.config.reconnect;

        loop {
            let attempt = {
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return;
                }
                if inner.state == ConnectionState::Connected {
                    inner.reconnecting = false;
                    return;
                }
                if inner.reconnect_attempts >= policy.max_attempts {
                    inner.reconnecting = false;
                    tracing::error!(
                        attempts = inner.reconnect_attempts,
                        "Max reconnection attempts reached, giving up",
                    );
                    return;
                }
                inner.reconnect_attempts += 1;
                inner.reconnect_attempts
            };

            let delay = policy.delay_for_attempt(attempt);
            tracing::info!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to message bus",
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.connect(None).await {
                tracing::info!(attempt, "Reconnected to message bus");
                self.finish_reconnect(epoch);
                return;
            }
            tracing::warn!(attempt, "Reconnect attempt {attempt} failed");
        }
    }
}
