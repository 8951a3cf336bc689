//! In-memory broker for tests and local development.
//!
//! [`MemoryBus`] implements [`BusConnector`] without any networking.
//! Tests publish bodies onto topics, drop the live link to simulate a
//! transport failure, and flip acceptance or latency to exercise the
//! manager's connect and reconnect paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::transport::{BusConnector, BusLink, LinkCommand, LinkEvent};

struct MemoryLink {
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    /// Subscription id -> destination.
    subscriptions: HashMap<String, String>,
}

struct MemoryBusState {
    accepting: bool,
    connect_delay: Option<Duration>,
    endpoints: Vec<String>,
    link: Option<MemoryLink>,
}

impl MemoryBusState {
    /// Apply every command the client has queued so far.
    fn sync(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let mut closed = false;
        while let Ok(command) = link.commands.try_recv() {
            match command {
                LinkCommand::Subscribe { id, destination } => {
                    link.subscriptions.insert(id, destination);
                }
                LinkCommand::Unsubscribe { id } => {
                    link.subscriptions.remove(&id);
                }
                LinkCommand::Disconnect => {
                    closed = true;
                    break;
                }
            }
        }
        if closed || link.events.is_closed() {
            self.link = None;
        }
    }
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryBusState {
                accepting: true,
                connect_delay: None,
                endpoints: Vec::new(),
                link: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept (`true`) or reject with a handshake error (`false`).
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Delay every handshake by this much.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// Number of handshakes attempted so far.
    pub fn connect_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Endpoints of every handshake attempted so far, in order.
    pub fn endpoints(&self) -> Vec<String> {
        self.lock().endpoints.clone()
    }

    pub fn has_link(&self) -> bool {
        let mut state = self.lock();
        state.sync();
        state.link.is_some()
    }

    /// Destinations the client is currently subscribed to, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut state = self.lock();
        state.sync();
        let mut topics: Vec<String> = state
            .link
            .as_ref()
            .map(|l| l.subscriptions.values().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Publish a body on a destination. Returns how many subscriptions
    /// received it.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let mut state = self.lock();
        state.sync();
        let Some(link) = state.link.as_ref() else {
            return 0;
        };
        let mut delivered = 0;
        for (id, subscribed) in &link.subscriptions {
            if subscribed == destination {
                let sent = link.events.send(LinkEvent::Message {
                    subscription: id.clone(),
                    destination: destination.to_string(),
                    body: body.to_string(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver a body under a subscription id regardless of whether the
    /// broker still considers it active, as a late or duplicate publish
    /// already in flight would arrive.
    pub fn deliver_raw(&self, subscription: &str, destination: &str, body: &str) -> bool {
        let state = self.lock();
        let Some(link) = state.link.as_ref() else {
            return false;
        };
        link.events
            .send(LinkEvent::Message {
                subscription: subscription.to_string(),
                destination: destination.to_string(),
                body: body.to_string(),
            })
            .is_ok()
    }

    /// Send an `ERROR` frame event on the live link.
    pub fn send_error(&self, message: &str) -> bool {
        let state = self.lock();
        let Some(link) = state.link.as_ref() else {
            return false;
        };
        link.events
            .send(LinkEvent::Error {
                message: message.to_string(),
            })
            .is_ok()
    }

    /// Drop the live link as a transport failure would.
    pub fn drop_link(&self) -> bool {
        self.lock().link.take().is_some()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self, endpoint: &str) -> Result<BusLink, BusError> {
        let delay = {
            let mut state = self.lock();
            state.endpoints.push(endpoint.to_string());
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if !state.accepting {
            return Err(BusError::Handshake("Connection refused by broker".into()));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        state.link = Some(MemoryLink {
            commands: command_rx,
            events: event_tx,
            subscriptions: HashMap::new(),
        });

        Ok(BusLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}
