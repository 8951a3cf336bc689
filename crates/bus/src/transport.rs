//! Transport seam between the [`ConnectionManager`](crate::ConnectionManager)
//! and a concrete broker connection.
//!
//! A connector performs the handshake and hands back a [`BusLink`]: a pair
//! of channels through which the manager issues subscription commands and
//! receives inbound messages. The link is considered dropped when the
//! event channel closes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;

/// Commands the manager sends down an established link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    /// Close the link cleanly. No drop is reported for this.
    Disconnect,
}

/// Events an established link delivers to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A `MESSAGE` frame for one of our subscriptions.
    Message {
        subscription: String,
        destination: String,
        body: String,
    },
    /// The broker sent an `ERROR` frame after the handshake.
    Error { message: String },
}

/// Channel pair for a live broker connection.
pub struct BusLink {
    pub commands: mpsc::UnboundedSender<LinkCommand>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to a message broker.
#[async_trait]
pub trait BusConnector: Send + Sync + 'static {
    /// Connect and complete the broker handshake.
    async fn connect(&self, endpoint: &str) -> Result<BusLink, BusError>;
}
