//! STOMP-over-WebSocket connector.
//!
//! [`StompConnector`] opens the SockJS raw WebSocket transport of a
//! Spring-style `/ws-endpoint`, performs the STOMP `CONNECT` handshake,
//! and spawns the link task from [`processor`](crate::processor).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::BusError;
use crate::frame::{connect_frame, decode_frames, Command, HeartBeat};
use crate::processor::run_link;
use crate::transport::{BusConnector, BusLink};

/// Raw WebSocket stream type used by the link task.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Path suffix of the SockJS raw WebSocket transport.
const SOCKJS_WEBSOCKET_SUFFIX: &str = "/websocket";

/// Connects to a STOMP broker over WebSocket.
pub struct StompConnector {
    heart_beat: HeartBeat,
}

impl StompConnector {
    /// * `heart_beat` - intervals requested in the `CONNECT` frame.
    pub fn new(heart_beat: HeartBeat) -> Self {
        Self { heart_beat }
    }
}

/// Map a configured endpoint to the URL actually dialled.
///
/// `http(s)://` endpoints are SockJS base URLs and get the raw
/// WebSocket suffix with the scheme switched to `ws(s)://`. `ws(s)://`
/// URLs are used unchanged.
pub fn websocket_url(endpoint: &str) -> Result<String, BusError> {
    let trimmed = endpoint.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("http://") {
        Ok(format!("ws://{rest}{SOCKJS_WEBSOCKET_SUFFIX}"))
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        Ok(format!("wss://{rest}{SOCKJS_WEBSOCKET_SUFFIX}"))
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        Ok(trimmed.to_string())
    } else {
        Err(BusError::Connection(format!(
            "Unsupported endpoint scheme: {endpoint}"
        )))
    }
}

/// Value for the STOMP `host` header.
fn host_header(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}

#[async_trait]
impl BusConnector for StompConnector {
    async fn connect(&self, endpoint: &str) -> Result<BusLink, BusError> {
        let url = websocket_url(endpoint)?;

        let (mut ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect to {url}: {e}")))?;

        let connect = connect_frame(&host_header(&url), self.heart_beat).encode();
        ws_stream
            .send(Message::Text(connect))
            .await
            .map_err(|e| BusError::Connection(format!("Failed to send CONNECT: {e}")))?;

        let server_beat = await_connected(&mut ws_stream).await?;
        let agreed = HeartBeat::negotiate(self.heart_beat, server_beat);

        tracing::info!(
            url = %url,
            outgoing_ms = agreed.outgoing.as_millis() as u64,
            incoming_ms = agreed.incoming.as_millis() as u64,
            "STOMP session established",
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(ws_stream, command_rx, event_tx, agreed));

        Ok(BusLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

/// Read frames until the broker accepts (`CONNECTED`) or rejects
/// (`ERROR`) the handshake. Returns the broker's heart-beat header.
async fn await_connected(ws_stream: &mut WsStream) -> Result<HeartBeat, BusError> {
    while let Some(msg) = ws_stream.next().await {
        let msg = msg.map_err(|e| BusError::Connection(format!("Handshake failed: {e}")))?;
        match msg {
            Message::Text(text) => {
                for frame in decode_frames(&text)? {
                    match frame.command {
                        Command::Connected => {
                            return Ok(frame
                                .header("heart-beat")
                                .map(HeartBeat::parse)
                                .unwrap_or(HeartBeat::DISABLED));
                        }
                        Command::Error => {
                            let reason = frame
                                .header("message")
                                .map(str::to_string)
                                .unwrap_or_else(|| frame.body.clone());
                            return Err(BusError::Handshake(reason));
                        }
                        other => {
                            tracing::debug!(command = other.as_str(), "Ignoring frame before CONNECTED");
                        }
                    }
                }
            }
            Message::Close(frame) => {
                return Err(BusError::Connection(format!(
                    "Closed during handshake: {frame:?}"
                )));
            }
            _ => {}
        }
    }
    Err(BusError::Connection(
        "Stream ended during handshake".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_endpoint_maps_to_sockjs_websocket() {
        assert_eq!(
            websocket_url("http://localhost:8080/ws-endpoint").unwrap(),
            "ws://localhost:8080/ws-endpoint/websocket"
        );
        assert_eq!(
            websocket_url("https://example.com/ws-endpoint/").unwrap(),
            "wss://example.com/ws-endpoint/websocket"
        );
    }

    #[test]
    fn ws_endpoint_is_used_as_is() {
        assert_eq!(
            websocket_url("ws://localhost:8080/ws-endpoint/websocket").unwrap(),
            "ws://localhost:8080/ws-endpoint/websocket"
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            websocket_url("ftp://host/ws"),
            Err(BusError::Connection(_))
        ));
    }

    #[test]
    fn host_header_uses_uri_host() {
        assert_eq!(host_header("ws://example.com:8080/ws-endpoint/websocket"), "example.com");
        assert_eq!(host_header("not a url"), "localhost");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let connector = StompConnector::new(HeartBeat::DISABLED);
        let result = connector.connect("http://127.0.0.1:9/ws-endpoint").await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }
}
