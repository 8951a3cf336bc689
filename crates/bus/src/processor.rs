//! Link task for an established STOMP WebSocket session.
//!
//! Forwards [`LinkCommand`]s from the manager as STOMP frames, turns
//! inbound `MESSAGE`/`ERROR` frames into [`LinkEvent`]s, sends
//! heart-beats, and ends the link when the socket closes or goes silent.
//! Dropping the event sender on exit is what signals the drop to the
//! manager.

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::client::WsStream;
use crate::frame::{
    decode_frames, disconnect_frame, subscribe_frame, unsubscribe_frame, Command, Frame, HeartBeat,
};
use crate::transport::{LinkCommand, LinkEvent};

/// Silence tolerated on the incoming side, as a multiple of the
/// negotiated interval.
const STALE_FACTOR: u32 = 3;

/// Placeholder tick for disabled directions; the branch is never polled.
const IDLE_TICK: Duration = Duration::from_secs(3600);

type WsSink = SplitSink<WsStream, Message>;

/// How a link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkExit {
    /// The manager asked for a disconnect (or dropped its command sender).
    Requested,
    /// The socket closed, errored, or stopped sending heart-beats.
    Dropped,
}

/// Drive one link until it ends.
pub async fn run_link(
    ws_stream: WsStream,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    heart_beat: HeartBeat,
) -> LinkExit {
    let (mut sink, mut stream) = ws_stream.split();

    let send_beats = !heart_beat.outgoing.is_zero();
    let mut beat_ticker = tokio::time::interval(if send_beats {
        heart_beat.outgoing
    } else {
        IDLE_TICK
    });
    let watch_incoming = !heart_beat.incoming.is_zero();
    let stale_after = heart_beat.incoming * STALE_FACTOR;
    let mut last_seen = Instant::now();

    let exit = loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(LinkCommand::Subscribe { id, destination }) => {
                        tracing::debug!(subscription = %id, destination = %destination, "SUBSCRIBE");
                        if send_frame(&mut sink, subscribe_frame(&id, &destination)).await.is_err() {
                            break LinkExit::Dropped;
                        }
                    }
                    Some(LinkCommand::Unsubscribe { id }) => {
                        tracing::debug!(subscription = %id, "UNSUBSCRIBE");
                        if send_frame(&mut sink, unsubscribe_frame(&id)).await.is_err() {
                            break LinkExit::Dropped;
                        }
                    }
                    Some(LinkCommand::Disconnect) | None => {
                        let _ = send_frame(&mut sink, disconnect_frame()).await;
                        let _ = sink.close().await;
                        break LinkExit::Requested;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        handle_text(&text, &events);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                        tracing::trace!("Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Message bus closed WebSocket");
                        break LinkExit::Dropped;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket receive error");
                        break LinkExit::Dropped;
                    }
                    None => {
                        tracing::info!("WebSocket stream exhausted");
                        break LinkExit::Dropped;
                    }
                }
            }
            _ = beat_ticker.tick(), if send_beats => {
                if sink.send(Message::Text("\n".to_string())).await.is_err() {
                    break LinkExit::Dropped;
                }
            }
            _ = tokio::time::sleep_until(last_seen + stale_after), if watch_incoming => {
                tracing::warn!(
                    silent_ms = stale_after.as_millis() as u64,
                    "No traffic from message bus, dropping link",
                );
                break LinkExit::Dropped;
            }
        }
    };

    tracing::debug!(?exit, "Link task exited");
    exit
}

async fn send_frame(
    sink: &mut WsSink,
    frame: Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    sink.send(Message::Text(frame.encode())).await
}

/// Decode one text message and forward its frames.
fn handle_text(text: &str, events: &mpsc::UnboundedSender<LinkEvent>) {
    let frames = match decode_frames(text) {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to decode STOMP frame");
            return;
        }
    };

    for frame in frames {
        if let Some(event) = frame_to_event(frame) {
            let _ = events.send(event);
        }
    }
}

/// Translate an inbound frame into a link event, if it carries one.
pub fn frame_to_event(frame: Frame) -> Option<LinkEvent> {
    match frame.command {
        Command::Message => {
            let Some(subscription) = frame.header("subscription").map(str::to_string) else {
                tracing::warn!("MESSAGE frame without subscription header");
                return None;
            };
            let destination = frame.header("destination").unwrap_or_default().to_string();
            Some(LinkEvent::Message {
                subscription,
                destination,
                body: frame.body,
            })
        }
        Command::Error => {
            let message = frame
                .header("message")
                .map(str::to_string)
                .unwrap_or_else(|| frame.body.clone());
            Some(LinkEvent::Error { message })
        }
        Command::Receipt => {
            tracing::trace!(receipt = ?frame.header("receipt-id"), "RECEIPT");
            None
        }
        other => {
            tracing::debug!(command = other.as_str(), "Ignoring unexpected frame");
            None
        }
    }
}
