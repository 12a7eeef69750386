//! Dedicated WebSocket writer task.
//!
//! All writes to the edge go through an mpsc channel to a single writer
//! task, so frame emission is serialized and the write deadline applies
//! per message rather than per connection.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::protocol::Frame;

/// Sender half, held by [`super::Tunnel`] and cloned into the session.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Messages the writer task emits onto the socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Text(String),
    /// Close the socket with a goodbye reason and stop writing.
    Close(String),
}

/// Spawn the writer task. Returns the sender and a JoinHandle for cleanup.
pub fn spawn_writer<S>(mut sink: S, write_timeout: Duration) -> (OutboundSender, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);

    let handle = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Frame(frame) => Message::Binary(frame.encode()),
                Outbound::Text(line) => Message::Text(line.into()),
                Outbound::Close(reason) => {
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.into(),
                    }));
                    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, sink.send(close)).await
                    {
                        debug!(error = %e, "failed to send close frame");
                    }
                    break;
                }
            };
            match tokio::time::timeout(write_timeout, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "failed to write to WebSocket");
                    break;
                }
                Err(_) => {
                    error!(
                        timeout_secs = write_timeout.as_secs(),
                        "write deadline exceeded"
                    );
                    break;
                }
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
