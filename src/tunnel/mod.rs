//! Edge tunnel: wire protocol, per-connection session, and the shared
//! tunnel endpoint handed to the request router.

pub mod protocol;
pub mod session;
pub mod writer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use self::protocol::{Frame, MsgType};
use self::writer::Outbound;

/// Capacity of the per-request frame channel.
///
/// Bounds relay memory per in-flight request to capacity x frame size; a
/// slow public reader backpressures the session reader through this
/// channel rather than buffering the response.
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

/// The tunnel endpoint writes went away (session closed).
#[derive(Debug, thiserror::Error)]
#[error("tunnel closed")]
pub struct TunnelClosed;

/// One live edge connection, owned by the registry, driven by its session.
///
/// The session reader is the only writer of `last_seen` and the only
/// dispatcher of inbound frames; the request router inserts and removes
/// pending entries. Writes to the edge are serialized by the session's
/// writer task behind the `outbound` channel.
pub struct Tunnel {
    pub code: String,
    pub subdomain: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    last_seen: AtomicI64,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, mpsc::Sender<Frame>>>,
    outbound: mpsc::Sender<Outbound>,
}

impl Tunnel {
    pub fn new(
        code: String,
        subdomain: String,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let now = Utc::now();
        Self {
            code,
            subdomain,
            remote_addr,
            connected_at: now,
            last_seen: AtomicI64::new(now.timestamp()),
            next_request_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    /// Advance the liveness timestamp. Never moves backwards.
    pub fn touch(&self) {
        self.last_seen
            .fetch_max(Utc::now().timestamp(), Ordering::AcqRel);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        let secs = self.last_seen.load(Ordering::Acquire);
        DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
    }

    /// Allocate a request id unique within this session. Id 0 is reserved,
    /// so the counter skips it when it wraps.
    fn alloc_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Open a pending request slot: allocates the id and the bounded frame
    /// channel the session reader will deliver response frames into.
    pub fn open_request(&self) -> (u32, mpsc::Receiver<Frame>) {
        let id = self.alloc_request_id();
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Remove a pending entry. Returns false if it was already gone.
    pub fn finish_request(&self, request_id: u32) -> bool {
        self.pending.lock().remove(&request_id).is_some()
    }

    /// Cancel an in-flight request: drop the pending entry and tell the
    /// edge to stop producing frames for it.
    pub fn cancel_request(&self, request_id: u32) {
        if self.finish_request(request_id) {
            let _ = self.outbound.try_send(Outbound::Frame(Frame::new(
                request_id,
                MsgType::StreamError,
                0,
                &b"cancelled"[..],
            )));
        }
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Route an inbound frame to its pending request.
    ///
    /// Blocks when the frame channel is full (slow public client); the
    /// session reader inherits that backpressure by design. The lock is
    /// released before the send so the router can make progress.
    pub async fn dispatch(&self, frame: Frame) {
        let request_id = frame.request_id;
        let terminal = frame.is_end_stream()
            || matches!(frame.msg_type, MsgType::StreamEnd | MsgType::StreamError);

        let tx = self.pending.lock().get(&request_id).cloned();
        let Some(tx) = tx else {
            debug!(
                code = %self.code,
                request_id,
                msg_type = ?frame.msg_type,
                "frame for unknown request, dropping"
            );
            return;
        };
        let _ = tx.send(frame).await;
        if terminal {
            self.pending.lock().remove(&request_id);
        }
    }

    /// Queue a frame for the edge. Fails once the session writer is gone.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TunnelClosed> {
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| TunnelClosed)
    }

    /// Ask the session writer to close the socket with a goodbye reason.
    pub fn begin_close(&self, reason: &str) {
        let _ = self.outbound.try_send(Outbound::Close(reason.to_string()));
    }

    /// Drop all pending entries, failing their routers' frame channels.
    pub fn fail_all_pending(&self) {
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(code = %self.code, dropped, "failed in-flight requests on session close");
        }
    }
}
