//! Server side of one edge connection.
//!
//! Lifecycle: Awaiting-Register, Active, Closing. The session runs exactly
//! one reader on the socket; control and data frames share it. Writes are
//! serialized by the writer task. The registry entry lives exactly as long
//! as the Active state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::auth::AuthError;
use crate::state::AppState;

use super::protocol::{self, ControlMsg, Frame, MsgType};
use super::writer::{self, Outbound};
use super::Tunnel;

/// How long the edge has to send REGISTER after the upgrade.
const REGISTER_DEADLINE: Duration = Duration::from_secs(10);
/// Per-message write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long teardown waits for the writer task to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the Active state ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    Idle,
    TransportError,
    Shutdown,
}

/// Run one edge session to completion.
pub async fn run(state: Arc<AppState>, mut socket: WebSocket, remote_addr: SocketAddr) {
    // Awaiting-Register: the first message must be a valid REGISTER within
    // the deadline, or the socket is closed without a tunnel.
    let first = match tokio::time::timeout(REGISTER_DEADLINE, socket.recv()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => {
            debug!(peer = %remote_addr, error = %e, "socket error before registration");
            return;
        }
        Ok(None) => {
            debug!(peer = %remote_addr, "socket closed before registration");
            return;
        }
        Err(_) => {
            debug!(peer = %remote_addr, "registration deadline expired");
            return;
        }
    };

    let register = match &first {
        Message::Text(line) => protocol::parse_control(line.as_str()),
        _ => Err(protocol::ProtocolError::MalformedControl),
    };
    let (code, subdomain, token) = match register {
        Ok(ControlMsg::Register {
            code,
            subdomain,
            token,
        }) => (code, subdomain, token),
        _ => {
            warn!(peer = %remote_addr, "first message was not a valid REGISTER");
            reject(&mut socket, AuthError::MalformedRegister).await;
            return;
        }
    };

    let cred = match check_registration(&state, remote_addr.ip(), &code, &subdomain, &token) {
        Ok(cred) => cred,
        Err(e) => {
            warn!(peer = %remote_addr, code = %code, reason = %e, "registration rejected");
            reject(&mut socket, e).await;
            return;
        }
    };

    if state.registry.len() >= state.config.max_concurrent_conn {
        warn!(
            peer = %remote_addr,
            code = %code,
            limit = state.config.max_concurrent_conn,
            "registration rejected: at capacity"
        );
        reject(&mut socket, AuthError::AtCapacity).await;
        return;
    }

    // Active: split the socket, start the writer, claim the code.
    let (sink, mut stream) = socket.split();
    let (outbound, writer_handle) = writer::spawn_writer(sink, WRITE_TIMEOUT);
    let tunnel = Arc::new(Tunnel::new(
        cred.code.clone(),
        cred.subdomain.clone(),
        remote_addr,
        outbound.clone(),
    ));

    if state.registry.register(Arc::clone(&tunnel)).is_err() {
        warn!(peer = %remote_addr, code = %tunnel.code, "registration rejected: already registered");
        let _ = outbound
            .send(Outbound::Text(protocol::reply_error(
                AuthError::AlreadyRegistered,
            )))
            .await;
        let _ = outbound
            .send(Outbound::Close("registration rejected".into()))
            .await;
        drop(outbound);
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle).await;
        return;
    }

    if outbound
        .send(Outbound::Text(protocol::REPLY_OK.to_string()))
        .await
        .is_err()
    {
        state.registry.unregister(&tunnel);
        return;
    }
    info!(
        code = %tunnel.code,
        subdomain = %tunnel.subdomain,
        peer = %remote_addr,
        "hospital registered"
    );

    let mut shutdown = state.shutdown.clone();
    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs);
    let end = read_loop(&tunnel, &mut stream, idle_timeout, &mut shutdown).await;

    // Closing: release the code, fail in-flight requests, drain the writer.
    state.registry.unregister(&tunnel);
    tunnel.fail_all_pending();

    let reason = match end {
        SessionEnd::Shutdown => "relay shutting down",
        SessionEnd::Idle => "idle timeout",
        SessionEnd::PeerClosed => "peer closed",
        SessionEnd::TransportError => "transport error",
    };
    let _ = outbound.send(Outbound::Close(reason.to_string())).await;
    drop(outbound);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle)
        .await
        .is_err()
    {
        debug!(code = %tunnel.code, "writer drain timeout");
    }

    info!(code = %tunnel.code, end = ?end, "session closed");
}

/// Check one REGISTER attempt against the rate limiter and credential
/// store. Blocked addresses fail before the credential store is consulted;
/// a successful auth clears the address's failure record.
fn check_registration<'a>(
    state: &'a AppState,
    ip: std::net::IpAddr,
    code: &str,
    subdomain: &str,
    token: &str,
) -> Result<&'a crate::auth::credentials::HospitalCredential, AuthError> {
    if state.rate_limiter.is_blocked(ip) {
        return Err(AuthError::RateLimited);
    }
    match state.credentials.verify(code, subdomain, token) {
        Ok(cred) => {
            state.rate_limiter.clear(ip);
            Ok(cred)
        }
        Err(e) => {
            state.rate_limiter.record_failure(ip);
            Err(e)
        }
    }
}

/// Reject a registration attempt on the not-yet-split socket.
async fn reject(socket: &mut WebSocket, err: AuthError) {
    let line = protocol::reply_error(err);
    let _ = tokio::time::timeout(WRITE_TIMEOUT, socket.send(Message::Text(line.into()))).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "registration rejected".into(),
        })))
        .await;
}

/// The single reader for an Active session.
///
/// Demultiplexes response frames into pending requests by `request_id`,
/// records heartbeats, and watches for idle cutoff and shutdown. Dispatch
/// blocks when a pending channel is full; that backpressure is what
/// throttles the edge on slow public readers.
pub(crate) async fn read_loop<S, E>(
    tunnel: &Arc<Tunnel>,
    stream: &mut S,
    idle_timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut last_data = tokio::time::Instant::now();
    loop {
        let msg_result = tokio::select! {
            msg = stream.next() => match msg {
                Some(r) => r,
                None => return SessionEnd::PeerClosed,
            },
            _ = tokio::time::sleep_until(last_data + idle_timeout) => {
                warn!(
                    code = %tunnel.code,
                    idle_secs = idle_timeout.as_secs(),
                    "session idle, closing"
                );
                return SessionEnd::Idle;
            }
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        };

        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!(code = %tunnel.code, error = %e, "socket read error");
                return SessionEnd::TransportError;
            }
        };

        // Any received message proves the connection is alive.
        last_data = tokio::time::Instant::now();
        tunnel.touch();

        match msg {
            Message::Binary(data) => match Frame::decode(data) {
                Ok(frame) => match frame.msg_type {
                    MsgType::ResponseHeaders
                    | MsgType::ResponseBody
                    | MsgType::StreamEnd
                    | MsgType::StreamError => tunnel.dispatch(frame).await,
                    other => {
                        debug!(code = %tunnel.code, msg_type = ?other, "ignoring unexpected frame type");
                    }
                },
                Err(e) => warn!(code = %tunnel.code, error = %e, "failed to decode frame"),
            },
            Message::Text(line) => match protocol::parse_control(line.as_str()) {
                Ok(ControlMsg::Heartbeat) => trace!(code = %tunnel.code, "heartbeat"),
                Ok(ControlMsg::Status(report)) => {
                    debug!(code = %tunnel.code, status = %report, "edge status report");
                }
                Ok(ControlMsg::Register { .. }) => {
                    warn!(code = %tunnel.code, "duplicate REGISTER ignored");
                }
                Err(_) => warn!(code = %tunnel.code, "unparseable control message"),
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                info!(code = %tunnel.code, "received close from edge");
                return SessionEnd::PeerClosed;
            }
        }
    }
}
