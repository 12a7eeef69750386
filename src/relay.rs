//! Public request routing.
//!
//! Derives the tunnel id from the Host header, parks the request on the
//! tunnel's pending map, and pumps frames both ways: the request head and
//! body go to the edge, the response head and body come back correlated
//! by `request_id`. Response bytes are streamed to the client as they
//! arrive so large downloads never accumulate in relay memory.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::auth::url_token::{self, TokenError};
use crate::state::AppState;
use crate::tunnel::protocol::{Frame, MsgType, RequestMeta, ResponseMeta};
use crate::tunnel::Tunnel;

/// Response body chunks larger than this are split across frames.
const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Headers that apply to a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Routing and dispatch failures, mapped onto public status codes.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid subdomain")]
    InvalidSubdomain,
    #[error("Hospital not connected")]
    NotConnected,
    #[error("{0}")]
    Token(TokenError),
    #[error("Bad Gateway")]
    Upstream(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidSubdomain => StatusCode::BAD_REQUEST,
            Self::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            Self::Token(_) => StatusCode::FORBIDDEN,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

fn upstream(reason: impl Into<String>) -> RelayError {
    RelayError::Upstream(reason.into())
}

/// Catch-all handler for the public listener.
pub async fn handle_public(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    match route(state, req).await {
        Ok(resp) => resp,
        Err(e) => {
            if let RelayError::Upstream(reason) = &e {
                warn!(reason = %reason, "request failed upstream");
            }
            e.into_response()
        }
    }
}

async fn route(state: Arc<AppState>, mut req: Request<Body>) -> Result<Response, RelayError> {
    let host = client_host(&req).ok_or(RelayError::InvalidSubdomain)?;
    let code = host_to_tunnel_id(&host, &state.config.domain)?;
    let tunnel = state.registry.lookup(&code).ok_or(RelayError::NotConnected)?;

    // When this process terminates TLS the scheme is authoritative; when
    // fronted, the terminator's X-Forwarded-Proto passes through as-is.
    if state.config.tls_enabled {
        req.headers_mut().insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static("https"),
        );
    }

    // Paths declared as public downloads must carry a valid token bound
    // to the hospital secret; absence is not a pass-through.
    let path = req.uri().path().to_string();
    if path_is_protected(&state.config.download_token_paths, &path) {
        let secret = state
            .credentials
            .get(&code)
            .map(|c| c.secret().to_string())
            .ok_or(RelayError::NotConnected)?;
        let token =
            query_param(req.uri(), "token").ok_or(RelayError::Token(TokenError::Missing))?;
        url_token::validate(&token, &secret, &path, Utc::now().timestamp())
            .map_err(RelayError::Token)?;
    }

    let request_timeout = Duration::from_secs(state.config.request_timeout_secs);
    dispatch(tunnel, host, req, request_timeout).await
}

/// Host header of the public request, falling back to the URI authority
/// (HTTP/2 requests may carry no Host header).
fn client_host(req: &Request<Body>) -> Option<String> {
    if let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        return Some(host.to_string());
    }
    req.uri().authority().map(|a| a.as_str().to_string())
}

/// Lowercase the host, strip the port, strip the `.<domain>` suffix.
/// Whatever remains is the tunnel id; apex and foreign hosts are invalid.
pub fn host_to_tunnel_id(host: &str, domain: &str) -> Result<String, RelayError> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    match host.strip_suffix(&suffix) {
        Some(label) if !label.is_empty() => Ok(label.to_string()),
        _ => Err(RelayError::InvalidSubdomain),
    }
}

fn path_is_protected(prefixes: &[String], path: &str) -> bool {
    prefixes
        .iter()
        .any(|p| !p.is_empty() && path.starts_with(p.as_str()))
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Removes the pending entry and tells the edge to stop if the request
/// ends early (client disconnect, timeout, relay error).
struct PendingGuard {
    tunnel: Arc<Tunnel>,
    request_id: u32,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
        self.tunnel.finish_request(self.request_id);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.tunnel.cancel_request(self.request_id);
        }
    }
}

/// Correlate one public request with one tunneled exchange.
pub async fn dispatch(
    tunnel: Arc<Tunnel>,
    host: String,
    req: Request<Body>,
    request_timeout: Duration,
) -> Result<Response, RelayError> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // Forward headers verbatim minus hop-by-hop; the inner Host is the
    // client's Host so the edge sees the public name.
    let mut headers: Vec<(String, String)> = Vec::with_capacity(req.headers().len() + 1);
    headers.push(("host".to_string(), host));
    for (name, value) in req.headers() {
        if name == header::HOST || is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            headers.push((name.as_str().to_string(), v.to_string()));
        }
    }

    let (request_id, mut frames) = tunnel.open_request();
    let mut guard = PendingGuard {
        tunnel: Arc::clone(&tunnel),
        request_id,
        armed: true,
    };
    debug!(code = %tunnel.code, request_id, %method, "dispatching request");

    let meta = RequestMeta {
        method,
        path,
        headers,
    };
    let meta_json = serde_json::to_vec(&meta).map_err(|e| upstream(e.to_string()))?;
    tunnel
        .send_frame(Frame::new(request_id, MsgType::RequestHeaders, 0, meta_json))
        .await
        .map_err(|_| upstream("tunnel closed"))?;

    // Request body as chunk frames, terminated by an empty END_STREAM.
    let mut body_stream = req.into_body().into_data_stream();
    while let Some(chunk) = body_stream.next().await {
        let chunk = chunk.map_err(|e| upstream(format!("client body error: {e}")))?;
        let mut offset = 0;
        while offset < chunk.len() {
            let end = (offset + MAX_CHUNK_SIZE).min(chunk.len());
            tunnel
                .send_frame(Frame::new(
                    request_id,
                    MsgType::RequestBody,
                    0,
                    chunk.slice(offset..end),
                ))
                .await
                .map_err(|_| upstream("tunnel closed"))?;
            offset = end;
        }
    }
    tunnel
        .send_frame(Frame::end_of(request_id, MsgType::RequestBody))
        .await
        .map_err(|_| upstream("tunnel closed"))?;

    // First frame back is the response head.
    let head = match tokio::time::timeout(request_timeout, frames.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Err(upstream("tunnel closed before response")),
        Err(_) => return Err(upstream("timeout waiting for response head")),
    };
    let meta: ResponseMeta = match head.msg_type {
        MsgType::ResponseHeaders => serde_json::from_slice(&head.payload)
            .map_err(|e| upstream(format!("invalid response head: {e}")))?,
        MsgType::StreamError => {
            let reason = String::from_utf8_lossy(&head.payload).into_owned();
            return Err(upstream(format!("edge error: {reason}")));
        }
        other => return Err(upstream(format!("unexpected first frame: {other:?}"))),
    };

    let status =
        StatusCode::from_u16(meta.status).map_err(|_| upstream("invalid response status"))?;
    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        for (k, v) in &meta.headers {
            if is_hop_by_hop(k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(k.as_str()),
                HeaderValue::from_str(v),
            ) {
                response_headers.append(name, value);
            }
        }
    }

    // Stream the body progressively. The guard rides inside the stream so
    // a client disconnect (stream drop) cancels the pending entry and
    // signals the edge.
    let code = tunnel.code.clone();
    let body_stream = async_stream::stream! {
        loop {
            match tokio::time::timeout(request_timeout, frames.recv()).await {
                Ok(Some(frame)) => match frame.msg_type {
                    MsgType::ResponseBody => {
                        let done = frame.is_end_stream();
                        if !frame.payload.is_empty() {
                            yield Ok(frame.payload);
                        }
                        if done {
                            guard.disarm();
                            break;
                        }
                    }
                    MsgType::StreamEnd => {
                        guard.disarm();
                        break;
                    }
                    MsgType::StreamError => {
                        warn!(code = %code, request_id, "edge aborted response body");
                        yield Err(std::io::Error::other("edge aborted response"));
                        break;
                    }
                    _ => continue,
                },
                Ok(None) => {
                    yield Err(std::io::Error::other("tunnel closed mid-response"));
                    break;
                }
                Err(_) => {
                    warn!(code = %code, request_id, "timeout between response frames");
                    yield Err(std::io::Error::other("timeout between response frames"));
                    break;
                }
            }
        }
    };

    builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| upstream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::writer::Outbound;
    use tokio::sync::mpsc;

    #[test]
    fn host_derivation() {
        assert_eq!(
            host_to_tunnel_id("a.example.test", "example.test").unwrap(),
            "a"
        );
        assert_eq!(
            host_to_tunnel_id("A.Example.TEST:443", "example.test").unwrap(),
            "a"
        );
        // apex and foreign hosts are invalid
        assert!(matches!(
            host_to_tunnel_id("example.test", "example.test"),
            Err(RelayError::InvalidSubdomain)
        ));
        assert!(matches!(
            host_to_tunnel_id("foreign.com", "example.test"),
            Err(RelayError::InvalidSubdomain)
        ));
        assert!(matches!(
            host_to_tunnel_id(".example.test", "example.test"),
            Err(RelayError::InvalidSubdomain)
        ));
    }

    #[test]
    fn hop_by_hop_filter() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("set-cookie"));
    }

    #[test]
    fn query_param_extraction() {
        let uri: Uri = "https://a.example.test/public/x?foo=1&token=abc".parse().unwrap();
        assert_eq!(query_param(&uri, "token").unwrap(), "abc");
        assert_eq!(query_param(&uri, "missing"), None);
        let bare: Uri = "https://a.example.test/".parse().unwrap();
        assert_eq!(query_param(&bare, "token"), None);
    }

    fn test_tunnel() -> (Arc<Tunnel>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let tunnel = Arc::new(Tunnel::new(
            "a".into(),
            "a.example.test".into(),
            "127.0.0.1:7000".parse().unwrap(),
            tx,
        ));
        (tunnel, rx)
    }

    /// Fake edge: answers the first completed request with the given
    /// response head and body chunks.
    fn spawn_edge(
        tunnel: Arc<Tunnel>,
        mut out_rx: mpsc::Receiver<Outbound>,
        status: u16,
        resp_headers: Vec<(String, String)>,
        body_chunks: Vec<&'static [u8]>,
    ) {
        tokio::spawn(async move {
            let mut request_id = None;
            while let Some(out) = out_rx.recv().await {
                let Outbound::Frame(frame) = out else { continue };
                match frame.msg_type {
                    MsgType::RequestHeaders => request_id = Some(frame.request_id),
                    MsgType::RequestBody if frame.is_end_stream() => {
                        let id = request_id.expect("headers before body end");
                        let meta = ResponseMeta {
                            status,
                            headers: resp_headers.clone(),
                        };
                        tunnel
                            .dispatch(Frame::new(
                                id,
                                MsgType::ResponseHeaders,
                                0,
                                serde_json::to_vec(&meta).unwrap(),
                            ))
                            .await;
                        for chunk in &body_chunks {
                            tunnel
                                .dispatch(Frame::new(id, MsgType::ResponseBody, 0, *chunk))
                                .await;
                        }
                        tunnel.dispatch(Frame::end_of(id, MsgType::StreamEnd)).await;
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn round_trip_status_headers_body() {
        let (tunnel, out_rx) = test_tunnel();
        spawn_edge(
            Arc::clone(&tunnel),
            out_rx,
            200,
            vec![
                ("content-type".into(), "text/plain".into()),
                ("x-study".into(), "42".into()),
                ("set-cookie".into(), "a=1".into()),
                ("set-cookie".into(), "b=2".into()),
            ],
            vec![b"po", b"ng"],
        );

        let req = Request::builder()
            .method("GET")
            .uri("https://a.example.test/ping")
            .header("host", "a.example.test")
            .body(Body::empty())
            .unwrap();
        let resp = dispatch(tunnel, "a.example.test".into(), req, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(resp.headers()["x-study"], "42");
        // duplicate keys keep their values and order
        let cookies: Vec<_> = resp.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"pong");
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            RelayError::InvalidSubdomain.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::NotConnected.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::Token(TokenError::Missing).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            upstream("x").into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn request_body_is_forwarded_in_frames() {
        let (tunnel, mut out_rx) = test_tunnel();
        let t2 = Arc::clone(&tunnel);
        let collector = tokio::spawn(async move {
            let mut seen_body = Vec::new();
            let mut request_id = None;
            while let Some(out) = out_rx.recv().await {
                let Outbound::Frame(frame) = out else { continue };
                match frame.msg_type {
                    MsgType::RequestHeaders => request_id = Some(frame.request_id),
                    MsgType::RequestBody => {
                        seen_body.extend_from_slice(&frame.payload);
                        if frame.is_end_stream() {
                            let id = request_id.unwrap();
                            let meta = ResponseMeta { status: 204, headers: vec![] };
                            t2.dispatch(Frame::new(
                                id,
                                MsgType::ResponseHeaders,
                                0,
                                serde_json::to_vec(&meta).unwrap(),
                            ))
                            .await;
                            t2.dispatch(Frame::end_of(id, MsgType::StreamEnd)).await;
                            return seen_body;
                        }
                    }
                    _ => {}
                }
            }
            seen_body
        });

        let req = Request::builder()
            .method("POST")
            .uri("https://a.example.test/upload")
            .body(Body::from("dicom-bytes"))
            .unwrap();
        let resp = dispatch(tunnel, "a.example.test".into(), req, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(collector.await.unwrap(), b"dicom-bytes");
    }

    #[tokio::test]
    async fn head_timeout_maps_to_bad_gateway() {
        let (tunnel, _out_rx) = test_tunnel();
        let req = Request::builder()
            .uri("https://a.example.test/slow")
            .body(Body::empty())
            .unwrap();
        let err = dispatch(
            Arc::clone(&tunnel),
            "a.example.test".into(),
            req,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
        // the pending entry was torn down
        assert_eq!(tunnel.pending_len(), 0);
    }

    #[tokio::test]
    async fn edge_error_before_head_maps_to_bad_gateway() {
        let (tunnel, mut out_rx) = test_tunnel();
        let t2 = Arc::clone(&tunnel);
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                if let Outbound::Frame(frame) = out {
                    if frame.msg_type == MsgType::RequestBody && frame.is_end_stream() {
                        t2.dispatch(Frame::new(
                            frame.request_id,
                            MsgType::StreamError,
                            0,
                            &b"upstream refused"[..],
                        ))
                        .await;
                        break;
                    }
                }
            }
        });

        let req = Request::builder()
            .uri("https://a.example.test/bad")
            .body(Body::empty())
            .unwrap();
        let err = dispatch(tunnel, "a.example.test".into(), req, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
