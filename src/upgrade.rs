//! WebSocket / HTTP upgrade forwarding
//!
//! The upgrade request is replayed to the backend over a fresh TCP
//! connection as raw HTTP/1.1. On `101` the client connection is upgraded by
//! hyper and bytes are copied both ways until either side closes. Both
//! sockets are held in the [`SocketRegistry`] for the life of the session.

use crate::error::{empty_body, full_body, json_error_response, ProxyBody, ProxyErrorCode};
use crate::sockets::{SocketRegistry, SocketRole};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Upper bound on the backend's response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;
/// Larger refusal bodies are dropped
const MAX_REFUSAL_BODY: usize = 64 * 1024;

/// Whether the request asks to switch protocols
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

fn upgrade_type<B>(req: &Request<B>) -> String {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Response for an upgrade nobody routes; the connection is closed after it
pub fn unmatched_response() -> Response<ProxyBody> {
    let mut response = json_error_response(ProxyErrorCode::NotFound, "No backend for this upgrade path");
    response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Raw HTTP/1.1 request line and headers sent to the backend
pub fn build_upgrade_request<B>(req: &Request<B>, port: u16, path_and_query: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parsed backend response head
#[derive(Debug, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
}

/// Parse a response head (everything before the blank line)
pub fn parse_response_head(data: &[u8]) -> Option<ResponseHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some(ResponseHead { status, headers })
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header(CONTENT_LENGTH.as_str())?.parse().ok()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Read until the end of the response head; returns (head, bytes after it)
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Why an upgrade could not be handed to the backend
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Connect, write or read failed before the backend answered
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("backend did not answer the upgrade within {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("invalid upgrade response from backend: {0}")]
    InvalidResponse(&'static str),
}

/// Where an upgrade goes
#[derive(Debug, Clone, Copy)]
pub struct UpgradeTarget<'a> {
    pub backend: &'a str,
    pub port: u16,
    pub path_and_query: &'a str,
}

enum Answer {
    Switched {
        stream: TcpStream,
        head: ResponseHead,
        leftover: Vec<u8>,
    },
    Refused {
        head: ResponseHead,
        body: Vec<u8>,
    },
}

async fn handshake(port: u16, raw_request: &[u8]) -> Result<Answer, HandshakeError> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(HandshakeError::Unreachable)?;
    stream
        .write_all(raw_request)
        .await
        .map_err(HandshakeError::Unreachable)?;

    let (head, leftover) = read_response_head(&mut stream).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            HandshakeError::InvalidResponse("response head too large")
        } else {
            HandshakeError::Unreachable(e)
        }
    })?;
    let head = parse_response_head(&head).ok_or(HandshakeError::InvalidResponse("unparseable response head"))?;

    if head.status == StatusCode::SWITCHING_PROTOCOLS {
        return Ok(Answer::Switched { stream, head, leftover });
    }

    let body = read_refusal_body(&mut stream, &head, leftover)
        .await
        .map_err(|_| HandshakeError::InvalidResponse("truncated refusal body"))?;
    Ok(Answer::Refused { head, body })
}

/// Complete the body of a non-101 answer, starting from the bytes already read.
///
/// Chunked and oversized bodies are dropped rather than relayed in part.
async fn read_refusal_body(stream: &mut TcpStream, head: &ResponseHead, mut body: Vec<u8>) -> std::io::Result<Vec<u8>> {
    let status = head.status;
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(Vec::new());
    }
    if head.header(TRANSFER_ENCODING.as_str()).is_some() {
        return Ok(Vec::new());
    }

    match head.content_length() {
        Some(len) if len > MAX_REFUSAL_BODY => Ok(Vec::new()),
        Some(len) => {
            if body.len() < len {
                let start = body.len();
                body.resize(len, 0);
                stream.read_exact(&mut body[start..]).await?;
            }
            body.truncate(len);
            Ok(body)
        }
        None => {
            // Close-delimited
            let limit = MAX_REFUSAL_BODY.saturating_sub(body.len()) as u64;
            (&mut *stream).take(limit).read_to_end(&mut body).await?;
            Ok(body)
        }
    }
}

/// Forward an upgrade request to a ready backend.
///
/// The connect, request write and response head read share `timeout`. Once
/// the backend answers `101`, the session runs on its own task.
pub async fn forward_upgrade(
    req: Request<Incoming>,
    target: UpgradeTarget<'_>,
    client_addr: SocketAddr,
    sockets: Arc<SocketRegistry>,
    request_id: &str,
    timeout: Duration,
) -> Result<Response<ProxyBody>, HandshakeError> {
    let UpgradeTarget {
        backend,
        port,
        path_and_query,
    } = target;
    let upgrade_type = upgrade_type(&req);
    debug!(backend, request_id, upgrade_type, path = path_and_query, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port, path_and_query);

    let answer = match tokio::time::timeout(timeout, handshake(port, &raw_request)).await {
        Ok(answer) => answer?,
        Err(_) => return Err(HandshakeError::TimedOut(timeout)),
    };

    let (backend_stream, parsed, leftover) = match answer {
        Answer::Switched { stream, head, leftover } => (stream, head, leftover),
        Answer::Refused { head, body } => {
            debug!(backend, status = %head.status, "Backend declined upgrade");
            return Ok(relay_refusal(head, body));
        }
    };

    info!(backend, request_id, upgrade_type, "Upgrade accepted by backend");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
            || name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str())
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(empty_body())
        .map_err(|_| HandshakeError::InvalidResponse("upgrade headers are not valid HTTP"))?;

    let backend_name = backend.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        let client_lease = sockets.lease(SocketRole::Client, &backend_name, Some(client_addr));
        let backend_lease = sockets.lease(SocketRole::Backend, &backend_name, backend_stream.peer_addr().ok());

        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, leftover, &backend_name, &request_id).await;
            }
            Err(e) => {
                debug!(backend = %backend_name, request_id, error = %e, "Client upgrade did not complete");
            }
        }

        client_lease.release();
        backend_lease.release();
        debug!(
            backend = %backend_name,
            request_id,
            open_sockets = sockets.len(),
            "Upgraded session closed"
        );
    });

    Ok(response)
}

/// Relay the backend's non-101 answer
fn relay_refusal(head: ResponseHead, body: Vec<u8>) -> Response<ProxyBody> {
    let mut response = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str())
            || name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
            || name.eq_ignore_ascii_case(CONNECTION.as_str())
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    response
        .body(full_body(body))
        .unwrap_or_else(|_| json_error_response(ProxyErrorCode::ConnectionFailed, "Backend declined upgrade"))
}

async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    backend_name: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    // Frames the backend sent together with its 101 go first
    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(backend = backend_name, request_id, error = %e, "Client went away before first frame");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                backend = backend_name,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(backend = backend_name, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
