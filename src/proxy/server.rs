//! Inbound HTTP/1.1 framing
//!
//! Reads complete requests (body fully buffered) off a client stream, runs
//! each through the pipeline and writes the response back, honouring
//! keep-alive.

use crate::proxy::pipeline;
use crate::proxy::state::ProxyState;
use crate::proxy::upstream::lowercase_header_map;
use anyhow::anyhow;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024; // 32MB hard cap on inbound bodies

/// Keep-alive idle timeout in seconds
const KEEP_ALIVE_TIMEOUT_SECS: u64 = 30;

/// Headers describing the framing of a message; always recomputed on write.
const FRAMING_HEADERS: [&str; 4] = ["content-length", "transfer-encoding", "connection", "keep-alive"];

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct RequestBodyTooLarge {
    limit: usize,
}

impl RequestBodyTooLarge {
    fn new(limit: usize) -> Self {
        Self { limit }
    }
}

/// Request framing that cannot be trusted; the connection answers 400.
#[derive(Debug, Error)]
#[error("malformed request framing: {0}")]
pub struct MalformedRequest(String);

/// A fully buffered inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    /// Request target as received (path and query)
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl InboundRequest {
    /// Header map with lowercase names.
    pub fn header_map(&self) -> HashMap<String, String> {
        lowercase_header_map(&self.headers)
    }
}

/// Response handed back to the client.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl OutboundResponse {
    pub fn text(status: u16, content_type: &str, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: Bytes::from(body.into()),
        }
    }
}

/// Determine if connection should be kept alive based on HTTP version and headers
fn should_keep_alive(version: &str, headers: &HashMap<String, String>) -> bool {
    match headers.get("connection").map(String::as_str) {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => version.contains("1.1"), // HTTP/1.1 defaults to keep-alive
    }
}

/// Serve every request arriving on one client connection.
pub(crate) async fn handle_connection<S>(mut stream: S, state: Arc<ProxyState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request_number: u32 = 0;
    // Bytes read past the end of the previous request (pipelining)
    let mut carry = Vec::new();

    loop {
        request_number += 1;

        let request = match tokio::time::timeout(
            tokio::time::Duration::from_secs(KEEP_ALIVE_TIMEOUT_SECS),
            read_http_request(&mut stream, &mut carry),
        )
        .await
        {
            Ok(Ok(req)) => req,
            Ok(Err(err)) => {
                if err.downcast_ref::<RequestBodyTooLarge>().is_some() {
                    tracing::warn!("Rejecting request: {err}");
                    let _ = respond_with_status(&mut stream, 413, "Payload Too Large", &err.to_string())
                        .await;
                } else if err.downcast_ref::<MalformedRequest>().is_some() {
                    tracing::warn!("Rejecting request: {err}");
                    let _ = respond_with_status(&mut stream, 400, "Bad Request", &err.to_string())
                        .await;
                } else if request_number == 1 {
                    // Later failures are the client closing an idle keep-alive connection
                    tracing::warn!("Failed to parse request: {err}");
                    let _ = respond_with_status(
                        &mut stream,
                        400,
                        "Bad Request",
                        "Unable to parse HTTP request",
                    )
                    .await;
                }
                break;
            }
            Err(_) => {
                tracing::debug!("Keep-alive timeout after {} requests", request_number - 1);
                break;
            }
        };

        let keep_alive = should_keep_alive(&request.version, &request.header_map());
        let response = pipeline::handle_request(&state, request).await;
        write_response(&mut stream, &response, keep_alive).await?;

        if !keep_alive {
            break;
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

pub(crate) async fn read_http_request<S>(
    stream: &mut S,
    carry: &mut Vec<u8>,
) -> anyhow::Result<InboundRequest>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, buffered_body) = read_message_head(stream, std::mem::take(carry)).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(&raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP request"));
    }

    let method = req.method.unwrap_or("GET").to_string();
    let path = req.path.unwrap_or("/").to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers = headers_from_httparse(req.headers);
    let header_map = lowercase_header_map(&headers);

    let is_chunked = header_map
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length = match header_map.get("content-length") {
        Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
            MalformedRequest(format!("invalid Content-Length: {}", value.trim()))
        })?),
        None => None,
    };

    let body = if is_chunked {
        let (body, rest) = decode_chunked_body(buffered_body, stream, MAX_REQUEST_BODY_BYTES).await?;
        *carry = rest;
        body
    } else if let Some(len) = content_length {
        if len > MAX_REQUEST_BODY_BYTES {
            return Err(RequestBodyTooLarge::new(MAX_REQUEST_BODY_BYTES).into());
        }
        let (body, rest) = read_fixed_body(buffered_body, stream, len).await?;
        *carry = rest;
        body
    } else {
        *carry = buffered_body;
        Vec::new()
    };

    Ok(InboundRequest {
        method,
        path,
        version,
        headers,
        body: Bytes::from(body),
    })
}

async fn read_message_head<S>(
    stream: &mut S,
    mut buffer: Vec<u8>,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];

    loop {
        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }

        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("HTTP headers exceed allowed size"));
        }

        let bytes_read = stream.read(&mut temp).await?;
        if bytes_read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..bytes_read]);
    }

    Err(anyhow!("connection closed before headers completed"))
}

/// Returns the body plus any bytes read beyond it.
async fn read_fixed_body<S>(
    mut prefix: Vec<u8>,
    stream: &mut S,
    expected_len: usize,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    if prefix.len() >= expected_len {
        let rest = prefix.split_off(expected_len);
        return Ok((prefix, rest));
    }
    let mut body = prefix;
    body.reserve(expected_len - body.len());

    let mut chunk = [0u8; 8192];
    while body.len() < expected_len {
        let want = (expected_len - body.len()).min(chunk.len());
        let read = stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(anyhow!("connection closed while reading request body"));
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok((body, Vec::new()))
}

async fn decode_chunked_body<R>(
    initial_buffer: Vec<u8>,
    stream: &mut R,
    limit: usize,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buffer: VecDeque<u8> = initial_buffer.into();
    let mut body = Vec::new();

    loop {
        let line = read_crlf_line(&mut buffer, stream).await?;
        if line.len() < 2 {
            return Err(anyhow!("invalid chunked encoding: missing CRLF"));
        }

        let size_token = std::str::from_utf8(&line[..line.len() - 2])
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let chunk_size = usize::from_str_radix(size_token, 16)
            .map_err(|_| anyhow!("invalid chunk size: {size_token}"))?;

        if chunk_size == 0 {
            // Trailers end with blank line
            loop {
                let trailer_line = read_crlf_line(&mut buffer, stream).await?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            break;
        }

        if chunk_size > limit.saturating_sub(body.len()) {
            return Err(RequestBodyTooLarge::new(limit).into());
        }
        let chunk_data = read_exact_from_buffer(&mut buffer, stream, chunk_size).await?;
        body.extend_from_slice(&chunk_data);

        let crlf = read_exact_from_buffer(&mut buffer, stream, 2).await?;
        if crlf != b"\r\n" {
            return Err(anyhow!("invalid chunk terminator"));
        }
    }

    Ok((body, buffer.into()))
}

async fn read_crlf_line<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf_in_deque(buffer) {
            return Ok(buffer.drain(..pos + 2).collect());
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("chunk header line too long"));
        }
        fill_buffer(buffer, stream).await?;
    }
}

async fn read_exact_from_buffer<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    len: usize,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < len {
        fill_buffer(buffer, stream).await?;
    }
    Ok(buffer.drain(..len).collect())
}

async fn fill_buffer<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];
    let read = stream.read(&mut temp).await?;
    if read == 0 {
        return Err(anyhow!("connection closed while reading chunked body"));
    }
    buffer.extend(&temp[..read]);
    Ok(())
}

fn find_crlf_in_deque(buffer: &VecDeque<u8>) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            let name = h.name.to_string();
            let value = String::from_utf8_lossy(h.value).to_string();
            (name, value)
        })
        .collect()
}

pub(crate) async fn write_response<W>(
    stream: &mut W,
    response: &OutboundResponse,
    keep_alive: bool,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = http::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("");

    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
    for (name, value) in &response.headers {
        let lower = name.to_ascii_lowercase();
        if FRAMING_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    Ok(())
}

async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.as_bytes();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        code,
        message,
        body_bytes.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
