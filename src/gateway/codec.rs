use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::worker::store::CachedResponse;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_LINE_BYTES: usize = 16 * 1024;
const MAX_HEADER_COUNT: usize = 100;

/// A parsed request head: method, raw target (origin-form or absolute-form),
/// and headers.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
}

pub async fn read_request_head<S>(reader: &mut BufReader<S>) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut request_line = String::new();
    let read = read_line(reader, &mut request_line).await?;
    if read == 0 {
        return Ok(None);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("missing request method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("missing request target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("missing request version"))?;
    ensure!(
        version == "HTTP/1.1" || version == "HTTP/1.0",
        "unsupported protocol version {version}"
    );
    let method: Method = method
        .parse()
        .map_err(|_| anyhow!("invalid request method {method}"))?;

    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        let read = read_line(reader, &mut line).await?;
        if read == 0 {
            bail!("connection closed while reading headers");
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        ensure!(
            headers.len() < MAX_HEADER_COUNT,
            "too many request headers"
        );
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line"))?;
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.trim()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        headers,
    }))
}

/// Reads a request body of exactly Content-Length bytes, bounded by `max`.
/// Chunked uploads are rejected rather than half-read.
pub async fn read_body<S>(reader: &mut BufReader<S>, headers: &HeaderMap, max: usize) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    if headers.contains_key(TRANSFER_ENCODING) {
        bail!("chunked request bodies are not supported");
    }
    let length = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| anyhow!("invalid content-length"))?,
        None => return Ok(Bytes::new()),
    };
    ensure!(length <= max, "request body of {length} bytes exceeds limit");

    let mut body = vec![0u8; length];
    timeout(READ_TIMEOUT, tokio::io::AsyncReadExt::read_exact(reader, &mut body))
        .await
        .map_err(|_| anyhow!("timed out reading request body"))??;
    Ok(Bytes::from(body))
}

async fn read_line<S>(reader: &mut BufReader<S>, buf: &mut String) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let read = timeout(READ_TIMEOUT, reader.read_line(buf))
        .await
        .map_err(|_| anyhow!("timed out reading request"))??;
    ensure!(buf.len() <= MAX_LINE_BYTES, "request line exceeds limit");
    Ok(read)
}

/// Writes a full response and closes the exchange. Hop-by-hop headers are
/// replaced with our own framing: explicit Content-Length, Connection: close.
pub async fn write_response<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("OK")
    );
    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == CONNECTION || name == TRANSFER_ENCODING {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_cached_response<S>(stream: &mut S, response: &CachedResponse) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, response.status, &response.headers, &response.body).await
}

pub async fn write_error<S>(stream: &mut S, status: StatusCode, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    write_response(stream, status, &headers, reason.as_bytes()).await
}
