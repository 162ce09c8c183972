//! Just enough HTTP/1.1 to talk CONNECT to a proxy.

use crate::error::TransportError;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

/// Serializes a CONNECT request head.
pub fn encode_request(request: &Request<()>) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", request.method(), request.uri()).into_bytes();
    for (name, value) in request.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Reads a response head. `Ok(None)` means the proxy closed the connection
/// before sending a status line.
pub async fn read_response_head<R>(
    reader: &mut R,
    max_header_size: usize,
) -> Result<Option<Response<()>>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut status_line = String::new();
    let mut consumed = read_bounded_line(reader, &mut status_line, max_header_size).await?;
    if consumed == 0 {
        return Ok(None);
    }

    // Parse status line: HTTP/1.1 407 Proxy Authentication Required
    let mut parts = status_line.trim_end().splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => {
            return Err(TransportError::Protocol(format!(
                "Invalid status line from proxy: {}",
                status_line.trim_end()
            )));
        }
    };
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            TransportError::Protocol(format!("Invalid status code in: {}", status_line.trim_end()))
        })?;

    let mut response = Response::builder()
        .status(status)
        .version(version)
        .body(())
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

    loop {
        let mut header_line = String::new();
        let n = read_bounded_line(reader, &mut header_line, max_header_size - consumed).await?;
        if n == 0 {
            return Err(TransportError::Protocol(
                "Connection closed while reading proxy response headers".to_string(),
            ));
        }
        consumed += n;

        let line = header_line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::Protocol(format!("Malformed header line: {}", line)));
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| TransportError::Protocol(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| TransportError::Protocol(format!("Invalid header value: {}", e)))?;
        response.headers_mut().append(name, value);
    }

    Ok(Some(response))
}

// Reads one line of at most `budget` bytes, newline included. Never buffers
// more than the budget into `line`.
async fn read_bounded_line<R>(reader: &mut R, line: &mut String, budget: usize) -> Result<usize, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let exceeded = || TransportError::Protocol("Proxy response head exceeds the header size limit".to_string());
    if budget == 0 {
        return Err(exceeded());
    }

    let n = (&mut *reader).take(budget as u64).read_line(line).await?;
    if n > 0 && !line.ends_with('\n') {
        if n == budget {
            return Err(exceeded());
        }
        return Err(TransportError::Protocol(
            "Connection closed in the middle of a proxy response line".to_string(),
        ));
    }
    Ok(n)
}

/// Reads whatever body follows `head`. A successful CONNECT has none: the
/// bytes after its head belong to the tunnel.
pub async fn read_response_body<R>(reader: &mut R, head: &Response<()>) -> Result<Bytes, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let status = head.status();
    if status.is_success()
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Bytes::new());
    }

    let chunked = head
        .headers()
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));

    if chunked {
        return read_chunked(reader).await;
    }

    if let Some(length) = head.headers().get(CONTENT_LENGTH) {
        let length: usize = length
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| TransportError::Protocol("Invalid Content-Length".to_string()))?;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        return Ok(Bytes::from(body));
    }

    // Read until connection close
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    Ok(Bytes::from(body))
}

async fn read_chunked<R>(reader: &mut R) -> Result<Bytes, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await? == 0 {
            return Err(TransportError::Protocol("Unexpected EOF in chunked body".to_string()));
        }
        let size = size_line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size.trim(), 16)
            .map_err(|e| TransportError::Protocol(format!("Invalid chunk size: {}", e)))?;

        if size == 0 {
            break;
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        // Read trailing \r\n
        let mut trailing = [0u8; 2];
        reader.read_exact(&mut trailing).await?;
    }

    // Trailer section ends with an empty line.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }

    Ok(Bytes::from(body))
}
