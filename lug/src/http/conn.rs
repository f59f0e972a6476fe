//! HTTP/1.1 connection driver
//!
//! Reads request heads with `httparse` through the shared socket slot and
//! frames bodies by Content-Length or chunked transfer coding. The slot is
//! only locked while actually reading, so a handler thread can reach the
//! same socket for `flush()` and `hijack()` between requests' phases.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Version;
use tokio::io::AsyncReadExt;

use crate::error::{Error, ErrorKind, Result};
use crate::http::response::IoSlot;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// One parsed inbound request
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    pub version: Version,
    pub proto: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub keep_alive: bool,
}

async fn fill(io: &IoSlot, buf: &mut BytesMut) -> Result<usize> {
    let mut slot = io.lock().await;
    let stream = slot
        .as_mut()
        .ok_or_else(|| Error::new(ErrorKind::Hijacked, "connection no longer owned"))?;
    let read = stream.read_buf(buf).await?;
    Ok(read)
}

/// Read one request from the connection
///
/// Returns `Ok(None)` on a clean close between requests. `buf` carries
/// pipelined leftovers across calls.
pub async fn read_request(io: &IoSlot, buf: &mut BytesMut) -> Result<Option<ParsedRequest>> {
    // ---- head -----------------------------------------------------------
    let (head_len, method, path, raw_query, version, headers) = loop {
        if !buf.is_empty() {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parser = httparse::Request::new(&mut header_storage);
            match parser.parse(buf).map_err(|e| {
                Error::new(ErrorKind::IOError, format!("malformed request head: {e}"))
            })? {
                httparse::Status::Complete(head_len) => {
                    let method = parser.method.unwrap_or("GET").to_string();
                    let target = parser.path.unwrap_or("/");
                    let (path, raw_query) = match target.split_once('?') {
                        Some((path, query)) => (path.to_string(), query.to_string()),
                        None => (target.to_string(), String::new()),
                    };
                    let version = if parser.version == Some(0) {
                        Version::HTTP_10
                    } else {
                        Version::HTTP_11
                    };
                    let mut headers = HeaderMap::new();
                    for header in parser.headers.iter() {
                        let name = HeaderName::from_bytes(header.name.as_bytes());
                        let value = HeaderValue::from_bytes(header.value);
                        if let (Ok(name), Ok(value)) = (name, value) {
                            headers.append(name, value);
                        }
                    }
                    break (head_len, method, path, raw_query, version, headers);
                }
                httparse::Status::Partial => {
                    if buf.len() > MAX_HEAD_BYTES {
                        return Err(Error::new(ErrorKind::IOError, "request head too large"));
                    }
                }
            }
        }
        let read = fill(io, buf).await?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::new(ErrorKind::IOError, "connection closed mid-request"));
        }
    };

    let _ = buf.split_to(head_len);

    // ---- body -----------------------------------------------------------
    let chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));

    let body = if chunked {
        read_chunked_body(io, buf).await?
    } else {
        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < content_length {
            let read = fill(io, buf).await?;
            if read == 0 {
                return Err(Error::new(ErrorKind::IOError, "connection closed mid-body"));
            }
        }
        buf.split_to(content_length).freeze()
    };

    let connection = headers
        .get(http::header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let keep_alive = match version {
        Version::HTTP_10 => connection.contains("keep-alive"),
        _ => !connection.contains("close"),
    };
    let proto = match version {
        Version::HTTP_10 => "HTTP/1.0".to_string(),
        _ => "HTTP/1.1".to_string(),
    };

    Ok(Some(ParsedRequest {
        method,
        path,
        raw_query,
        version,
        proto,
        headers,
        body,
        keep_alive,
    }))
}

async fn read_chunked_body(io: &IoSlot, buf: &mut BytesMut) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        // size line
        let line_end = loop {
            if let Some(pos) = find_crlf(buf) {
                break pos;
            }
            if fill(io, buf).await? == 0 {
                return Err(Error::new(ErrorKind::IOError, "connection closed mid-chunk"));
            }
        };
        let size_text = String::from_utf8_lossy(&buf[..line_end]).trim().to_string();
        let size_text = size_text.split(';').next().unwrap_or_default().trim().to_string();
        let size = usize::from_str_radix(&size_text, 16)
            .map_err(|_| Error::new(ErrorKind::IOError, format!("bad chunk size {size_text:?}")))?;
        let _ = buf.split_to(line_end + 2);

        if size == 0 {
            // trailing CRLF (ignore optional trailers)
            while find_crlf(buf).is_none() {
                if fill(io, buf).await? == 0 {
                    break;
                }
            }
            if let Some(pos) = find_crlf(buf) {
                let _ = buf.split_to(pos + 2);
            }
            return Ok(body.freeze());
        }

        while buf.len() < size + 2 {
            if fill(io, buf).await? == 0 {
                return Err(Error::new(ErrorKind::IOError, "connection closed mid-chunk"));
            }
        }
        body.extend_from_slice(&buf[..size]);
        let _ = buf.split_to(size + 2);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::ConnStream;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    async fn slot_with(data: &[u8]) -> IoSlot {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(data).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        Arc::new(tokio::sync::Mutex::new(Some(Box::new(server) as Box<dyn ConnStream>)))
    }

    #[tokio::test]
    async fn test_parse_simple_get() {
        let io = slot_with(b"GET /a/b?x=1 HTTP/1.1\r\nHost: h\r\n\r\n").await;
        let mut buf = BytesMut::new();
        let request = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/a/b");
        assert_eq!(request.raw_query, "x=1");
        assert_eq!(request.headers.get("host").unwrap(), "h");
        assert!(request.keep_alive);
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_parse_body_content_length() {
        let io = slot_with(b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await;
        let mut buf = BytesMut::new();
        let request = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(&request.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_parse_chunked_body() {
        let io = slot_with(b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .await;
        let mut buf = BytesMut::new();
        let request = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert_eq!(&request.body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_pipelined_requests_leave_leftover() {
        let io = slot_with(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n").await;
        let mut buf = BytesMut::new();
        let first = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert_eq!(first.path, "/1");
        let second = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert_eq!(second.path, "/2");
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let io = slot_with(b"").await;
        let mut buf = BytesMut::new();
        assert!(read_request(&io, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_close_header() {
        let io = slot_with(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let mut buf = BytesMut::new();
        let request = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert!(!request.keep_alive);
    }

    #[tokio::test]
    async fn test_http10_defaults_to_close() {
        let io = slot_with(b"GET / HTTP/1.0\r\n\r\n").await;
        let mut buf = BytesMut::new();
        let request = read_request(&io, &mut buf).await.unwrap().unwrap();
        assert_eq!(request.version, Version::HTTP_10);
        assert!(!request.keep_alive);
    }
}
