//! Response writer wrapper
//!
//! The writer buffers status, headers and body on behalf of a handler
//! running on a blocking thread, while the connection task owns the socket.
//! Both sides reach the socket through a shared slot; the writer's state
//! mutex decides who may touch the wire and in what framing:
//!
//! - no `flush()` during the handler → one fixed-length response at the end;
//! - `flush()` mid-handler → the head goes out immediately and the body is
//!   streamed with chunked framing;
//! - `hijack()` → the socket leaves the slot entirely and the engine never
//!   writes a response on this connection again.

use std::sync::{Arc, Mutex};

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, SERVER, TRANSFER_ENCODING};
use http::{HeaderMap, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{status_text, Error, ErrorKind, Result};

/// Server identification header value
pub fn server_header() -> String {
    format!("lug/{}", env!("CARGO_PKG_VERSION"))
}

/// Both halves of a connection, erased
pub trait ConnStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnStream for T {}

/// The shared socket slot: `Some` while the engine owns the connection,
/// `None` once a handler hijacked it
pub type IoSlot = Arc<tokio::sync::Mutex<Option<Box<dyn ConnStream>>>>;

#[derive(Debug)]
struct WriterState {
    status: u16,
    headers: HeaderMap,
    wrote_header: bool,
    head_on_wire: bool,
    chunked: bool,
    buf: Vec<u8>,
    bytes_written: u64,
    hijacked: bool,
    timed_out: bool,
    version: Version,
}

impl WriterState {
    fn fresh(version: Version) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html;charset=utf-8"));
        if let Ok(value) = HeaderValue::from_str(&server_header()) {
            headers.insert(SERVER, value);
        }
        Self {
            status: 0,
            headers,
            wrote_header: false,
            head_on_wire: false,
            chunked: false,
            buf: Vec::new(),
            bytes_written: 0,
            hijacked: false,
            timed_out: false,
            version,
        }
    }
}

/// Buffering response writer shared between the handler thread and the
/// connection task
#[derive(Clone)]
pub struct ResponseWriter {
    io: IoSlot,
    state: Arc<Mutex<WriterState>>,
}

fn head_bytes(version: Version, status: u16, headers: &HeaderMap) -> Vec<u8> {
    let version = match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let mut head = format!("{version} {status} {}\r\n", status_text(status)).into_bytes();
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

impl ResponseWriter {
    /// Create a writer over the connection's socket slot
    pub fn new(io: IoSlot, version: Version) -> Self {
        Self {
            io,
            state: Arc::new(Mutex::new(WriterState::fresh(version))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WriterState> {
        // a poisoned writer means a panicking handler; recover the state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reset for a new request on the same connection
    pub fn reset(&self, version: Version) {
        *self.lock() = WriterState::fresh(version);
    }

    /// Current status (0 until one is recorded)
    pub fn status(&self) -> u16 {
        self.lock().status
    }

    /// Total body bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        let state = self.lock();
        state.bytes_written + state.buf.len() as u64
    }

    /// Whether a status has been recorded
    pub fn wrote_header(&self) -> bool {
        self.lock().wrote_header
    }

    /// Whether the handler hijacked the connection
    pub fn hijacked(&self) -> bool {
        self.lock().hijacked
    }

    /// Whether the engine already answered with a timeout
    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    /// Whether any body bytes were produced
    pub fn body_is_empty(&self) -> bool {
        let state = self.lock();
        state.buf.is_empty() && state.bytes_written == 0
    }

    fn check_writable(state: &WriterState) -> Result<()> {
        if state.hijacked {
            return Err(Error::new(ErrorKind::Hijacked, "connection was hijacked"));
        }
        if state.timed_out {
            return Err(Error::new(ErrorKind::Timeout, "request already timed out"));
        }
        Ok(())
    }

    /// Record the response status; a second call fails
    pub fn write_header(&self, status: u16) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        if !(100..600).contains(&status) {
            return Err(Error::new(ErrorKind::InvalidStatus, format!("status {status} out of range")));
        }
        if state.wrote_header {
            return Err(Error::new(
                ErrorKind::ResponseAlreadyWritten,
                "response header already written",
            ));
        }
        state.status = status;
        state.wrote_header = true;
        Ok(())
    }

    /// Append body bytes, recording a 200 header if none was set
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        if !state.wrote_header {
            state.status = 200;
            state.wrote_header = true;
        }
        state.buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Replace a header
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::new(ErrorKind::ArgumentError, format!("bad header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::new(ErrorKind::ArgumentError, format!("bad header value: {e}")))?;
        state.headers.insert(name, value);
        Ok(())
    }

    /// Append a header without replacing existing values
    pub fn add_header(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::new(ErrorKind::ArgumentError, format!("bad header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::new(ErrorKind::ArgumentError, format!("bad header value: {e}")))?;
        state.headers.append(name, value);
        Ok(())
    }

    /// Remove a header
    pub fn del_header(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            state.headers.remove(name);
        }
        Ok(())
    }

    /// Force the recorded status and body, bypassing the written-header
    /// guard (used by `error()` and by the engine's own failure paths)
    pub fn overwrite(&self, status: u16, body: &[u8]) {
        let mut state = self.lock();
        if state.hijacked || state.head_on_wire {
            return;
        }
        state.status = status;
        state.wrote_header = true;
        state.buf.clear();
        state.buf.extend_from_slice(body);
    }

    /// Stream the buffered head and body to the wire now (chunked framing)
    ///
    /// Called from the handler thread through the supplied blocking
    /// executor, which must run the returned future to completion.
    pub fn flush(&self, handle: &tokio::runtime::Handle) -> Result<()> {
        let (head, chunk) = {
            let mut state = self.lock();
            Self::check_writable(&state)?;
            if !state.wrote_header {
                state.status = 200;
                state.wrote_header = true;
            }
            let head = if state.head_on_wire {
                None
            } else {
                state.chunked = true;
                state.head_on_wire = true;
                state.headers.remove(CONTENT_LENGTH);
                state.headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Some(head_bytes(state.version, state.status, &state.headers))
            };
            let chunk = std::mem::take(&mut state.buf);
            state.bytes_written += chunk.len() as u64;
            (head, chunk)
        };

        let io = self.io.clone();
        handle
            .block_on(async move {
                let mut slot = io.lock().await;
                let Some(stream) = slot.as_mut() else {
                    return Err(Error::new(ErrorKind::Hijacked, "connection not available"));
                };
                if let Some(head) = head {
                    stream.write_all(&head).await?;
                }
                if !chunk.is_empty() {
                    let framing = format!("{:x}\r\n", chunk.len());
                    stream.write_all(framing.as_bytes()).await?;
                    stream.write_all(&chunk).await?;
                    stream.write_all(b"\r\n").await?;
                }
                stream.flush().await?;
                Ok(())
            })
    }

    /// Mark the connection as hijacked; the engine stops writing
    pub fn mark_hijacked(&self) -> Result<()> {
        let mut state = self.lock();
        if state.timed_out {
            return Err(Error::new(ErrorKind::Timeout, "request already timed out"));
        }
        if state.wrote_header || state.head_on_wire {
            return Err(Error::new(
                ErrorKind::ResponseAlreadyWritten,
                "cannot hijack after response started",
            ));
        }
        if state.hijacked {
            return Err(Error::new(ErrorKind::Hijacked, "connection already hijacked"));
        }
        state.hijacked = true;
        Ok(())
    }

    /// Mark the request as timed out after the engine responded 408
    pub fn mark_timed_out(&self) {
        self.lock().timed_out = true;
    }

    /// Remove the socket from the shared slot (hijack handoff)
    pub async fn take_io(&self) -> Option<Box<dyn ConnStream>> {
        self.io.lock().await.take()
    }

    /// Emit the final response from the connection task
    ///
    /// Returns the total body bytes sent, and whether the connection may be
    /// kept alive.
    pub async fn finalize(&self, allow_keep_alive: bool) -> Result<(u64, bool)> {
        let (payload, total) = {
            let mut state = self.lock();
            if state.hijacked {
                return Ok((state.bytes_written, false));
            }
            if !state.wrote_header {
                state.status = 200;
                state.wrote_header = true;
            }
            let body = std::mem::take(&mut state.buf);
            state.bytes_written += body.len() as u64;

            let mut payload = Vec::new();
            if state.chunked {
                if !body.is_empty() {
                    payload.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
                    payload.extend_from_slice(&body);
                    payload.extend_from_slice(b"\r\n");
                }
                payload.extend_from_slice(b"0\r\n\r\n");
            } else {
                if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
                    state.headers.insert(CONTENT_LENGTH, value);
                }
                if !allow_keep_alive {
                    state
                        .headers
                        .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
                }
                payload = head_bytes(state.version, state.status, &state.headers);
                payload.extend_from_slice(&body);
            }
            (payload, state.bytes_written)
        };

        let mut slot = self.io.lock().await;
        let Some(stream) = slot.as_mut() else {
            return Ok((total, false));
        };
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok((total, allow_keep_alive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> ResponseWriter {
        let io: IoSlot = Arc::new(tokio::sync::Mutex::new(None));
        ResponseWriter::new(io, Version::HTTP_11)
    }

    #[test]
    fn test_default_headers_present() {
        let w = writer();
        let state = w.lock();
        assert_eq!(state.headers.get(CONTENT_TYPE).unwrap(), "text/html;charset=utf-8");
        assert!(state.headers.get(SERVER).unwrap().to_str().unwrap().starts_with("lug/"));
    }

    #[test]
    fn test_write_header_twice_fails() {
        let w = writer();
        w.write_header(201).unwrap();
        let err = w.write_header(202).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseAlreadyWritten);
        assert_eq!(w.status(), 201);
    }

    #[test]
    fn test_write_records_200() {
        let w = writer();
        assert!(!w.wrote_header());
        w.write(b"ok").unwrap();
        assert!(w.wrote_header());
        assert_eq!(w.status(), 200);
        assert_eq!(w.bytes_written(), 2);
    }

    #[test]
    fn test_status_out_of_range() {
        let w = writer();
        assert_eq!(w.write_header(99).unwrap_err().kind(), ErrorKind::InvalidStatus);
        assert_eq!(w.write_header(600).unwrap_err().kind(), ErrorKind::InvalidStatus);
    }

    #[test]
    fn test_hijack_blocks_writes() {
        let w = writer();
        w.mark_hijacked().unwrap();
        assert_eq!(w.write(b"x").unwrap_err().kind(), ErrorKind::Hijacked);
        assert_eq!(w.write_header(200).unwrap_err().kind(), ErrorKind::Hijacked);
        assert_eq!(w.set_header("X-Late", "1").unwrap_err().kind(), ErrorKind::Hijacked);
    }

    #[test]
    fn test_hijack_after_write_fails() {
        let w = writer();
        w.write(b"started").unwrap();
        assert_eq!(w.mark_hijacked().unwrap_err().kind(), ErrorKind::ResponseAlreadyWritten);
    }

    #[test]
    fn test_timeout_blocks_writes() {
        let w = writer();
        w.mark_timed_out();
        assert_eq!(w.write(b"x").unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(w.mark_hijacked().unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_finalize_writes_content_length() {
        let (client, server) = tokio::io::duplex(4096);
        let io: IoSlot = Arc::new(tokio::sync::Mutex::new(Some(Box::new(server) as Box<dyn ConnStream>)));
        let w = ResponseWriter::new(io, Version::HTTP_11);
        w.write_header(200).unwrap();
        w.write(b"hello").unwrap();
        let (bytes, keep_alive) = w.finalize(true).await.unwrap();
        assert_eq!(bytes, 5);
        assert!(keep_alive);

        drop(w);
        let mut output = Vec::new();
        let mut client = client;
        use tokio::io::AsyncReadExt;
        let mut chunk = [0u8; 1024];
        let n = client.read(&mut chunk).await.unwrap();
        output.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&output);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_overwrite_discards_buffer() {
        let w = writer();
        w.write(b"partial").unwrap();
        w.overwrite(500, b"boom");
        assert_eq!(w.status(), 500);
        let state = w.lock();
        assert_eq!(state.buf, b"boom");
    }
}
