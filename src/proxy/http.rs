//! Minimal HTTP/1.1 wire handling for the credential proxy.
//!
//! Deliberately narrow: one request per connection, no pipelining, no
//! chunked *ingestion* (any `Transfer-Encoding` on a request is rejected to
//! rule out smuggling). Upstream responses may be chunked; they are
//! de-chunked here and re-streamed to the agent close-delimited.

use std::io::{self, BufRead, Read, Write};

/// Hard caps on header section shape, against slowloris-style abuse.
const MAX_HEADER_COUNT: usize = 100;
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Why a request could not be served. Maps to a fixed status + body; the
/// reason strings are static and never echo client bytes.
#[derive(Debug)]
pub enum HttpError {
    /// Malformed or forbidden request (400).
    BadRequest(&'static str),
    /// Declared body over the limit (413).
    PayloadTooLarge,
    /// Peer vanished or a socket deadline expired; close without a response.
    Closed,
    Io(io::Error),
}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => HttpError::Closed,
            _ => HttpError::Io(err),
        }
    }
}

/// A fully read inbound request. Header names are lowercased.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First value of a (lowercase) header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers.iter().filter(|(n, _)| n == name).count()
    }
}

/// Read one request from the client connection.
pub fn read_request(reader: &mut impl BufRead, max_body: u64) -> Result<Request, HttpError> {
    let line = read_line(reader)?;
    if line.is_empty() {
        return Err(HttpError::Closed);
    }

    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or_default();
    let target = parts.next().ok_or(HttpError::BadRequest("bad request line"))?;
    let version = parts.next().ok_or(HttpError::BadRequest("bad request line"))?;

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(HttpError::BadRequest("bad method"));
    }
    // CR or LF inside the target would let the agent inject headers into
    // the rewritten upstream request.
    if target.is_empty() || target.contains('\r') || target.contains('\n') {
        return Err(HttpError::BadRequest("bad request path"));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::BadRequest("unsupported protocol"));
    }

    let headers = read_headers(reader)?;

    if headers.iter().any(|(n, _)| n == "transfer-encoding") {
        return Err(HttpError::BadRequest("transfer-encoding not supported"));
    }

    let content_lengths: Vec<&str> = headers
        .iter()
        .filter(|(n, _)| n == "content-length")
        .map(|(_, v)| v.as_str())
        .collect();
    let content_length: u64 = match content_lengths.as_slice() {
        [] => 0,
        [single] => single
            .parse()
            .map_err(|_| HttpError::BadRequest("bad content-length"))?,
        _ => return Err(HttpError::BadRequest("bad content-length")),
    };
    if content_length > max_body {
        return Err(HttpError::PayloadTooLarge);
    }

    let mut body = vec![0u8; content_length as usize];
    reader.read_exact(&mut body)?;

    Ok(Request {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        body,
    })
}

/// Head of an upstream response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// How the upstream delimits its response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

pub fn read_response_head(reader: &mut impl BufRead) -> Result<ResponseHead, HttpError> {
    let line = read_line(reader)?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::BadRequest("bad upstream status line"));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::BadRequest("bad upstream status line"))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = read_headers(reader)?;
    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Determine the body framing for a response to `method`.
pub fn response_body_kind(method: &str, head: &ResponseHead) -> BodyKind {
    if method == "HEAD" || head.status == 204 || head.status == 304 || head.status < 200 {
        return BodyKind::None;
    }
    if let Some(te) = head.header("transfer-encoding")
        && te.to_ascii_lowercase().contains("chunked")
    {
        return BodyKind::Chunked;
    }
    match head.header("content-length").and_then(|v| v.parse().ok()) {
        Some(n) => BodyKind::Length(n),
        None => BodyKind::UntilClose,
    }
}

/// Copy an upstream body to the client in fixed-size chunks, flushing after
/// each so long-lived SSE streams reach the agent as they arrive.
pub fn stream_body(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    kind: BodyKind,
    chunk_size: usize,
) -> Result<(), HttpError> {
    match kind {
        BodyKind::None => Ok(()),
        BodyKind::Length(total) => copy_exact(reader, writer, total, chunk_size),
        BodyKind::UntilClose => copy_until_close(reader, writer, chunk_size),
        BodyKind::Chunked => {
            loop {
                let size_line = read_line(reader)?;
                let size_hex = size_line.split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(size_hex, 16)
                    .map_err(|_| HttpError::BadRequest("bad upstream chunk"))?;
                if size == 0 {
                    break;
                }
                copy_exact(reader, writer, size, chunk_size)?;
                expect_crlf(reader)?;
            }
            // Drain optional trailers up to the final blank line.
            loop {
                if read_line(reader)?.is_empty() {
                    break;
                }
            }
            Ok(())
        }
    }
}

fn copy_exact(
    reader: &mut impl Read,
    writer: &mut impl Write,
    total: u64,
    chunk_size: usize,
) -> Result<(), HttpError> {
    let mut remaining = total;
    let mut buf = vec![0u8; chunk_size];
    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let read = reader.read(&mut buf[..want])?;
        if read == 0 {
            return Err(HttpError::Closed);
        }
        writer.write_all(&buf[..read])?;
        writer.flush()?;
        remaining -= read as u64;
    }
    Ok(())
}

fn copy_until_close(
    reader: &mut impl Read,
    writer: &mut impl Write,
    chunk_size: usize,
) -> Result<(), HttpError> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buf[..read])?;
        writer.flush()?;
    }
}

fn expect_crlf(reader: &mut impl BufRead) -> Result<(), HttpError> {
    if read_line(reader)?.is_empty() {
        Ok(())
    } else {
        Err(HttpError::BadRequest("bad upstream chunk"))
    }
}

/// Read one CRLF-terminated line, stripped. Bounded length.
fn read_line(reader: &mut impl BufRead) -> Result<String, HttpError> {
    let mut line = String::new();
    let read = reader
        .by_ref()
        .take(MAX_LINE_BYTES as u64)
        .read_line(&mut line)?;
    if read == 0 {
        return Err(HttpError::Closed);
    }
    if !line.ends_with('\n') {
        // Either the line overflowed the cap or the peer closed mid-line.
        return Err(HttpError::BadRequest("line too long"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Read the header section. Names come back lowercased and trimmed.
fn read_headers(reader: &mut impl BufRead) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(HttpError::BadRequest("too many headers"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::BadRequest("bad header"))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        if name.is_empty() || value.contains('\r') || value.contains('\n') {
            return Err(HttpError::BadRequest("bad header"));
        }
        headers.push((name, value));
    }
}

/// Write a complete fixed-body error response.
pub fn write_error(
    writer: &mut impl Write,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()> {
    write!(
        writer,
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )?;
    writer.flush()
}
