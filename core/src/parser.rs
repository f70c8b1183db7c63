//! Incremental HTTP/1.1 response parser.
//!
//! # Design
//! `ResponseParser` is fed byte fragments as they arrive, together with a
//! flag telling whether the peer has closed. Each call answers one of: more
//! data needed, a `ParseError`, or the completed `HttpResponse`. The parser
//! does no I/O and keeps only what it has not yet consumed, so it can be
//! driven from any transport and tested with plain byte slices.
//!
//! Framing is decided once the header block is complete:
//! 1. `Transfer-Encoding: chunked` reads length-prefixed chunks up to the
//!    empty line that follows the last chunk and its trailers.
//! 2. `Content-Length` reads exactly that many bytes. Repeated fields, in any
//!    letter case, must carry the same value.
//! 3. `Connection: keep-alive` with neither is rejected as ambiguous.
//! 4. Anything else reads until the peer closes.
//!
//! Responses that cannot carry a body (1xx, 204, 304) are framed as zero
//! length before rules 2 to 4 apply.
//!
//! A parser is single-use: once it has produced a response every further
//! call fails with `ParseError::AlreadyComplete`.

use std::collections::HashMap;
use std::mem;

use memchr::memmem;

use crate::error::ParseError;
use crate::http::HttpResponse;

const HEADER_END: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// Outcome of a successful `ResponseParser::feed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Complete(HttpResponse),
}

/// How the end of the body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Fixed(usize),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    /// Bytes received but not yet consumed.
    buffer: Vec<u8>,
    /// `None` until the header block has been parsed.
    framing: Option<Framing>,
    keep_alive: bool,
    version: String,
    status: u16,
    reason: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    complete: bool,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers_parsed(&self) -> bool {
        self.framing.is_some()
    }

    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Whether the response announced `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume `data`. `peer_closed` reports that no more bytes will follow.
    pub fn feed(&mut self, data: &[u8], peer_closed: bool) -> Result<Progress, ParseError> {
        if self.complete {
            return Err(ParseError::AlreadyComplete);
        }
        self.buffer.extend_from_slice(data);

        let framing = match self.framing {
            Some(framing) => framing,
            None => match memmem::find(&self.buffer, HEADER_END) {
                Some(0) => return Err(ParseError::EmptyHeader),
                Some(end) => self.parse_head(end)?,
                None if peer_closed => return Err(ParseError::Truncated),
                None => return Ok(Progress::NeedMore),
            },
        };

        match framing {
            Framing::Fixed(len) => {
                if self.buffer.len() >= len {
                    self.buffer.truncate(len);
                    self.body = mem::take(&mut self.buffer);
                    Ok(self.finish())
                } else if peer_closed {
                    Err(ParseError::Truncated)
                } else {
                    Ok(Progress::NeedMore)
                }
            }
            Framing::CloseDelimited => {
                if peer_closed {
                    self.body = mem::take(&mut self.buffer);
                    Ok(self.finish())
                } else {
                    Ok(Progress::NeedMore)
                }
            }
            Framing::Chunked => self.feed_chunks(peer_closed),
        }
    }

    /// Parse the status line and headers ending at `end`, then pick the framing.
    fn parse_head(&mut self, end: usize) -> Result<Framing, ParseError> {
        let head = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        self.buffer.drain(..end + HEADER_END.len());

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let code = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(ParseError::MalformedStatusLine(status_line.to_string()));
        }
        let status = code
            .parse::<u16>()
            .map_err(|_| ParseError::MalformedStatusLine(status_line.to_string()))?;
        self.version = version.to_string();
        self.status = status;
        self.reason = parts.next().unwrap_or_default().to_string();

        let mut content_lengths = Vec::new();
        let mut chunked = false;
        let mut keep_alive = false;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(ParseError::MalformedHeader(line.to_string()));
            };
            if name.is_empty() {
                return Err(ParseError::MalformedHeader(line.to_string()));
            }
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_lengths.push(value.to_string());
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                // The last coding of the last field decides.
                chunked = value
                    .rsplit(',')
                    .next()
                    .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
            } else if name.eq_ignore_ascii_case("connection") {
                keep_alive |= value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("keep-alive"));
            }
            self.headers.insert(name.to_string(), value.to_string());
        }
        self.keep_alive = keep_alive;

        let framing = if chunked {
            Framing::Chunked
        } else if matches!(status, 100..=199 | 204 | 304) {
            Framing::Fixed(0)
        } else if !content_lengths.is_empty() {
            Framing::Fixed(content_length(&content_lengths)?)
        } else if keep_alive {
            return Err(ParseError::AmbiguousFraming);
        } else {
            Framing::CloseDelimited
        };
        self.framing = Some(framing);
        Ok(framing)
    }

    /// Move every complete chunk from the buffer into the body.
    fn feed_chunks(&mut self, peer_closed: bool) -> Result<Progress, ParseError> {
        let mut pos = 0;
        let outcome = loop {
            let pending = &self.buffer[pos..];
            let Some(line_end) = memmem::find(pending, CRLF) else {
                break None;
            };
            let size = parse_chunk_size(&pending[..line_end])?;
            if size == 0 {
                // Optional trailer fields, then the empty line that ends the body.
                let terminated = memmem::find(&pending[line_end..], HEADER_END).is_some();
                break (terminated || peer_closed).then_some(());
            }

            let data_start = line_end + CRLF.len();
            let frame_end = data_start
                .checked_add(size)
                .and_then(|end| end.checked_add(CRLF.len()))
                .ok_or_else(|| ParseError::InvalidChunkSize(format!("{size:x}")))?;
            let data_end = frame_end - CRLF.len();
            let Some(trailer) = pending.get(data_end..frame_end) else {
                break None;
            };
            if trailer != CRLF {
                return Err(ParseError::MalformedChunk);
            }
            self.body.extend_from_slice(&pending[data_start..data_end]);
            pos += frame_end;
        };

        self.buffer.drain(..pos);
        match outcome {
            Some(()) => {
                self.buffer.clear();
                Ok(self.finish())
            }
            None if peer_closed => Err(ParseError::Truncated),
            None => Ok(Progress::NeedMore),
        }
    }

    fn finish(&mut self) -> Progress {
        self.complete = true;
        Progress::Complete(HttpResponse {
            version: mem::take(&mut self.version),
            status: self.status,
            reason: mem::take(&mut self.reason),
            headers: mem::take(&mut self.headers),
            body: mem::take(&mut self.body),
        })
    }
}

/// Every `Content-Length` field must agree, whatever its spelling.
fn content_length(values: &[String]) -> Result<usize, ParseError> {
    let invalid = || ParseError::InvalidContentLength(values.join(", "));
    let mut lengths = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().parse::<usize>().map_err(|_| invalid()));
    let first = lengths.next().ok_or_else(invalid)??;
    for len in lengths {
        if len? != first {
            return Err(invalid());
        }
    }
    Ok(first)
}

/// Hex size at the start of a chunk line; `;extensions` are ignored.
fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let invalid = || ParseError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned());
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() {
        return Err(invalid());
    }
    usize::from_str_radix(digits, 16).map_err(|_| invalid())
}
