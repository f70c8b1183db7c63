//! Error types for the engine.
//!
//! # Design
//! Errors are split by when they surface. `EngineError` is returned
//! synchronously from registration and construction. `TransferError` never
//! escapes `Engine::request`: it is recorded in the `Summary` while the
//! request's callback receives an absent response. `ParseError` is the
//! protocol-level failure reported by the response parser.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::connection::Phase;

/// Errors raised synchronously while constructing an engine or registering a request.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// DNS lookup failed or yielded no address.
    #[error("unable to resolve host `{host}`")]
    UnresolvableHost { host: String },

    /// The request body is not a JSON object.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// A caller header has an invalid name or a value containing CR or LF.
    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    /// An `EngineConfig` document could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The TLS client configuration could not be built.
    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    /// Socket or poller setup failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that end a transfer. Delivered to the callback as an absent response.
///
/// One failure can end several requests queued on the same connection, so
/// I/O causes are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("connect failed: {0}")]
    Connect(#[source] Arc<io::Error>),

    #[error("write failed: {0}")]
    Write(#[source] Arc<io::Error>),

    #[error("read failed: {0}")]
    Read(#[source] Arc<io::Error>),

    /// The connection closed while the request was still outstanding.
    #[error("connection closed before the request finished")]
    Closed,

    #[error("{phase} timed out after {waited:?}")]
    Timeout { phase: Phase, waited: Duration },

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
}

impl TransferError {
    pub fn connect(err: io::Error) -> Self {
        TransferError::Connect(Arc::new(err))
    }

    pub fn write(err: io::Error) -> Self {
        TransferError::Write(Arc::new(err))
    }

    pub fn read(err: io::Error) -> Self {
        TransferError::Read(Arc::new(err))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }
}

/// Malformed or ambiguous response framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The response started with the header terminator.
    #[error("empty header block")]
    EmptyHeader,

    #[error("malformed status line `{0}`")]
    MalformedStatusLine(String),

    #[error("malformed header line `{0}`")]
    MalformedHeader(String),

    /// `Connection: keep-alive` without `Content-Length` or chunking.
    #[error("keep-alive response without a body length")]
    AmbiguousFraming,

    #[error("invalid content-length `{0}`")]
    InvalidContentLength(String),

    #[error("invalid chunk size `{0}`")]
    InvalidChunkSize(String),

    #[error("chunk data not terminated by CRLF")]
    MalformedChunk,

    /// The peer closed before the response was complete.
    #[error("connection closed before the response was complete")]
    Truncated,

    /// Input arrived after the response had already been produced.
    #[error("parser already produced a response")]
    AlreadyComplete,
}
