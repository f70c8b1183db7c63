//! Per-connection state machine.
//!
//! # Design
//! A `Connection` owns one transport, a queue of encoded requests and the
//! parser for the response currently awaited. It performs no waiting of its
//! own: the engine calls `attempt_send` or `attempt_receive` when the poller
//! reports the socket ready, and `charge` once per round to account waited
//! time against the phase budget.
//!
//! ```text
//! Connecting --first write--> AwaitingSend --all bytes written--> AwaitingReceive
//!                                  ^                                    |
//!                                  +------ response, more queued -------+
//!                                                                       |
//!           any state --failure / timeout--> Closed <--response, queue empty
//! ```
//!
//! Every request handed to a connection gets exactly one callback: `Some`
//! when its response completes, `None` when the connection fails or closes
//! first. Closing is idempotent, and the transport is dropped exactly once.
//!
//! Besides firing callbacks the connection records an `Outcome` per event so
//! the engine can report which ids were sent, completed or failed.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{ParseError, TransferError};
use crate::http::{HttpResponse, RequestId};
use crate::parser::{Progress, ResponseParser};

/// Key identifying a connection inside one engine and its poller.
pub type ConnectionId = usize;

/// Completion callback of a single request.
pub type Callback = Box<dyn FnOnce(RequestId, Option<HttpResponse>)>;

const READ_CHUNK: usize = 16 * 1024;

/// Byte stream a connection drives. Reads and writes are expected to be
/// non-blocking and report `WouldBlock` when no progress is possible.
pub trait Transport: Read + Write {
    /// Error left behind by a non-blocking connect, if any.
    fn take_connect_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }

    /// Whether the next write can only progress after reading, as while a
    /// TLS handshake waits for the server.
    fn wants_read(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect issued, outcome not yet observed.
    Connecting,
    AwaitingSend,
    AwaitingReceive,
    Closed,
}

/// The two timeout budgets a connection is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Connecting and writing the request.
    Connect,
    /// Waiting for and reading the response.
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect phase",
            Phase::Read => "read phase",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    Complete,
    InProgress,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveProgress {
    Pending,
    Completed,
    Failed,
}

/// An encoded request waiting for its turn on a connection.
pub struct PendingRequest {
    pub id: RequestId,
    pub bytes: Vec<u8>,
    pub callback: Callback,
}

impl PendingRequest {
    pub fn new(
        id: RequestId,
        bytes: Vec<u8>,
        callback: impl FnOnce(RequestId, Option<HttpResponse>) + 'static,
    ) -> Self {
        Self {
            id,
            bytes,
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("bytes", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// Something that happened to a request, reported to the engine.
#[derive(Debug, Clone)]
pub enum Outcome {
    Sent(RequestId),
    Completed(RequestId),
    Failed(RequestId, TransferError),
}

pub struct Connection<T> {
    id: ConnectionId,
    transport: Option<T>,
    state: ConnectionState,
    queue: VecDeque<PendingRequest>,
    active: Option<(RequestId, Callback)>,
    send_buffer: Vec<u8>,
    cursor: usize,
    connect_waited: Duration,
    read_waited: Duration,
    parser: ResponseParser,
    outcomes: Vec<Outcome>,
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("active", &self.active.as_ref().map(|(id, _)| *id))
            .field("queued", &self.queue.len())
            .field("remaining", &(self.send_buffer.len() - self.cursor))
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap a transport whose connect has just been issued.
    pub fn new(id: ConnectionId, transport: T) -> Self {
        Self {
            id,
            transport: Some(transport),
            state: ConnectionState::Connecting,
            queue: VecDeque::new(),
            active: None,
            send_buffer: Vec::new(),
            cursor: 0,
            connect_waited: Duration::ZERO,
            read_waited: Duration::ZERO,
            parser: ResponseParser::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Id of the request currently being sent or awaited.
    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|(id, _)| *id)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Unsent bytes of the active request.
    pub fn bytes_remaining(&self) -> usize {
        self.send_buffer.len() - self.cursor
    }

    /// The budget this connection is currently charged against, `None` once
    /// closed or while it has nothing to do.
    pub fn phase(&self) -> Option<Phase> {
        if self.active.is_none() {
            return None;
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::AwaitingSend => Some(Phase::Connect),
            ConnectionState::AwaitingReceive => Some(Phase::Read),
            ConnectionState::Closed => None,
        }
    }

    pub fn waited(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Connect => self.connect_waited,
            Phase::Read => self.read_waited,
        }
    }

    /// Budget left in `phase` before this connection times out.
    pub fn remaining(&self, phase: Phase, budget: Duration) -> Duration {
        budget.saturating_sub(self.waited(phase))
    }

    /// Hand a request to this connection. A closed connection fails it at once.
    pub fn enqueue(&mut self, request: PendingRequest) {
        if self.is_closed() {
            self.outcomes
                .push(Outcome::Failed(request.id, TransferError::Closed));
            (request.callback)(request.id, None);
            return;
        }
        self.queue.push_back(request);
        if self.active.is_none() {
            self.load_next();
        }
    }

    /// Add one round's waited time to the `phase` timer. Fails the connection
    /// and returns `true` once the cumulative wait meets `budget`.
    pub fn charge(&mut self, phase: Phase, elapsed: Duration, budget: Duration) -> bool {
        if self.phase() != Some(phase) {
            return false;
        }
        let waited = match phase {
            Phase::Connect => &mut self.connect_waited,
            Phase::Read => &mut self.read_waited,
        };
        *waited = waited.saturating_add(elapsed);
        let waited = *waited;
        trace!(connection = self.id, %phase, ?waited, ?budget, "charged round");

        if waited >= budget {
            self.fail(TransferError::Timeout { phase, waited });
            true
        } else {
            false
        }
    }

    /// Write as much of the active request as the transport accepts.
    pub fn attempt_send(&mut self) -> SendProgress {
        match self.state {
            ConnectionState::Closed => return SendProgress::Failed,
            ConnectionState::AwaitingReceive => return SendProgress::Complete,
            ConnectionState::Connecting | ConnectionState::AwaitingSend => {}
        }
        let Some(transport) = self.transport.as_mut() else {
            return SendProgress::Failed;
        };

        if self.state == ConnectionState::Connecting {
            match transport.take_connect_error() {
                Ok(None) => {
                    debug!(connection = self.id, "connected");
                    self.state = ConnectionState::AwaitingSend;
                }
                Ok(Some(err)) | Err(err) => {
                    self.fail(TransferError::connect(err));
                    return SendProgress::Failed;
                }
            }
        }

        let remaining = &self.send_buffer[self.cursor..];
        let written = match transport.write(remaining) {
            Ok(0) if !remaining.is_empty() => {
                self.fail(TransferError::write(ErrorKind::WriteZero.into()));
                return SendProgress::Failed;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => 0,
            Err(e) => {
                self.fail(TransferError::write(e));
                return SendProgress::Failed;
            }
        };
        self.cursor += written;
        trace!(
            connection = self.id,
            written,
            remaining = self.send_buffer.len() - self.cursor,
            "wrote"
        );
        if self.cursor < self.send_buffer.len() {
            return SendProgress::InProgress;
        }

        match transport.flush() {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return SendProgress::InProgress;
            }
            Err(e) => {
                self.fail(TransferError::write(e));
                return SendProgress::Failed;
            }
        }

        self.state = ConnectionState::AwaitingReceive;
        self.parser = ResponseParser::new();
        if let Some(id) = self.active_request() {
            debug!(connection = self.id, request = id, "request sent");
            self.outcomes.push(Outcome::Sent(id));
        }
        SendProgress::Complete
    }

    /// Drain every readable byte and feed it to the parser.
    pub fn attempt_receive(&mut self) -> ReceiveProgress {
        match self.state {
            ConnectionState::AwaitingReceive => {}
            ConnectionState::Closed => return ReceiveProgress::Failed,
            ConnectionState::Connecting | ConnectionState::AwaitingSend => {
                return ReceiveProgress::Pending
            }
        }
        let Some(transport) = self.transport.as_mut() else {
            return ReceiveProgress::Failed;
        };

        let mut received = Vec::new();
        let mut peer_closed = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match transport.read(&mut chunk) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // rustls reports a close without close_notify this way.
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    peer_closed = true;
                    break;
                }
                Err(e) => {
                    self.fail(TransferError::read(e));
                    return ReceiveProgress::Failed;
                }
            }
        }
        trace!(
            connection = self.id,
            bytes = received.len(),
            peer_closed,
            "read"
        );
        if received.is_empty() && !peer_closed {
            return ReceiveProgress::Pending;
        }

        let response = match self.parser.feed(&received, peer_closed) {
            Ok(Progress::Complete(response)) => response,
            Ok(Progress::NeedMore) if peer_closed => {
                self.fail(ParseError::Truncated.into());
                return ReceiveProgress::Failed;
            }
            Ok(Progress::NeedMore) => return ReceiveProgress::Pending,
            Err(err) => {
                self.fail(err.into());
                return ReceiveProgress::Failed;
            }
        };

        if let Some((id, callback)) = self.active.take() {
            debug!(
                connection = self.id,
                request = id,
                status = response.status,
                bytes = response.body.len(),
                "response complete"
            );
            self.outcomes.push(Outcome::Completed(id));
            callback(id, Some(response));
        }

        if self.queue.is_empty() {
            self.close();
        } else if peer_closed {
            self.fail(TransferError::Closed);
        } else {
            self.load_next();
        }
        ReceiveProgress::Completed
    }

    /// Fail the active and every queued request, then close. A no-op once
    /// closed.
    pub fn fail(&mut self, err: TransferError) {
        if self.is_closed() {
            return;
        }
        warn!(connection = self.id, error = %err, "connection failed");

        let mut pending: Vec<(RequestId, Callback)> = self.active.take().into_iter().collect();
        pending.extend(self.queue.drain(..).map(|r| (r.id, r.callback)));
        self.close();
        for (id, callback) in pending {
            self.outcomes.push(Outcome::Failed(id, err.clone()));
            callback(id, None);
        }
    }

    /// Release the transport and buffers. Requests still outstanding receive
    /// an absent response.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.active.is_some() || !self.queue.is_empty() {
            self.fail(TransferError::Closed);
            return;
        }
        debug!(connection = self.id, "closed");
        self.state = ConnectionState::Closed;
        self.transport = None;
        self.send_buffer = Vec::new();
        self.cursor = 0;
        self.parser = ResponseParser::new();
    }

    /// Events recorded since the last call.
    pub fn take_outcomes(&mut self) -> Vec<Outcome> {
        mem::take(&mut self.outcomes)
    }

    /// Make the next queued request active with fresh timers.
    fn load_next(&mut self) {
        let Some(next) = self.queue.pop_front() else {
            return;
        };
        self.send_buffer = next.bytes;
        self.cursor = 0;
        self.active = Some((next.id, next.callback));
        self.connect_waited = Duration::ZERO;
        self.read_waited = Duration::ZERO;
        if self.state == ConnectionState::AwaitingReceive {
            self.state = ConnectionState::AwaitingSend;
        }
    }
}
