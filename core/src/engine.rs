//! The driver loop.
//!
//! # Design
//! `Engine` owns every live connection, keyed by the same id it registers
//! with the poller. `request` drives them to completion on the calling
//! thread:
//!
//! 1. Send phase: rounds over every connection that still has bytes to write
//!    (or a connect to confirm), until none is left.
//! 2. Receive phase: the same over every connection awaiting a response.
//!
//! The two phases repeat while connections remain, which drives requests
//! queued behind one another on a reused connection.
//!
//! Each round arms the candidates, waits at most the smallest remaining
//! budget among them, and then charges the measured wait to every candidate,
//! ready or not. Connections whose cumulative wait meets the phase budget
//! are failed before any ready connection is dispatched. Waits are measured
//! in whole microseconds, rounded up, so a round never charges zero after a
//! real wait.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use polling::{Events, Poller};
use rustls::ClientConfig;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::connection::{
    Callback, Connection, ConnectionId, Outcome, PendingRequest, Phase, Transport,
};
use crate::encode::encode_request;
use crate::endpoint::Resolver;
use crate::error::{EngineError, TransferError};
use crate::http::{HttpRequest, HttpResponse, RequestId};
use crate::transport::{self, Stream};

/// What happened to the requests driven by one `Engine::request` call.
#[derive(Debug, Default, Clone)]
pub struct Summary {
    /// Ids whose request bytes were fully written, in the order they finished.
    pub sent: Vec<RequestId>,
    /// Ids whose callback received a response.
    pub completed: Vec<RequestId>,
    /// Ids whose callback received `None`, with the cause.
    pub failed: Vec<(RequestId, TransferError)>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error(&self, id: RequestId) -> Option<&TransferError> {
        self.failed
            .iter()
            .find(|(failed, _)| *failed == id)
            .map(|(_, err)| err)
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent(id) => self.sent.push(id),
            Outcome::Completed(id) => self.completed.push(id),
            Outcome::Failed(id, err) => self.failed.push((id, err)),
        }
    }
}

/// A request whose connect failed at registration time.
struct Deferred {
    id: RequestId,
    callback: Callback,
    error: TransferError,
}

/// Asynchronous HTTP(S) client engine.
///
/// Register requests with `add`, `add_get` or `add_post`, then call
/// `request` to drive them all. Each registered id receives exactly one
/// callback during the next `request` call.
pub struct Engine {
    config: EngineConfig,
    resolver: Arc<Resolver>,
    poller: Arc<Poller>,
    tls: Option<Arc<ClientConfig>>,
    connections: BTreeMap<ConnectionId, Connection<Stream>>,
    next_connection: ConnectionId,
    last_id: RequestId,
    deferred: Vec<Deferred>,
    events: Events,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .field("deferred", &self.deferred.len())
            .field("last_id", &self.last_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_resolver(config, Arc::new(Resolver::new()))
    }

    /// Build an engine that shares `resolver` and its cache.
    pub fn with_resolver(config: EngineConfig, resolver: Arc<Resolver>) -> Result<Self, EngineError> {
        Ok(Self {
            config,
            resolver,
            poller: Arc::new(Poller::new()?),
            tls: None,
            connections: BTreeMap::new(),
            next_connection: 0,
            last_id: 0,
            deferred: Vec::new(),
            events: Events::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Requests registered and not yet finished.
    pub fn pending(&self) -> usize {
        let queued: usize = self
            .connections
            .values()
            .map(|c| c.queued() + usize::from(c.active_request().is_some()))
            .sum();
        queued + self.deferred.len()
    }

    /// Register a GET request.
    pub fn add_get<F>(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        callback: F,
    ) -> Result<RequestId, EngineError>
    where
        F: FnOnce(RequestId, Option<HttpResponse>) + 'static,
    {
        self.add(HttpRequest::get(url).with_headers(headers), callback)
    }

    /// Register a POST request. `body` must serialize to a JSON object; it is
    /// encoded according to the `Content-Type` header.
    pub fn add_post<B, F>(
        &mut self,
        url: &str,
        body: &B,
        headers: &[(&str, &str)],
        callback: F,
    ) -> Result<RequestId, EngineError>
    where
        B: serde::Serialize + ?Sized,
        F: FnOnce(RequestId, Option<HttpResponse>) + 'static,
    {
        let request = HttpRequest::post(url).with_headers(headers).with_body(body)?;
        self.add(request, callback)
    }

    /// Resolve, encode and connect. Errors here are returned synchronously and
    /// no callback will fire for the request.
    pub fn add<F>(&mut self, request: HttpRequest, callback: F) -> Result<RequestId, EngineError>
    where
        F: FnOnce(RequestId, Option<HttpResponse>) + 'static,
    {
        let endpoint = self.resolver.resolve(&request.url)?;
        let bytes = encode_request(
            request.method,
            &endpoint,
            &request.headers,
            request.body.as_ref(),
        )?;
        let session = if endpoint.scheme.is_tls() {
            Some(transport::tls_session(self.tls_config()?, &endpoint.host)?)
        } else {
            None
        };

        let id = self.assign_id(request.id);
        let pending = PendingRequest::new(id, bytes, callback);
        let key = self.next_connection;
        self.next_connection += 1;

        let addr = endpoint.socket_addr();
        let stream = transport::connect(addr)
            .and_then(|tcp| Stream::new(tcp, session, self.poller.clone(), key));
        match stream {
            Ok(stream) => {
                debug!(
                    connection = key,
                    request = id,
                    method = request.method.as_str(),
                    %addr,
                    target = %endpoint.target,
                    tls = endpoint.scheme.is_tls(),
                    "connection opened"
                );
                let mut connection = Connection::new(key, stream);
                connection.enqueue(pending);
                self.connections.insert(key, connection);
            }
            Err(err) => {
                debug!(request = id, %addr, error = %err, "connect failed at registration");
                self.deferred.push(Deferred {
                    id,
                    callback: pending.callback,
                    error: TransferError::connect(err),
                });
            }
        }
        Ok(id)
    }

    /// Drive every registered request to completion or failure.
    ///
    /// `on_sent` is called once, just before returning, with the ids whose
    /// bytes were fully written.
    pub fn request(&mut self, on_sent: Option<Box<dyn FnOnce(&[RequestId]) + '_>>) -> Summary {
        let mut summary = Summary::default();

        for Deferred { id, callback, error } in self.deferred.drain(..) {
            warn!(request = id, error = %error, "request failed");
            callback(id, None);
            summary.failed.push((id, error));
        }

        while !self.connections.is_empty() {
            self.run_phase(Phase::Connect, &mut summary);
            self.run_phase(Phase::Read, &mut summary);
            self.reap(&mut summary);
        }

        debug!(
            sent = summary.sent.len(),
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "request round finished"
        );
        if let Some(on_sent) = on_sent {
            on_sent(&summary.sent);
        }
        summary
    }

    fn run_phase(&mut self, phase: Phase, summary: &mut Summary) {
        let budget = match phase {
            Phase::Connect => self.config.connect_timeout(),
            Phase::Read => self.config.read_timeout(),
        };

        loop {
            let candidates: Vec<ConnectionId> = self
                .connections
                .iter()
                .filter(|(_, c)| c.phase() == Some(phase))
                .map(|(key, _)| *key)
                .collect();
            if candidates.is_empty() {
                return;
            }
            self.round(phase, budget, &candidates);
            self.reap(summary);
        }
    }

    /// One wait over `candidates`: arm, wait, disarm, charge, dispatch.
    fn round(&mut self, phase: Phase, budget: Duration, candidates: &[ConnectionId]) {
        let mut armed = Vec::with_capacity(candidates.len());
        let mut wait = budget;
        for key in candidates {
            let Some(conn) = self.connections.get_mut(key) else {
                continue;
            };
            let watched = conn.transport().map(|stream| match phase {
                Phase::Connect if stream.wants_read() => stream.watch(true, false),
                Phase::Connect => stream.watch(false, true),
                Phase::Read => stream.watch(true, false),
            });
            match watched {
                Some(Ok(())) => {
                    wait = wait.min(conn.remaining(phase, budget));
                    armed.push(*key);
                }
                Some(Err(err)) => conn.fail(phase_error(phase, err)),
                None => {}
            }
        }
        if armed.is_empty() {
            return;
        }
        let candidates = &armed[..];

        self.events.clear();
        let started = Instant::now();
        let waited = self.poller.wait(&mut self.events, Some(wait));
        let elapsed = ceil_micros(started.elapsed());
        let ready: Vec<ConnectionId> = self.events.iter().map(|e| e.key).collect();
        trace!(%phase, candidates = candidates.len(), ready = ready.len(), ?wait, ?elapsed, "round");

        for key in candidates {
            if let Some(stream) = self.connections.get(key).and_then(|c| c.transport()) {
                if let Err(err) = stream.watch(false, false) {
                    trace!(connection = key, error = %err, "disarm failed");
                }
            }
        }

        if let Err(err) = waited {
            if err.kind() != ErrorKind::Interrupted {
                warn!(%phase, error = %err, "poller wait failed");
                let err = Arc::new(err);
                for key in candidates {
                    if let Some(conn) = self.connections.get_mut(key) {
                        conn.fail(match phase {
                            Phase::Connect => TransferError::Connect(err.clone()),
                            Phase::Read => TransferError::Read(err.clone()),
                        });
                    }
                }
                return;
            }
        }

        for key in candidates {
            if let Some(conn) = self.connections.get_mut(key) {
                if conn.charge(phase, elapsed, budget) {
                    debug!(connection = key, %phase, "timed out");
                }
            }
        }

        let mut dispatched = HashSet::new();
        for key in ready {
            if !dispatched.insert(key) {
                continue;
            }
            let Some(conn) = self.connections.get_mut(&key) else {
                continue;
            };
            if conn.phase() != Some(phase) {
                continue;
            }
            match phase {
                Phase::Connect => {
                    conn.attempt_send();
                }
                Phase::Read => {
                    conn.attempt_receive();
                }
            }
        }
    }

    /// Collect outcomes and drop connections that are closed or idle.
    fn reap(&mut self, summary: &mut Summary) {
        self.connections.retain(|_, conn| {
            if conn.phase().is_none() {
                conn.close();
            }
            for outcome in conn.take_outcomes() {
                summary.record(outcome);
            }
            !conn.is_closed()
        });
    }

    fn assign_id(&mut self, explicit: Option<RequestId>) -> RequestId {
        match explicit {
            Some(id) => {
                self.last_id = self.last_id.max(id);
                id
            }
            None => {
                self.last_id += 1;
                self.last_id
            }
        }
    }

    fn tls_config(&mut self) -> Result<Arc<ClientConfig>, EngineError> {
        if let Some(config) = &self.tls {
            return Ok(config.clone());
        }
        let config = transport::client_config(self.config.verify_certificate)?;
        self.tls = Some(config.clone());
        Ok(config)
    }
}

fn phase_error(phase: Phase, err: io::Error) -> TransferError {
    match phase {
        Phase::Connect => TransferError::connect(err),
        Phase::Read => TransferError::read(err),
    }
}

/// Round a wait up to whole microseconds.
fn ceil_micros(elapsed: Duration) -> Duration {
    let micros = elapsed.as_nanos().div_ceil(1_000);
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}
