//! Asynchronous HTTP(S) client engine.
//!
//! # Overview
//! Callers register many requests, each with a completion callback, and then
//! drive them all from one thread with `Engine::request`. Sockets are
//! non-blocking and multiplexed through a single poller; responses are parsed
//! incrementally as bytes arrive.
//!
//! # Design
//! - `endpoint` and `encode` run at registration: a URL becomes a resolved
//!   `Endpoint` and the request becomes its exact wire bytes.
//! - `parser` is a pure state machine over byte fragments, independent of
//!   any socket.
//! - `connection` owns one transport and moves it through connect, send,
//!   receive and close, firing each request's callback exactly once.
//! - `engine` runs the readiness rounds and the cumulative timeout
//!   accounting. `transport` supplies the TCP and TLS streams it drives.
//! - `client` wraps an engine for callers that want one blocking request at
//!   a time.
//! - Registration errors are returned synchronously as `EngineError`;
//!   everything that goes wrong later reaches the callback as an absent
//!   response and is reported in the `Summary`.

pub mod client;
pub mod config;
pub mod connection;
pub mod encode;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod http;
pub mod parser;
pub mod transport;

pub use client::Client;
pub use config::EngineConfig;
pub use connection::Phase;
pub use encode::BodyFormat;
pub use endpoint::{Endpoint, HostLookup, Resolver, Scheme};
pub use engine::{Engine, Summary};
pub use error::{EngineError, ParseError, TransferError};
pub use http::{HttpMethod, HttpRequest, HttpResponse, RequestId};
pub use parser::{Progress, ResponseParser};
