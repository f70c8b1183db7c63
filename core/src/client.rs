//! Blocking one-request-at-a-time client.
//!
//! # Design
//! `Client` is a thin wrapper over a private `Engine`: each call registers a
//! single request, drives it with `Engine::request`, and hands back whatever
//! the completion callback received. A transfer failure is therefore
//! `Ok(None)`, exactly as an engine callback would see it, while registration
//! errors stay `Err`. The outcome of the latest call stays queryable through
//! `last_error` and `was_sent`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::endpoint::Resolver;
use crate::engine::{Engine, Summary};
use crate::error::{EngineError, TransferError};
use crate::http::{HttpRequest, HttpResponse, RequestId};

#[derive(Debug)]
pub struct Client {
    engine: Engine,
    last: Option<(RequestId, Summary)>,
}

impl Client {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self::from_engine(Engine::new(config)?))
    }

    /// Build a client that shares `resolver` and its cache.
    pub fn with_resolver(config: EngineConfig, resolver: Arc<Resolver>) -> Result<Self, EngineError> {
        Ok(Self::from_engine(Engine::with_resolver(config, resolver)?))
    }

    fn from_engine(engine: Engine) -> Self {
        Self { engine, last: None }
    }

    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// GET `url` and wait for the response.
    pub fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Option<HttpResponse>, EngineError> {
        self.send(HttpRequest::get(url).with_headers(headers))
    }

    /// POST `body` to `url` and wait for the response. `body` must serialize
    /// to a JSON object and is encoded according to the `Content-Type` header.
    pub fn post<B>(
        &mut self,
        url: &str,
        body: &B,
        headers: &[(&str, &str)],
    ) -> Result<Option<HttpResponse>, EngineError>
    where
        B: serde::Serialize + ?Sized,
    {
        self.send(HttpRequest::post(url).with_headers(headers).with_body(body)?)
    }

    /// Send one request and block until it completes or fails.
    pub fn send(&mut self, request: HttpRequest) -> Result<Option<HttpResponse>, EngineError> {
        self.last = None;
        let slot: Rc<RefCell<Option<HttpResponse>>> = Rc::default();
        let sink = Rc::clone(&slot);
        let id = self
            .engine
            .add(request, move |_, response| *sink.borrow_mut() = response)?;

        let summary = self.engine.request(None);
        self.last = Some((id, summary));
        let response = slot.borrow_mut().take();
        Ok(response)
    }

    /// Why the latest call produced no response.
    pub fn last_error(&self) -> Option<&TransferError> {
        self.last.as_ref().and_then(|(id, summary)| summary.error(*id))
    }

    /// Whether the latest call wrote its whole request before finishing.
    pub fn was_sent(&self) -> bool {
        self.last
            .as_ref()
            .is_some_and(|(id, summary)| summary.sent.contains(id))
    }
}
