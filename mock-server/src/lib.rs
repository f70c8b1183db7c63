//! Fixture HTTP server for exercising the engine over real sockets.
//!
//! Two servers live here. `app` is an axum router whose responses cover the
//! framings a well-behaved server produces: fixed length, chunked, bodiless
//! statuses, and slow replies. `raw::serve` is a scripted TCP responder for
//! what axum will not emit, such as close-delimited bodies, ambiguous
//! keep-alive framing or a server that never answers.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::Path,
    http::{HeaderMap, Method, StatusCode},
    routing::{any, get},
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::debug;

pub mod raw;

/// Pieces of the `/chunked` body, each sent as its own chunk.
pub const CHUNKS: &[&str] = &["alpha ", "beta ", "gamma"];

const CHUNK_PAUSE: Duration = Duration::from_millis(5);

/// What `/echo` saw of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub method: String,
    /// Lowercased header names. A repeated header keeps its last value.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

pub fn app() -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/json", get(json))
        .route("/chunked", get(chunked))
        .route("/echo", any(echo))
        .route("/status/{code}", get(status))
        .route("/slow/{ms}", get(slow))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn hello() -> &'static str {
    "hello"
}

async fn json() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "hello", "items": [1, 2, 3] }))
}

async fn chunked() -> Body {
    let chunks = stream::iter(CHUNKS.iter().copied()).then(|chunk| async move {
        tokio::time::sleep(CHUNK_PAUSE).await;
        Ok::<_, Infallible>(chunk)
    });
    Body::from_stream(chunks)
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let echo = Echo {
        method: method.to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    debug!(method = %echo.method, bytes = body.len(), "echo");
    Json(echo)
}

async fn status(Path(code): Path<u16>) -> (StatusCode, String) {
    match StatusCode::from_u16(code) {
        Ok(status) => (status, format!("status {code}")),
        Err(_) => (StatusCode::BAD_REQUEST, format!("bad status {code}")),
    }
}

async fn slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "slow"
}
