//! HTTP value types shared by the encoder, the parser and the engine.
//!
//! # Design
//! Requests and responses are plain data. An `HttpRequest` is what a caller
//! registers with the engine; it carries no socket and no callback, so it can
//! be built, inspected and cloned freely. An `HttpResponse` is the immutable
//! value handed to a completion callback; the engine keeps nothing after the
//! handoff.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Identifier of a registered request, unique within one `Engine`.
pub type RequestId = u64;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Methods whose requests carry an encoded body and a `Content-Length`.
    pub fn carries_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

/// A request registration described as plain data.
///
/// `body` is a JSON object; the encoder turns it into form, JSON or XML bytes
/// depending on the `Content-Type` header.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub id: Option<RequestId>,
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Map<String, Value>>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: &str) -> Self {
        Self {
            id: None,
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: &str) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn delete(url: &str) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Use a caller-chosen id instead of the engine's counter.
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_headers(mut self, headers: &[(&str, &str)]) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    /// Attach a body. It must serialize to a JSON object.
    pub fn with_body<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, EngineError> {
        let value =
            serde_json::to_value(body).map_err(|e| EngineError::InvalidBody(e.to_string()))?;
        match value {
            Value::Object(map) => {
                self.body = Some(map);
                Ok(self)
            }
            Value::Null => {
                self.body = None;
                Ok(self)
            }
            other => Err(EngineError::InvalidBody(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A parsed HTTP response.
///
/// Header keys keep the spelling the server sent. When a server repeats a
/// header the last occurrence wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Look up a header by name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.headers.get(name) {
            return Some(value.as_str());
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The body decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_body_accepts_objects() {
        let req = HttpRequest::post("http://localhost/")
            .with_body(&json!({"a": 1, "b": 2}))
            .unwrap();
        let body = req.body.unwrap();
        assert_eq!(body["a"], 1);
        assert_eq!(body["b"], 2);
    }

    #[test]
    fn with_body_rejects_scalars() {
        let err = HttpRequest::post("http://localhost/")
            .with_body(&json!([1, 2]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBody(_)));
    }

    #[test]
    fn with_body_accepts_structs() {
        #[derive(Serialize)]
        struct Login<'a> {
            user: &'a str,
            remember: bool,
        }
        let req = HttpRequest::post("http://localhost/")
            .with_body(&Login { user: "ada", remember: true })
            .unwrap();
        assert_eq!(req.body.unwrap()["user"], "ada");
    }

    #[test]
    fn header_lookup_ignores_case() {
        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), "5".to_string());
        let resp = HttpResponse {
            version: "HTTP/1.1".to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers,
            body: b"hello".to_vec(),
        };
        assert_eq!(resp.header("Content-Length"), Some("5"));
        assert_eq!(resp.header("content-length"), Some("5"));
        assert_eq!(resp.header("X-Missing"), None);
        assert_eq!(resp.text(), "hello");
    }

    #[test]
    fn only_post_and_put_carry_bodies() {
        assert!(HttpMethod::Post.carries_body());
        assert!(HttpMethod::Put.carries_body());
        assert!(!HttpMethod::Get.carries_body());
        assert!(!HttpMethod::Delete.carries_body());
    }
}
