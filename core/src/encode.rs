//! Request serialization.
//!
//! # Design
//! `encode_request` produces the exact bytes written to the socket: request
//! line, header block and body. `Host`, `Connection`, `Content-Type` and
//! `Content-Length` are always written by the encoder; caller headers with
//! those names are dropped. The body format is picked from the caller's
//! `Content-Type` through `BodyFormat`, falling back to form encoding.

use std::fmt::Write as _;

use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::endpoint::Endpoint;
use crate::error::EngineError;
use crate::http::HttpMethod;

const ENGINE_HEADERS: [&str; 4] = ["host", "connection", "content-length", "content-type"];

const USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));

/// Sent unless the caller supplies a header of the same name.
const DEFAULT_HEADERS: [(&str, &str); 4] = [
    ("Cache-Control", "no-cache"),
    ("Pragma", "no-cache"),
    ("Accept", "*/*"),
    ("User-Agent", USER_AGENT),
];

/// Encoding applied to a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    #[default]
    Form,
    Json,
    Xml,
}

impl BodyFormat {
    /// Match a `Content-Type` value on its media type, ignoring parameters and case.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let media = value.split(';').next().unwrap_or("").trim();
        if media.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            Some(BodyFormat::Form)
        } else if media.eq_ignore_ascii_case("application/json") {
            Some(BodyFormat::Json)
        } else if media.eq_ignore_ascii_case("application/xml") {
            Some(BodyFormat::Xml)
        } else {
            None
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            BodyFormat::Form => "application/x-www-form-urlencoded",
            BodyFormat::Json => "application/json",
            BodyFormat::Xml => "application/xml",
        }
    }

    pub fn encode(self, body: &Map<String, Value>) -> Vec<u8> {
        match self {
            BodyFormat::Form => encode_form(body).into_bytes(),
            BodyFormat::Json => Value::Object(body.clone()).to_string().into_bytes(),
            BodyFormat::Xml => encode_xml(body).into_bytes(),
        }
    }
}

/// Serialize a request into wire bytes.
///
/// Bodies are only encoded for methods that carry one; a body given to a GET
/// or DELETE is ignored.
pub fn encode_request(
    method: HttpMethod,
    endpoint: &Endpoint,
    headers: &[(String, String)],
    body: Option<&Map<String, Value>>,
) -> Result<Vec<u8>, EngineError> {
    for (name, value) in headers {
        validate_header(name, value)?;
    }

    let mut head = String::with_capacity(256);
    let _ = write!(head, "{} {} HTTP/1.1\r\n", method.as_str(), endpoint.target);
    let _ = write!(head, "Host: {}\r\n", endpoint.host_header());
    head.push_str("Connection: keep-alive\r\n");

    let payload = if method.carries_body() {
        let format = find_header(headers, "content-type")
            .and_then(BodyFormat::from_content_type)
            .unwrap_or_default();
        let payload = body.map(|b| format.encode(b)).unwrap_or_default();
        let _ = write!(head, "Content-Type: {}\r\n", format.mime());
        let _ = write!(head, "Content-Length: {}\r\n", payload.len());
        payload
    } else {
        Vec::new()
    };

    for (name, value) in headers {
        if ENGINE_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }
    for (name, value) in DEFAULT_HEADERS {
        if find_header(headers, name).is_some() {
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Last value of a header, matched case-insensitively.
fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .rev()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn validate_header(name: &str, value: &str) -> Result<(), EngineError> {
    let bad_name = name.is_empty()
        || name
            .bytes()
            .any(|b| b <= b' ' || b == b':' || b == 0x7f);
    let bad_value = value.bytes().any(|b| b == b'\r' || b == b'\n');
    if bad_name || bad_value {
        return Err(EngineError::InvalidHeader(name.to_string()));
    }
    Ok(())
}

fn encode_form(body: &Map<String, Value>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in body {
        append_form_pairs(&mut serializer, key, value);
    }
    serializer.finish()
}

/// Nested values flatten into bracketed keys: `a[b]=1`, `list[0]=x`.
fn append_form_pairs(serializer: &mut form_urlencoded::Serializer<'_, String>, key: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => {
            serializer.append_pair(key, if *b { "1" } else { "0" });
        }
        Value::Number(n) => {
            serializer.append_pair(key, &n.to_string());
        }
        Value::String(s) => {
            serializer.append_pair(key, s);
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                append_form_pairs(serializer, &format!("{key}[{index}]"), item);
            }
        }
        Value::Object(map) => {
            for (sub, item) in map {
                append_form_pairs(serializer, &format!("{key}[{sub}]"), item);
            }
        }
    }
}

fn encode_xml(body: &Map<String, Value>) -> String {
    let mut out = String::from("<xml>");
    for (key, value) in body {
        write_xml_element(&mut out, key, value);
    }
    out.push_str("</xml>");
    out
}

fn write_xml_element(out: &mut String, tag: &str, value: &Value) {
    let _ = write!(out, "<{tag}>");
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push_str(if *b { "1" } else { "0" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => escape_xml(out, s),
        Value::Array(items) => {
            for item in items {
                write_xml_element(out, "item", item);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                write_xml_element(out, key, item);
            }
        }
    }
    let _ = write!(out, "</{tag}>");
}

fn escape_xml(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Scheme;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(scheme: Scheme, port: u16, target: &str) -> Endpoint {
        Endpoint {
            scheme,
            host: "example.com".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            target: target.to_string(),
        }
    }

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn get_request_layout() {
        let ep = endpoint(Scheme::Http, 80, "/search?q=rust");
        let raw = text(encode_request(HttpMethod::Get, &ep, &[], None).unwrap());
        assert_eq!(
            raw,
            format!(
                "GET /search?q=rust HTTP/1.1\r\n\
                 Host: example.com\r\n\
                 Connection: keep-alive\r\n\
                 Cache-Control: no-cache\r\n\
                 Pragma: no-cache\r\n\
                 Accept: */*\r\n\
                 User-Agent: {USER_AGENT}\r\n\r\n"
            )
        );
    }

    #[test]
    fn host_carries_non_default_port() {
        let ep = endpoint(Scheme::Https, 8443, "/");
        let raw = text(encode_request(HttpMethod::Get, &ep, &[], None).unwrap());
        assert!(raw.contains("\r\nHost: example.com:8443\r\n"));
    }

    #[test]
    fn post_defaults_to_form_encoding() {
        let ep = endpoint(Scheme::Http, 80, "/submit");
        let body = object(json!({"a": 1, "b": 2}));
        let raw = text(encode_request(HttpMethod::Post, &ep, &[], Some(&body)).unwrap());
        assert!(raw.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(raw.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(raw.contains("Content-Length: 7\r\n"));
        assert!(raw.ends_with("\r\n\r\na=1&b=2"));
    }

    #[test]
    fn post_without_body_sends_zero_length() {
        let ep = endpoint(Scheme::Http, 80, "/");
        let raw = text(encode_request(HttpMethod::Post, &ep, &[], None).unwrap());
        assert!(raw.contains("Content-Length: 0\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn engine_headers_cannot_be_overridden() {
        let ep = endpoint(Scheme::Http, 80, "/");
        let caller = headers(&[
            ("host", "evil.test"),
            ("Connection", "close"),
            ("Content-Length", "999"),
            ("X-Trace", "abc"),
        ]);
        let raw = text(encode_request(HttpMethod::Get, &ep, &caller, None).unwrap());
        assert!(raw.contains("Host: example.com\r\n"));
        assert!(!raw.contains("evil.test"));
        assert!(!raw.contains("close"));
        assert!(!raw.contains("999"));
        assert!(raw.contains("X-Trace: abc\r\n"));
    }

    #[test]
    fn caller_headers_replace_defaults() {
        let ep = endpoint(Scheme::Http, 80, "/");
        let caller = headers(&[("accept", "text/html")]);
        let raw = text(encode_request(HttpMethod::Get, &ep, &caller, None).unwrap());
        assert!(raw.contains("accept: text/html\r\n"));
        assert!(!raw.contains("Accept: */*"));
        assert!(raw.contains("Pragma: no-cache\r\n"));
    }

    #[test]
    fn json_selected_by_content_type() {
        let ep = endpoint(Scheme::Http, 80, "/api");
        let body = object(json!({"name": "volley", "tags": ["a", "b"]}));
        let caller = headers(&[("Content-Type", "Application/JSON; charset=utf-8")]);
        let raw = text(encode_request(HttpMethod::Post, &ep, &caller, Some(&body)).unwrap());
        let payload = r#"{"name":"volley","tags":["a","b"]}"#;
        assert!(raw.contains("Content-Type: application/json\r\n"));
        assert!(raw.contains(&format!("Content-Length: {}\r\n", payload.len())));
        assert!(raw.ends_with(payload));
    }

    #[test]
    fn unknown_content_type_falls_back_to_form() {
        let ep = endpoint(Scheme::Http, 80, "/");
        let body = object(json!({"k": "v"}));
        let caller = headers(&[("Content-Type", "text/csv")]);
        let raw = text(encode_request(HttpMethod::Post, &ep, &caller, Some(&body)).unwrap());
        assert!(raw.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(!raw.contains("text/csv"));
        assert!(raw.ends_with("k=v"));
    }

    #[test]
    fn form_nests_with_brackets() {
        let body = object(json!({
            "user": {"name": "ada lovelace", "admin": true},
            "ids": [3, 4],
            "skip": null
        }));
        assert_eq!(
            encode_form(&body),
            "user%5Bname%5D=ada+lovelace&user%5Badmin%5D=1&ids%5B0%5D=3&ids%5B1%5D=4"
        );
    }

    #[test]
    fn xml_recurses_into_maps_and_sequences() {
        let body = object(json!({
            "order": {"id": 7, "items": ["tea", "milk & honey"]},
            "note": "<fast>"
        }));
        assert_eq!(
            encode_xml(&body),
            "<xml><order><id>7</id><items><item>tea</item><item>milk &amp; honey</item></items></order>\
             <note>&lt;fast&gt;</note></xml>"
        );
    }

    #[test]
    fn get_ignores_body() {
        let ep = endpoint(Scheme::Http, 80, "/");
        let body = object(json!({"a": 1}));
        let raw = text(encode_request(HttpMethod::Get, &ep, &[], Some(&body)).unwrap());
        assert!(!raw.contains("Content-Length"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn rejects_header_injection() {
        let ep = endpoint(Scheme::Http, 80, "/");
        let caller = headers(&[("X-Bad", "a\r\nInjected: yes")]);
        let err = encode_request(HttpMethod::Get, &ep, &caller, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidHeader(name) if name == "X-Bad"));

        let caller = headers(&[("Bad Name", "v")]);
        assert!(encode_request(HttpMethod::Get, &ep, &caller, None).is_err());
    }

    #[test]
    fn content_type_matching() {
        assert_eq!(
            BodyFormat::from_content_type("application/xml"),
            Some(BodyFormat::Xml)
        );
        assert_eq!(
            BodyFormat::from_content_type(" application/x-www-form-urlencoded ;q=1"),
            Some(BodyFormat::Form)
        );
        assert_eq!(BodyFormat::from_content_type("text/plain"), None);
    }
}
