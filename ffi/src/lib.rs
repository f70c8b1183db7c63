//! C-ABI wrapper around `volley-core`.
//!
//! # Overview
//! Lets any language with a C FFI register HTTP requests with completion
//! callbacks and drive them to completion with one blocking call, without
//! seeing Rust types.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Registration returns the request id, or a negative `FfiErrorCode`.
//! - Responses are lent to the completion callback and reclaimed when it
//!   returns; the only pointer the caller owns is the engine handle, released
//!   with `volley_engine_free`.
//! - `user_data` is passed through untouched and never dereferenced here.

pub mod types;

use std::ffi::c_void;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;
use volley_core::{Engine, EngineConfig, EngineError, HttpRequest, HttpResponse, RequestId};

use types::*;

// ---------------------------------------------------------------------------
// Engine lifecycle
// ---------------------------------------------------------------------------

/// Create an engine. Timeouts are cumulative per phase, in milliseconds.
///
/// Returns null if the engine cannot be created or an internal panic occurs.
/// The caller must free the returned pointer with `volley_engine_free`.
#[unsafe(no_mangle)]
pub extern "C" fn volley_engine_new(
    verify_certificate: bool,
    connect_timeout_ms: u64,
    read_timeout_ms: u64,
) -> *mut FfiEngine {
    catch_unwind(|| {
        let config = EngineConfig::new(verify_certificate, connect_timeout_ms, read_timeout_ms);
        match Engine::new(config) {
            Ok(inner) => Box::into_raw(Box::new(FfiEngine { inner })),
            Err(e) => {
                warn!(error = %e, "engine creation failed");
                std::ptr::null_mut()
            }
        }
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free an engine created by `volley_engine_new`. Safe to call with null.
///
/// Requests still registered are dropped without their callbacks firing.
#[unsafe(no_mangle)]
pub extern "C" fn volley_engine_free(engine: *mut FfiEngine) {
    if !engine.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(engine) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register a GET request.
///
/// `headers` may be null when `headers_len` is 0. Returns the request id, or
/// a negative `FfiErrorCode`; on error `callback` will never be called.
#[unsafe(no_mangle)]
pub extern "C" fn volley_add_get(
    engine: *mut FfiEngine,
    url: *const c_char,
    headers: *const FfiHeader,
    headers_len: usize,
    callback: Option<FfiResponseCallback>,
    user_data: *mut c_void,
) -> i64 {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(url) = (unsafe { read_str(url) }) else {
            return FfiErrorCode::NullArg.as_i64();
        };
        let Some(headers) = (unsafe { read_headers(headers, headers_len) }) else {
            return FfiErrorCode::InvalidHeader.as_i64();
        };
        let mut request = HttpRequest::get(url);
        request.headers = headers;
        register(engine, request, callback, user_data)
    }))
    .unwrap_or(FfiErrorCode::Panic.as_i64())
}

/// Register a POST request. `body_json` must be null or a JSON object; it is
/// encoded according to the `Content-Type` header (form by default).
///
/// Returns the request id, or a negative `FfiErrorCode`.
#[unsafe(no_mangle)]
pub extern "C" fn volley_add_post(
    engine: *mut FfiEngine,
    url: *const c_char,
    body_json: *const c_char,
    headers: *const FfiHeader,
    headers_len: usize,
    callback: Option<FfiResponseCallback>,
    user_data: *mut c_void,
) -> i64 {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(url) = (unsafe { read_str(url) }) else {
            return FfiErrorCode::NullArg.as_i64();
        };
        let Some(headers) = (unsafe { read_headers(headers, headers_len) }) else {
            return FfiErrorCode::InvalidHeader.as_i64();
        };
        let mut request = HttpRequest::post(url);
        request.headers = headers;

        if !body_json.is_null() {
            let body = unsafe { read_str(body_json) }
                .ok_or_else(|| EngineError::InvalidBody("body is not UTF-8".to_string()))
                .and_then(|raw| {
                    serde_json::from_str::<serde_json::Value>(raw)
                        .map_err(|e| EngineError::InvalidBody(e.to_string()))
                });
            request = match body.and_then(|value| request.with_body(&value)) {
                Ok(request) => request,
                Err(e) => return rejected(&e),
            };
        }
        register(engine, request, callback, user_data)
    }))
    .unwrap_or(FfiErrorCode::Panic.as_i64())
}

fn register(
    engine: *mut FfiEngine,
    request: HttpRequest,
    callback: Option<FfiResponseCallback>,
    user_data: *mut c_void,
) -> i64 {
    if engine.is_null() {
        return FfiErrorCode::NullArg.as_i64();
    }
    let Some(callback) = callback else {
        return FfiErrorCode::NullArg.as_i64();
    };
    let engine = unsafe { &mut *engine };

    let result = engine.inner.add(request, move |id, response: Option<HttpResponse>| {
        match response {
            Some(response) => {
                let view = ResponseView::new(response);
                callback(user_data, id, view.as_ptr());
            }
            None => callback(user_data, id, std::ptr::null()),
        }
    });
    match result {
        Ok(id) => i64::try_from(id).unwrap_or(i64::MAX),
        Err(e) => rejected(&e),
    }
}

fn rejected(err: &EngineError) -> i64 {
    warn!(error = %err, "request rejected");
    FfiErrorCode::from(err).as_i64()
}

// ---------------------------------------------------------------------------
// Driving
// ---------------------------------------------------------------------------

/// Drive every registered request until each has completed or failed.
///
/// `sent_callback` may be null; otherwise it is called once, before this
/// function returns, with the ids whose bytes were fully written. Returns the
/// number of requests that failed, or a negative `FfiErrorCode`.
#[unsafe(no_mangle)]
pub extern "C" fn volley_request(
    engine: *mut FfiEngine,
    sent_callback: Option<FfiSentCallback>,
    user_data: *mut c_void,
) -> i64 {
    if engine.is_null() {
        return FfiErrorCode::NullArg.as_i64();
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &mut *engine };
        let on_sent = sent_callback.map(|sent| {
            Box::new(move |ids: &[RequestId]| sent(user_data, ids.as_ptr(), ids.len()))
                as Box<dyn FnOnce(&[RequestId])>
        });
        let summary = engine.inner.request(on_sent);
        i64::try_from(summary.failed.len()).unwrap_or(i64::MAX)
    }))
    .unwrap_or(FfiErrorCode::Panic.as_i64())
}

/// Number of requests registered but not yet completed. Null yields 0.
#[unsafe(no_mangle)]
pub extern "C" fn volley_pending(engine: *const FfiEngine) -> usize {
    if engine.is_null() {
        return 0;
    }
    catch_unwind(AssertUnwindSafe(|| unsafe { &*engine }.inner.pending())).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{CStr, CString};
    use std::net::SocketAddr;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Seen {
        responses: Vec<(u64, Option<(u16, String, Vec<u8>)>)>,
        sent: Vec<u64>,
    }

    extern "C" fn record(user_data: *mut c_void, id: u64, response: *const FfiHttpResponse) {
        let seen = unsafe { &mut *(user_data as *mut Seen) };
        let entry = if response.is_null() {
            None
        } else {
            let r = unsafe { &*response };
            let reason = unsafe { CStr::from_ptr(r.reason) }.to_str().unwrap().to_string();
            let body = unsafe { std::slice::from_raw_parts(r.body, r.body_len) }.to_vec();
            Some((r.status, reason, body))
        };
        seen.responses.push((id, entry));
    }

    extern "C" fn record_sent(user_data: *mut c_void, ids: *const u64, len: usize) {
        let seen = unsafe { &mut *(user_data as *mut Seen) };
        seen.sent = unsafe { std::slice::from_raw_parts(ids, len) }.to_vec();
    }

    fn mock_server() -> SocketAddr {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                mock_server::run(listener).await.unwrap();
            });
        });
        rx.recv().unwrap()
    }

    fn engine() -> *mut FfiEngine {
        let engine = volley_engine_new(false, 2_000, 2_000);
        assert!(!engine.is_null());
        engine
    }

    #[test]
    fn engine_new_and_free() {
        volley_engine_free(engine());
    }

    #[test]
    fn free_null_is_safe() {
        volley_engine_free(std::ptr::null_mut());
    }

    #[test]
    fn null_arguments_are_rejected() {
        let e = engine();
        let url = CString::new("http://127.0.0.1:1/").unwrap();
        let data = std::ptr::null_mut();

        let code = volley_add_get(e, std::ptr::null(), std::ptr::null(), 0, Some(record), data);
        assert_eq!(code, FfiErrorCode::NullArg as i64);
        let code = volley_add_get(e, url.as_ptr(), std::ptr::null(), 0, None, data);
        assert_eq!(code, FfiErrorCode::NullArg as i64);
        let code = volley_add_get(
            std::ptr::null_mut(),
            url.as_ptr(),
            std::ptr::null(),
            0,
            Some(record),
            data,
        );
        assert_eq!(code, FfiErrorCode::NullArg as i64);
        assert_eq!(volley_request(std::ptr::null_mut(), None, data), FfiErrorCode::NullArg as i64);
        assert_eq!(volley_pending(std::ptr::null()), 0);

        volley_engine_free(e);
    }

    #[test]
    fn registration_errors_map_to_codes() {
        let e = engine();
        let data = std::ptr::null_mut();

        let url = CString::new("ftp://example.com/").unwrap();
        let code = volley_add_get(e, url.as_ptr(), std::ptr::null(), 0, Some(record), data);
        assert_eq!(code, FfiErrorCode::InvalidUrl as i64);

        let url = CString::new("http://127.0.0.1:1/").unwrap();
        let body = CString::new("[1, 2]").unwrap();
        let code = volley_add_post(
            e,
            url.as_ptr(),
            body.as_ptr(),
            std::ptr::null(),
            0,
            Some(record),
            data,
        );
        assert_eq!(code, FfiErrorCode::InvalidBody as i64);

        let body = CString::new("{not json").unwrap();
        let code = volley_add_post(
            e,
            url.as_ptr(),
            body.as_ptr(),
            std::ptr::null(),
            0,
            Some(record),
            data,
        );
        assert_eq!(code, FfiErrorCode::InvalidBody as i64);

        let key = CString::new("Bad Name").unwrap();
        let value = CString::new("x").unwrap();
        let header = FfiHeader {
            key: key.as_ptr(),
            value: value.as_ptr(),
        };
        let code = volley_add_get(e, url.as_ptr(), &header, 1, Some(record), data);
        assert_eq!(code, FfiErrorCode::InvalidHeader as i64);

        assert_eq!(volley_pending(e), 0);
        volley_engine_free(e);
    }

    #[test]
    fn get_and_post_round_trip() {
        let addr = mock_server();
        let e = engine();
        let mut seen = Seen::default();
        let data = &mut seen as *mut Seen as *mut c_void;

        let hello = CString::new(format!("http://{addr}/hello")).unwrap();
        let get_id = volley_add_get(e, hello.as_ptr(), std::ptr::null(), 0, Some(record), data);
        assert!(get_id > 0);

        let echo = CString::new(format!("http://{addr}/echo")).unwrap();
        let body = CString::new(r#"{"a":1,"b":2}"#).unwrap();
        let key = CString::new("Content-Type").unwrap();
        let value = CString::new("application/json").unwrap();
        let header = FfiHeader {
            key: key.as_ptr(),
            value: value.as_ptr(),
        };
        let post_id = volley_add_post(e, echo.as_ptr(), body.as_ptr(), &header, 1, Some(record), data);
        assert!(post_id > get_id);
        assert_eq!(volley_pending(e), 2);

        let failed = volley_request(e, Some(record_sent), data);
        assert_eq!(failed, 0);
        assert_eq!(volley_pending(e), 0);

        let mut sent = seen.sent.clone();
        sent.sort_unstable();
        assert_eq!(sent, vec![get_id as u64, post_id as u64]);
        assert_eq!(seen.responses.len(), 2);

        let (_, get) = seen.responses.iter().find(|(id, _)| *id == get_id as u64).unwrap();
        let (status, reason, body) = get.as_ref().unwrap();
        assert_eq!(*status, 200);
        assert_eq!(reason, "OK");
        assert_eq!(body, b"hello");

        let (_, post) = seen.responses.iter().find(|(id, _)| *id == post_id as u64).unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(&post.as_ref().unwrap().2).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["body"], r#"{"a":1,"b":2}"#);

        volley_engine_free(e);
    }

    #[test]
    fn refused_connection_yields_null_response() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let e = engine();
        let mut seen = Seen::default();
        let data = &mut seen as *mut Seen as *mut c_void;

        let url = CString::new(format!("http://127.0.0.1:{port}/")).unwrap();
        let id = volley_add_get(e, url.as_ptr(), std::ptr::null(), 0, Some(record), data);
        assert!(id > 0);

        assert_eq!(volley_request(e, None, data), 1);
        assert_eq!(seen.responses, vec![(id as u64, None)]);

        volley_engine_free(e);
    }

    #[test]
    fn header_is_generated_outside_the_source_tree() {
        let path = option_env!("VOLLEY_HEADER").expect("build script did not generate volley.h");
        assert!(path.starts_with(env!("OUT_DIR")));
        let header = std::fs::read_to_string(path).unwrap();
        assert!(header.contains("VOLLEY_H"));
        for symbol in ["volley_engine_new", "volley_add_get", "volley_add_post", "volley_request"] {
            assert!(header.contains(symbol), "volley.h lacks {symbol}");
        }
    }
}
