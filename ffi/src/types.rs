//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Inputs (`FfiHeader` lists) are borrowed from the caller for the duration
//! of one call. Outputs handed to callbacks (`FfiHttpResponse`) are borrowed
//! from Rust for the duration of the callback only; `ResponseView` owns the
//! backing C strings while the pointer is live, so nothing crosses the
//! boundary that the caller must free.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use volley_core::{EngineError, HttpResponse};

/// Opaque handle to an `Engine`. C callers receive a pointer to this and pass
/// it back into every FFI function.
pub struct FfiEngine {
    pub(crate) inner: volley_core::Engine,
}

/// Completion callback. `response` is null when the transfer failed, and
/// points to memory that is only valid until the callback returns.
pub type FfiResponseCallback =
    extern "C" fn(user_data: *mut c_void, id: u64, response: *const FfiHttpResponse);

/// Called once per `volley_request` with the ids whose bytes were fully sent.
pub type FfiSentCallback = extern "C" fn(user_data: *mut c_void, ids: *const u64, ids_len: usize);

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// A single HTTP header as a pair of NUL-terminated strings.
#[repr(C)]
pub struct FfiHeader {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// Copy `len` caller headers. A null entry or a non-UTF-8 string yields
/// `None`.
///
/// # Safety
/// `headers` must be null or point to `len` valid `FfiHeader`s whose strings
/// are NUL-terminated.
pub(crate) unsafe fn read_headers(
    headers: *const FfiHeader,
    len: usize,
) -> Option<Vec<(String, String)>> {
    if headers.is_null() || len == 0 {
        return Some(Vec::new());
    }
    let headers = unsafe { std::slice::from_raw_parts(headers, len) };
    headers
        .iter()
        .map(|h| {
            let key = unsafe { read_str(h.key) }?;
            let value = unsafe { read_str(h.value) }?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// # Safety
/// `s` must be null or a NUL-terminated string that outlives the borrow.
pub(crate) unsafe fn read_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

// ---------------------------------------------------------------------------
// Response output
// ---------------------------------------------------------------------------

/// A parsed response exposed to C. The body is a byte buffer and may
/// contain NULs; every string field is NUL-terminated.
#[repr(C)]
pub struct FfiHttpResponse {
    pub status: u16,
    pub version: *const c_char,
    pub reason: *const c_char,
    pub headers: *const FfiHeader,
    pub headers_len: usize,
    pub body: *const u8,
    pub body_len: usize,
}

/// Owns the storage behind an `FfiHttpResponse` handed to a callback.
pub(crate) struct ResponseView {
    _strings: Vec<CString>,
    _headers: Vec<FfiHeader>,
    _body: Vec<u8>,
    raw: FfiHttpResponse,
}

impl ResponseView {
    pub(crate) fn new(resp: HttpResponse) -> Self {
        let mut strings = Vec::with_capacity(2 + 2 * resp.headers.len());
        let mut keep = |s: String| {
            let c = c_string(s);
            let ptr = c.as_ptr();
            strings.push(c);
            ptr
        };

        let version = keep(resp.version);
        let reason = keep(resp.reason);
        let headers: Vec<FfiHeader> = resp
            .headers
            .into_iter()
            .map(|(k, v)| FfiHeader {
                key: keep(k),
                value: keep(v),
            })
            .collect();

        let raw = FfiHttpResponse {
            status: resp.status,
            version,
            reason,
            headers: headers.as_ptr(),
            headers_len: headers.len(),
            body: resp.body.as_ptr(),
            body_len: resp.body.len(),
        };
        Self {
            _strings: strings,
            _headers: headers,
            _body: resp.body,
            raw,
        }
    }

    pub(crate) fn as_ptr(&self) -> *const FfiHttpResponse {
        &self.raw
    }
}

/// Interior NULs cannot be represented in a C string and are dropped.
fn c_string(s: String) -> CString {
    CString::new(s).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|&b| b != 0);
        CString::new(bytes).unwrap_or_default()
    })
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Negative codes returned by `volley_add_*` when registration fails.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    NullArg = -1,
    InvalidUrl = -2,
    UnresolvableHost = -3,
    InvalidBody = -4,
    InvalidHeader = -5,
    InvalidConfig = -6,
    Tls = -7,
    Io = -8,
    Panic = -9,
}

impl From<&EngineError> for FfiErrorCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::InvalidUrl { .. } => FfiErrorCode::InvalidUrl,
            EngineError::UnresolvableHost { .. } => FfiErrorCode::UnresolvableHost,
            EngineError::InvalidBody(_) => FfiErrorCode::InvalidBody,
            EngineError::InvalidHeader(_) => FfiErrorCode::InvalidHeader,
            EngineError::InvalidConfig(_) => FfiErrorCode::InvalidConfig,
            EngineError::Tls(_) => FfiErrorCode::Tls,
            EngineError::Io(_) => FfiErrorCode::Io,
        }
    }
}

impl FfiErrorCode {
    pub(crate) fn as_i64(self) -> i64 {
        self as i64
    }
}
