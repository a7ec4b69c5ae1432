//! API Client Seam
//!
//! The engine talks to the remote store through two narrow traits: a pooled
//! request/response channel (`ApiClient`) and raw ranged reads from content
//! hosts (`ContentHost`). The implementations live in the transport layer;
//! the engine only assumes the calling conventions below.
//!
//! Call results are JSON-shaped values. Every response carries a numeric
//! `result` field; zero means success and anything else is surfaced as
//! [`ApiError::Server`] with the server-supplied message attached.

use serde_json::Value;
use thiserror::Error;

/// API layer errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection could not be established or died mid-call
    #[error("Cannot connect to server: {0}")]
    Transport(String),

    /// The server answered with a non-zero result code
    #[error("API error {code}: {message}")]
    Server {
        /// Numeric result code from the response
        code: u64,
        /// Server-supplied error message
        message: String,
    },

    /// The response did not have the expected shape
    #[error("Malformed server response: {0}")]
    Protocol(String),
}

impl ApiError {
    /// Whether retrying the call on a fresh connection can help
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }

    /// Server result code, if the server produced one
    pub fn server_code(&self) -> Option<u64> {
        match self {
            ApiError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// A single call parameter
#[derive(Debug, Clone)]
pub enum ApiParam {
    /// String parameter
    Str(&'static str, String),
    /// Unsigned numeric parameter
    Num(&'static str, u64),
    /// Boolean parameter
    Bool(&'static str, bool),
}

impl ApiParam {
    /// Parameter name
    pub fn name(&self) -> &'static str {
        match self {
            ApiParam::Str(n, _) | ApiParam::Num(n, _) | ApiParam::Bool(n, _) => n,
        }
    }
}

/// Pooled request/response channel to the API servers.
///
/// Implementations own connection pooling, authentication and the
/// good/bad release discipline; a call either completes on a healthy
/// connection or returns [`ApiError::Transport`]. Retry policy belongs to
/// the caller.
pub trait ApiClient: Send + Sync {
    /// Run one command and return the parsed response body.
    ///
    /// A non-zero `result` field must be turned into [`ApiError::Server`]
    /// with the `error` message from the response.
    fn call(&self, command: &str, params: &[ApiParam]) -> ApiResult<Value>;

    /// Stream `count` bytes of a file version over the API channel
    /// (the `readfile` pipeline, used when no content host is reachable).
    fn read_file(&self, file_id: u64, hash: u64, offset: u64, count: u64) -> ApiResult<Vec<u8>>;
}

/// Raw ranged reads from a content host.
pub trait ContentHost: Send + Sync {
    /// Fetch `length` bytes at `offset` of `path` from `host`.
    ///
    /// Stale links surface as [`ApiError::Server`] with code 404 or 410;
    /// the caller reacts by invalidating the URL bundle.
    fn fetch_range(&self, host: &str, path: &str, offset: u64, length: u64) -> ApiResult<Vec<u8>>;
}

/// Content-host address set for one file version, from `getfilelink`
#[derive(Debug, Clone)]
pub struct UrlBundle {
    /// Equivalent content hosts, preferred first
    pub hosts: Vec<String>,
    /// Request path valid on each host
    pub path: String,
    /// Expiry as a unix timestamp
    pub expires: i64,
}

impl UrlBundle {
    /// Parse a `getfilelink` response body
    pub fn from_response(value: &Value) -> ApiResult<Self> {
        let hosts = value
            .get("hosts")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Protocol("getfilelink response without hosts".into()))?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if hosts.is_empty() {
            return Err(ApiError::Protocol("getfilelink returned no usable host".into()));
        }
        let path = value
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Protocol("getfilelink response without path".into()))?
            .to_owned();
        let expires = value.get("expires").and_then(Value::as_i64).unwrap_or(0);
        Ok(Self { hosts, path, expires })
    }
}

/// Extract a required numeric field from a response body
pub fn response_num(value: &Value, field: &str) -> ApiResult<u64> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| ApiError::Protocol(format!("response missing numeric field {field}")))
}

/// Extract a required string field from a response body
pub fn response_str<'a>(value: &'a Value, field: &str) -> ApiResult<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Protocol(format!("response missing string field {field}")))
}

/// Run `call` with up to five retries on transport failures.
///
/// Server-side errors are never retried; the pool already rotated the
/// connection underneath us on each transport failure.
pub fn call_with_retry(api: &dyn ApiClient, command: &str, params: &[ApiParam]) -> ApiResult<Value> {
    let mut tries = 0;
    loop {
        match api.call(command, params) {
            Err(e) if e.is_transport() => {
                tries += 1;
                tracing::warn!(command, tries, "transport failure, retrying");
                if tries > 5 {
                    return Err(e);
                }
            }
            other => return other,
        }
    }
}
