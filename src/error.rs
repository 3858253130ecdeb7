use std::sync::Arc;

use http::{Method, StatusCode};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure of a single network call, as reported by a [`Transport`](crate::Transport).
#[derive(Clone, Debug, Error)]
#[error("{kind} error: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: Arc<dyn std::error::Error + Send + Sync>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: Arc::from(source.into()),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("no response headers after {}ms", after.as_millis()),
        )
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

/// Why a [`CallContext`](crate::CallContext) finished.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cause attached to a retry decision and, when the call gives up, to [`Error::GaveUp`].
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server responded with retryable status {status}")]
    Status { status: StatusCode },
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidProxy,
    TlsConfig,
    TlsBackendInit,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    Deserialize,
    MethodNotAllowed,
    BodyRead,
    RequestBuild,
    ReadBody,
    DecodeContentEncoding,
    ResponseTooLarge,
    DumpRender,
    Canceled,
    DeadlineExceeded,
    GaveUp,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidProxy => "invalid_proxy",
            Self::TlsConfig => "tls_config",
            Self::TlsBackendInit => "tls_backend_init",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::Deserialize => "deserialize",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::BodyRead => "body_read",
            Self::RequestBuild => "request_build",
            Self::ReadBody => "read_body",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::ResponseTooLarge => "response_too_large",
            Self::DumpRender => "dump_render",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::GaveUp => "gave_up",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid proxy url {proxy}: {message}")]
    InvalidProxy { proxy: String, message: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("failed to initialize tls backend {backend}: {message}")]
    TlsBackendInit {
        backend: &'static str,
        message: String,
    },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("http method {method} not allowed")]
    MethodNotAllowed { method: Method },
    #[error("failed to read request body: {source}")]
    BodyRead {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("response body longer {actual_bytes} than limit {limit_bytes} for {method} {uri}")]
    ResponseTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to render {part} dump: {message}")]
    DumpRender { part: &'static str, message: String },
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("giving up {method} {uri} after {attempts} attempt(s): {cause}")]
    GaveUp {
        method: Method,
        uri: String,
        attempts: usize,
        #[source]
        cause: AttemptError,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidProxy { .. } => ErrorCode::InvalidProxy,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::MethodNotAllowed { .. } => ErrorCode::MethodNotAllowed,
            Self::BodyRead { .. } => ErrorCode::BodyRead,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::ResponseTooLarge { .. } => ErrorCode::ResponseTooLarge,
            Self::DumpRender { .. } => ErrorCode::DumpRender,
            Self::Context(ContextError::Canceled) => ErrorCode::Canceled,
            Self::Context(ContextError::DeadlineExceeded) => ErrorCode::DeadlineExceeded,
            Self::GaveUp { .. } => ErrorCode::GaveUp,
        }
    }

    /// Returns the context error when the call ended because its context finished.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Context(error) => Some(*error),
            _ => None,
        }
    }
}
