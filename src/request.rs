use std::fmt::Write as _;
use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri, Version};
use serde::Serialize;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::error::Error;
use crate::util::{header_value_text, parse_header_name, parse_header_value};

/// Where a request body comes from before it is buffered.
///
/// The body is read at most once, before the first attempt, and the buffered bytes
/// are replayed verbatim on every retry.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Reader(Box<dyn Read + Send>),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Bytes(bytes) => formatter
                .debug_tuple("Bytes")
                .field(&bytes.len())
                .finish(),
            Self::Reader(_) => formatter.write_str("Reader(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// What happened to one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptResult {
    Status(u16),
    Error(String),
}

#[derive(Clone, Debug)]
pub struct AttemptTrace {
    pub attempt: usize,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub result: AttemptResult,
}

impl AttemptTrace {
    pub fn duration(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }
}

/// Per-attempt timeline, installed when tracing is enabled on the request.
#[derive(Clone, Debug, Default)]
pub struct RequestTrace {
    attempts: Vec<AttemptTrace>,
}

impl RequestTrace {
    pub fn attempts(&self) -> &[AttemptTrace] {
        &self.attempts
    }

    pub(crate) fn record(&mut self, attempt: AttemptTrace) {
        self.attempts.push(attempt);
    }
}

#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: RequestBody,
    buffered_body: Option<Bytes>,
    attempt: usize,
    sent_at: Option<Instant>,
    trace_enabled: bool,
    trace: Option<RequestTrace>,
    close_connection: bool,
    context: Option<CallContext>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            buffered_body: None,
            attempt: 0,
            sent_at: None,
            trace_enabled: false,
            trace: None,
            close_connection: false,
            context: None,
        }
    }

    pub fn try_new(method: Method, uri: &str) -> crate::Result<Self> {
        let parsed = uri.parse::<Uri>().map_err(|_| Error::InvalidUri {
            uri: uri.to_owned(),
        })?;
        if parsed.scheme().is_none() || parsed.host().is_none() {
            return Err(Error::InvalidUri {
                uri: uri.to_owned(),
            });
        }
        Ok(Self::new(method, parsed))
    }

    pub fn get(uri: &str) -> crate::Result<Self> {
        Self::try_new(Method::GET, uri)
    }

    pub fn post(uri: &str) -> crate::Result<Self> {
        Self::try_new(Method::POST, uri)
    }

    pub fn put(uri: &str) -> crate::Result<Self> {
        Self::try_new(Method::PUT, uri)
    }

    pub fn delete(uri: &str) -> crate::Result<Self> {
        Self::try_new(Method::DELETE, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self.buffered_body = None;
        self
    }

    pub fn body_reader(self, reader: impl Read + Send + 'static) -> Self {
        self.body(RequestBody::Reader(Box::new(reader)))
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn enable_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> crate::Result<()> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Number of network calls made so far for the current execution.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// When the latest attempt was sent.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    pub fn trace(&self) -> Option<&RequestTrace> {
        self.trace.as_ref()
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn context(&self) -> Option<&CallContext> {
        self.context.as_ref()
    }

    /// The buffered body replayed on every attempt, once materialized.
    pub fn buffered_body(&self) -> Option<&Bytes> {
        self.buffered_body.as_ref()
    }

    /// Reads the body source into memory; later calls return the same bytes.
    pub fn materialize_body(&mut self) -> crate::Result<Bytes> {
        if let Some(buffered) = &self.buffered_body {
            return Ok(buffered.clone());
        }
        let buffered = match std::mem::take(&mut self.body) {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Bytes(bytes) => bytes,
            RequestBody::Reader(mut reader) => {
                let mut collected = Vec::new();
                reader
                    .read_to_end(&mut collected)
                    .map_err(|source| Error::BodyRead { source })?;
                Bytes::from(collected)
            }
        };
        self.body = RequestBody::Bytes(buffered.clone());
        self.buffered_body = Some(buffered.clone());
        Ok(buffered)
    }

    /// Renders the request as HTTP/1.1 wire text.
    pub fn dump(&self) -> crate::Result<String> {
        let mut text = String::new();
        let target = self
            .uri
            .path_and_query()
            .map(|item| item.as_str())
            .unwrap_or("/");
        let _ = write!(text, "{} {} {:?}\r\n", self.method, target, self.version);
        if let Some(authority) = self.uri.authority() {
            let _ = write!(text, "host: {authority}\r\n");
        }
        for (name, value) in &self.headers {
            let value = header_value_text(name, value).map_err(|message| Error::DumpRender {
                part: "request",
                message,
            })?;
            let _ = write!(text, "{name}: {value}\r\n");
        }
        text.push_str("\r\n");
        if let Some(body) = &self.buffered_body {
            text.push_str(&String::from_utf8_lossy(body));
        }
        Ok(text)
    }

    pub(crate) fn reset_for_execution(&mut self, context: CallContext) {
        self.attempt = 0;
        self.sent_at = None;
        self.trace = None;
        self.context = Some(context);
    }

    pub(crate) fn begin_attempt(&mut self) -> Instant {
        self.attempt += 1;
        let now = Instant::now();
        self.sent_at = Some(now);
        now
    }

    pub(crate) fn install_trace(&mut self) {
        if self.trace_enabled && self.trace.is_none() {
            self.trace = Some(RequestTrace::default());
        }
    }

    pub(crate) fn record_attempt(&mut self, started_at: Instant, result: AttemptResult) {
        let attempt = self.attempt;
        if let Some(trace) = &mut self.trace {
            trace.record(AttemptTrace {
                attempt,
                started_at,
                finished_at: Instant::now(),
                result,
            });
        }
    }

    pub(crate) fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    /// Builds the wire request for one attempt from the buffered body.
    pub(crate) fn to_http_request(&self) -> crate::Result<http::Request<Bytes>> {
        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .version(self.version);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        let body = self.buffered_body.clone().unwrap_or_default();
        let mut request = builder
            .body(body)
            .map_err(|source| Error::RequestBuild { source })?;
        if self.close_connection {
            request
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        Ok(request)
    }
}
