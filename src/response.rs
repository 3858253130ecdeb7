use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::error::Error;
use crate::request::Request;
use crate::transport::ResponseBody;
use crate::util::{header_value_text, truncate_body};

/// Result of a successful execution.
///
/// Built once, after the retry loop ends in terminal success, and filled in by the
/// post-receive chain before it is handed to the caller.
pub struct Response {
    request: Request,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    extensions: http::Extensions,
    raw_body: Option<ResponseBody>,
    body: Bytes,
    received_at: Instant,
    received_at_wall: SystemTime,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("attempt", &self.request.attempt())
            .finish()
    }
}

impl Response {
    pub(crate) fn new(request: Request, raw: http::Response<ResponseBody>) -> Self {
        let (parts, body) = raw.into_parts();
        Self {
            request,
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            extensions: parts.extensions,
            raw_body: Some(body),
            body: Bytes::new(),
            received_at: Instant::now(),
            received_at_wall: SystemTime::now(),
        }
    }

    /// The request that produced this response, including its attempt count.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    pub fn status(&self) -> StatusCode {
        self.status
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

    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn received_at_wall(&self) -> SystemTime {
        self.received_at_wall
    }

    /// Time between sending the last attempt and receiving its response head.
    pub fn latency(&self) -> Duration {
        match self.request.sent_at() {
            Some(sent_at) => self.received_at.saturating_duration_since(sent_at),
            None => Duration::ZERO,
        }
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    /// Renders the status line, headers and materialized body as HTTP/1.1 text.
    pub fn dump(&self) -> crate::Result<String> {
        let mut text = String::new();
        let _ = write!(text, "{:?} {}\r\n", self.version, self.status);
        for (name, value) in &self.headers {
            let value = header_value_text(name, value).map_err(|message| Error::DumpRender {
                part: "response",
                message,
            })?;
            let _ = write!(text, "{name}: {value}\r\n");
        }
        text.push_str("\r\n");
        text.push_str(&String::from_utf8_lossy(&self.body));
        Ok(text)
    }

    pub(crate) fn take_raw_body(&mut self) -> Option<ResponseBody> {
        self.raw_body.take()
    }
}
