use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, StatusCode};

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::client::Client;
use crate::context::CallContext;
use crate::error::{AttemptError, Error, ErrorCode, TransportError, TransportErrorKind};
use crate::request::{AttemptResult, Request};
use crate::transport::{DecodeOnRead, Transport, TransportFuture, full_body};

type Scripted = Result<http::Response<Bytes>, TransportError>;

/// Replays scripted outcomes in order and remembers every request it saw.
#[derive(Clone, Default)]
struct ScriptedTransport {
    outcomes: Arc<Mutex<VecDeque<Scripted>>>,
    seen: Arc<Mutex<Vec<http::Request<Bytes>>>>,
    calls: Arc<AtomicUsize>,
    mark_decode_on_read: bool,
}

impl ScriptedTransport {
    fn new(outcomes: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: http::Request<Bytes>) -> TransportFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("seen").push(request);
        let next = self
            .outcomes
            .lock()
            .expect("outcomes")
            .pop_front()
            .unwrap_or_else(|| Ok(status_response(200, "")));
        let mark = self.mark_decode_on_read;
        Box::pin(async move {
            next.map(|response| {
                let (mut parts, body) = response.into_parts();
                if mark {
                    parts.extensions.insert(DecodeOnRead);
                }
                http::Response::from_parts(parts, full_body(body))
            })
        })
    }
}

fn status_response(status: u16, body: &'static str) -> http::Response<Bytes> {
    let mut response = http::Response::new(Bytes::from_static(body.as_bytes()));
    *response.status_mut() = StatusCode::from_u16(status).expect("status");
    response
}

fn client(transport: ScriptedTransport, attempts: usize) -> Client {
    Client::builder()
        .retry_attempts(attempts)
        .backoff_window(Duration::from_millis(10), Duration::from_millis(40))
        .transport(transport)
        .build()
        .expect("client")
}

#[tokio::test(start_paused = true)]
async fn retryable_status_then_success_records_a_trace_per_attempt() {
    let transport = ScriptedTransport::new([
        Ok(status_response(503, "busy")),
        Err(TransportError::new(TransportErrorKind::Read, "connection reset")),
        Ok(status_response(200, "success")),
    ]);
    let client = client(transport.clone(), 3);

    let request = Request::get("http://127.0.0.1:1/flaky")
        .expect("uri")
        .enable_trace();
    let response = client
        .execute(&CallContext::new(), request)
        .await
        .expect("third attempt succeeds");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text_lossy(), "success");
    assert_eq!(response.request().attempt(), 3);
    assert_eq!(transport.calls(), 3);

    let trace = response.request().trace().expect("trace enabled");
    let results: Vec<_> = trace
        .attempts()
        .iter()
        .map(|attempt| attempt.result.clone())
        .collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], AttemptResult::Status(503));
    assert!(matches!(&results[1], AttemptResult::Error(message) if message.contains("connection reset")));
    assert_eq!(results[2], AttemptResult::Status(200));
}

#[tokio::test(start_paused = true)]
async fn exhausting_attempts_reports_the_last_cause() {
    let transport = ScriptedTransport::new([
        Ok(status_response(500, "")),
        Ok(status_response(502, "")),
        Ok(status_response(503, "")),
    ]);
    let client = client(transport.clone(), 3);

    let error = client
        .execute(
            &CallContext::new(),
            Request::get("http://127.0.0.1:1/down").expect("uri"),
        )
        .await
        .expect_err("gives up");

    assert_eq!(transport.calls(), 3);
    match error {
        Error::GaveUp {
            attempts, cause, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(cause, AttemptError::Status { status } if status == StatusCode::SERVICE_UNAVAILABLE));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn tls_failure_is_terminal_after_one_call() {
    let transport = ScriptedTransport::new([Err(TransportError::new(
        TransportErrorKind::Tls,
        "invalid peer certificate",
    ))]);
    let client = client(transport.clone(), 5);

    let error = client
        .execute(
            &CallContext::new(),
            Request::get("https://127.0.0.1:1/").expect("uri"),
        )
        .await
        .expect_err("tls is not retried");
    assert_eq!(transport.calls(), 1);
    assert_eq!(error.code(), ErrorCode::GaveUp);
    assert!(error.to_string().contains("invalid peer certificate"));
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_drives_the_backoff() {
    let mut throttled = status_response(429, "");
    throttled
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    let transport = ScriptedTransport::new([Ok(throttled), Ok(status_response(200, "ok"))]);
    let client = Client::builder()
        .retry_attempts(2)
        .backoff_window(Duration::from_millis(10), Duration::from_secs(5))
        .transport(transport.clone())
        .build()
        .expect("client");

    let started = tokio::time::Instant::now();
    let response = client
        .execute(
            &CallContext::new(),
            Request::get("http://127.0.0.1:1/").expect("uri"),
        )
        .await
        .expect("second attempt");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn transport_marked_bodies_are_decompressed() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed payload").expect("gzip");
    let gzipped = Bytes::from(encoder.finish().expect("gzip"));

    let mut response = http::Response::new(gzipped.clone());
    response
        .headers_mut()
        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(gzipped.len()));
    let transport = ScriptedTransport {
        mark_decode_on_read: true,
        ..ScriptedTransport::new([Ok(response)])
    };
    let client = client(transport, 1);

    let response = client
        .execute(
            &CallContext::new(),
            Request::get("http://127.0.0.1:1/gzip").expect("uri"),
        )
        .await
        .expect("response");
    assert_eq!(response.text_lossy(), "compressed payload");
    assert!(response.headers().get(CONTENT_ENCODING).is_none());
    assert!(response.headers().get(CONTENT_LENGTH).is_none());
}

#[tokio::test]
async fn caller_requested_encoding_is_left_alone() {
    let mut response = http::Response::new(Bytes::from_static(b"\x1f\x8bnot really gzip"));
    response
        .headers_mut()
        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let transport = ScriptedTransport::new([Ok(response)]);
    let client = client(transport.clone(), 1);

    let request = Request::get("http://127.0.0.1:1/raw")
        .expect("uri")
        .header(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    let response = client
        .execute(&CallContext::new(), request)
        .await
        .expect("raw body");
    assert_eq!(response.body().as_ref(), b"\x1f\x8bnot really gzip");
    assert_eq!(response.headers().get(CONTENT_ENCODING).expect("kept"), "gzip");
}

#[tokio::test]
async fn close_connection_flag_reaches_the_wire() {
    let transport = ScriptedTransport::new([Ok(status_response(200, ""))]);
    let client = Client::builder()
        .close_connection(true)
        .transport(transport.clone())
        .build()
        .expect("client");
    let response = client
        .execute(
            &CallContext::new(),
            Request::get("http://127.0.0.1:1/").expect("uri"),
        )
        .await
        .expect("response");
    assert!(response.request().close_connection());

    let seen = transport.seen.lock().expect("seen");
    assert_eq!(
        seen[0].headers().get(http::header::CONNECTION).expect("connection"),
        "close"
    );
}

#[test]
fn backoff_index_starts_at_zero_for_the_first_retry() {
    let backoff = ExponentialBackoff;
    let min = Duration::from_millis(100);
    let max = Duration::from_secs(2);
    assert_eq!(backoff.wait(min, max, 0, Some(&HeaderMap::new())), min);
    assert_eq!(backoff.wait(min, max, 1, None), Duration::from_millis(200));
    assert_eq!(backoff.wait(min, max, 10, None), max);
}
