//! `xhttp` is an async HTTP request-execution engine: a fixed middleware pipeline,
//! a retry/backoff state machine and a pluggable transport.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use xhttp::prelude::{CallContext, Client, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .retry_attempts(3)
//!         .backoff_window(Duration::from_millis(100), Duration::from_secs(2))
//!         .default_cookie("session", "abc")
//!         .follow_redirects(true)
//!         .build()?;
//!
//!     let context = CallContext::new().with_timeout(Duration::from_secs(10));
//!     let request = Request::post("https://api.example.com/v1/items")?
//!         .json(&serde_json::json!({ "title": "x" }))?;
//!     let response = client.execute(&context, request).await?;
//!
//!     println!(
//!         "status={} attempts={} latency={:?}",
//!         response.status(),
//!         response.request().attempt(),
//!         response.latency()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! # Semantics
//!
//! - `retry_attempts` counts every network call, the first one included.
//! - A status outside the retry set is returned as a response, even 4xx and 5xx.
//! - Canceling the [`CallContext`] stops the call at the next suspension point.

#[cfg(all(not(feature = "tls-rustls-ring"), not(feature = "tls-rustls-aws-lc-rs")))]
compile_error!(
    "xhttp requires one TLS backend feature: enable `tls-rustls-ring` or `tls-rustls-aws-lc-rs`"
);

mod backoff;
mod client;
mod config;
mod content_encoding;
mod context;
mod cookie;
mod error;
mod middleware;
mod rate_limit;
mod redirect;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::backoff::{Backoff, ExponentialBackoff, JitteredBackoff};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{ClientConfig, ClientIdentity, ClientOptions, TlsOptions};
pub use crate::context::CallContext;
pub use crate::cookie::{CookieJar, CookieStore};
pub use crate::error::{
    AttemptError, BoxError, ContextError, Error, ErrorCode, TransportError, TransportErrorKind,
};
pub use crate::middleware::{
    PostReceiveFn, PostReceiveStep, PreSendFn, PreSendStep, StepFuture, post_receive_fn,
    pre_send_fn,
};
pub use crate::rate_limit::{RateLimit, RateLimiter, TokenBucketLimiter, Unlimited, WaitFuture};
pub use crate::redirect::RedirectPolicy;
pub use crate::request::{AttemptResult, AttemptTrace, Request, RequestBody, RequestTrace};
pub use crate::response::Response;
pub use crate::retry::{AttemptOutcome, RetryDecision, RetryPolicy, StandardRetryPolicy};
pub use crate::transport::{
    HttpTransport, ResponseBody, Transport, TransportFactory, TransportFuture, full_body,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Backoff, CallContext, Client, ClientBuilder, ClientConfig, ClientOptions, CookieJar,
        CookieStore, Error, ErrorCode, ExponentialBackoff, PostReceiveStep, PreSendStep,
        RateLimit, RateLimiter, RedirectPolicy, Request, Response, RetryPolicy,
        StandardRetryPolicy, Transport,
    };
}

#[cfg(test)]
mod tests;
