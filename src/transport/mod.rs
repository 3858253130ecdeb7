//! The network call and its default implementation.
//!
//! The engine only sees [`Transport`]: one request in, one response head (with a lazily
//! read body) or a [`TransportError`] out. [`TransportFactory`] builds the default
//! [`HttpTransport`] from [`ClientOptions`](crate::ClientOptions): connection pooling,
//! TLS, proxying, redirects and the cookie store all live behind it.

mod connector;
mod factory;
mod http_transport;
mod limiters;
mod tls;

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};

use crate::error::{BoxError, TransportError};

pub use self::factory::TransportFactory;
pub use self::http_transport::HttpTransport;

pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<http::Response<ResponseBody>, TransportError>> + Send + 'a>>;

pub trait Transport: Send + Sync {
    /// Performs one network exchange. The request body is already fully buffered.
    fn send(&self, request: http::Request<Bytes>) -> TransportFuture<'_>;
}

/// Set on responses whose `Accept-Encoding` was added by the transport, so the
/// body-read step knows it must undo the content-encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DecodeOnRead;

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

/// A response body backed by bytes already in memory.
pub fn full_body(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}
