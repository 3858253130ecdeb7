use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, COOKIE, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use tracing::debug;

use super::connector::{HandshakeTimedOut, HandshakeTimeout, ProxyConnector};
use super::limiters::{HostLimiter, PermitBody};
use super::{DecodeOnRead, ResponseBody, Transport, TransportFuture};
use crate::content_encoding::SUPPORTED_ENCODINGS;
use crate::cookie::CookieStore;
use crate::error::{BoxError, TransportError, TransportErrorKind};
use crate::redirect::RedirectPolicy;
use crate::util::{
    default_port, is_redirect_status, redirect_location, redirect_method, resolve_redirect_uri,
    same_origin, sanitize_headers_for_redirect,
};

pub(crate) type HttpsConnector = hyper_rustls::HttpsConnector<ProxyConnector>;
pub(crate) type HyperClient = Client<HandshakeTimeout<HttpsConnector>, Full<Bytes>>;

/// The default [`Transport`]: a pooled hyper client with rustls, an optional
/// `http://` proxy, redirect following and a cookie store.
///
/// Built by [`TransportFactory::build`](crate::TransportFactory::build).
#[derive(Clone)]
pub struct HttpTransport {
    client: HyperClient,
    read_timeout: Duration,
    redirect_policy: RedirectPolicy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    host_limiter: Option<HostLimiter>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("read_timeout", &self.read_timeout)
            .field("redirect_policy", &self.redirect_policy)
            .field("cookie_store", &self.cookie_store.is_some())
            .field("host_limiter", &self.host_limiter.is_some())
            .finish()
    }
}

struct Hop {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpTransport {
    pub(crate) fn new(
        client: HyperClient,
        read_timeout: Duration,
        redirect_policy: RedirectPolicy,
        cookie_store: Option<Arc<dyn CookieStore>>,
        host_limiter: Option<HostLimiter>,
    ) -> Self {
        Self {
            client,
            read_timeout,
            redirect_policy,
            cookie_store,
            host_limiter,
        }
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn cookie_store(&self) -> Option<&Arc<dyn CookieStore>> {
        self.cookie_store.as_ref()
    }

    async fn send_following_redirects(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<ResponseBody>, TransportError> {
        let (parts, body) = request.into_parts();
        let version = parts.version;
        let mut hop = Hop {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };
        let decode_on_read = !hop.headers.contains_key(ACCEPT_ENCODING);
        if decode_on_read {
            hop.headers.insert(
                ACCEPT_ENCODING,
                HeaderValue::from_static(SUPPORTED_ENCODINGS),
            );
        }

        let mut redirects = 0_usize;
        loop {
            let mut wire = http::Request::new(Full::new(hop.body.clone()));
            *wire.method_mut() = hop.method.clone();
            *wire.uri_mut() = hop.uri.clone();
            *wire.version_mut() = version;
            *wire.headers_mut() = hop.headers.clone();
            if let Some(store) = &self.cookie_store
                && let Some(cookies) = store.cookies_for(&hop.uri)
            {
                merge_cookie_header(wire.headers_mut(), &cookies);
            }

            let permit = match &self.host_limiter {
                Some(limiter) => Some(limiter.acquire(host_key(&hop.uri)).await?),
                None => None,
            };
            let response = match tokio::time::timeout(self.read_timeout, self.client.request(wire))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => return Err(classify_transport_error(error)),
                Err(_) => return Err(TransportError::timeout(self.read_timeout)),
            };

            if let Some(store) = &self.cookie_store {
                store.store_response_cookies(&hop.uri, response.headers());
            }

            let status = response.status();
            if let Some(next) = self.next_hop(&hop, status, response.headers(), redirects) {
                debug!(
                    status = status.as_u16(),
                    from = %hop.uri,
                    to = %next.uri,
                    redirects = redirects + 1,
                    "following redirect"
                );
                drop(response);
                drop(permit);
                hop = next;
                redirects += 1;
                continue;
            }

            let (mut parts, incoming) = response.into_parts();
            if decode_on_read {
                parts.extensions.insert(DecodeOnRead);
            }
            let body = PermitBody::new(incoming, permit)
                .map_err(|error| Box::new(error) as BoxError)
                .boxed_unsync();
            return Ok(http::Response::from_parts(parts, body));
        }
    }

    fn next_hop(
        &self,
        current: &Hop,
        status: StatusCode,
        headers: &HeaderMap,
        redirects: usize,
    ) -> Option<Hop> {
        if !is_redirect_status(status) || !self.redirect_policy.should_follow(redirects) {
            return None;
        }
        let location = redirect_location(headers)?;
        let uri = resolve_redirect_uri(&current.uri, &location)?;
        let method = redirect_method(&current.method, status);
        let method_changed_to_get = method == Method::GET && current.method != Method::GET;
        let mut next_headers = current.headers.clone();
        sanitize_headers_for_redirect(
            &mut next_headers,
            method_changed_to_get,
            same_origin(&current.uri, &uri),
        );
        Some(Hop {
            method,
            uri,
            headers: next_headers,
            body: if method_changed_to_get {
                Bytes::new()
            } else {
                current.body.clone()
            },
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: http::Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(self.send_following_redirects(request))
    }
}

fn host_key(uri: &Uri) -> String {
    let host = uri.host().unwrap_or_default().to_ascii_lowercase();
    match default_port(uri) {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

fn merge_cookie_header(headers: &mut HeaderMap, stored: &HeaderValue) {
    let merged = match headers.get(COOKIE).and_then(|value| value.to_str().ok()) {
        Some(existing) if !existing.is_empty() => stored
            .to_str()
            .ok()
            .and_then(|stored| HeaderValue::from_str(&format!("{existing}; {stored}")).ok()),
        _ => Some(stored.clone()),
    };
    if let Some(merged) = merged {
        headers.insert(COOKIE, merged);
    }
}

fn chain_contains<T: std::error::Error + 'static>(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(item) = current {
        if item.is::<T>() {
            return true;
        }
        current = item.source();
    }
    false
}

fn chain_has_io_kind(error: &(dyn std::error::Error + 'static), kind: std::io::ErrorKind) -> bool {
    let mut current = Some(error);
    while let Some(item) = current {
        if let Some(io_error) = item.downcast_ref::<std::io::Error>()
            && io_error.kind() == kind
        {
            return true;
        }
        current = item.source();
    }
    false
}

pub(crate) fn classify_transport_error(error: hyper_util::client::legacy::Error) -> TransportError {
    let kind = classify_kind(&error);
    TransportError::new(kind, error)
}

fn classify_kind(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if chain_contains::<HandshakeTimedOut>(error)
        || chain_has_io_kind(error, std::io::ErrorKind::TimedOut)
    {
        return TransportErrorKind::Timeout;
    }

    let text = full_message(error).to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if chain_contains::<rustls::Error>(error)
            || text.contains("tls")
            || text.contains("certificate")
            || text.contains("handshake")
        {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("connection closed")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("incomplete message")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

fn full_message(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(item) = current {
        text.push_str(": ");
        text.push_str(&item.to_string());
        current = item.source();
    }
    text
}
