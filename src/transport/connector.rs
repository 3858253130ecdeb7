use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use http::header::HeaderValue;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tower_service::Service;

use crate::error::{BoxError, Error};

/// Forward proxy used for every destination the transport dials.
#[derive(Clone, Debug)]
pub(crate) struct ProxyConfig {
    pub(crate) uri: Uri,
    pub(crate) authorization: Option<HeaderValue>,
}

impl ProxyConfig {
    /// Accepts `http://host[:port]` proxies only.
    pub(crate) fn parse(proxy: &str, authorization: Option<HeaderValue>) -> crate::Result<Self> {
        let invalid = |message: &str| Error::InvalidProxy {
            proxy: proxy.to_owned(),
            message: message.to_owned(),
        };
        let url = url::Url::parse(proxy).map_err(|source| invalid(&source.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("only http:// proxies are supported"));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("proxy url has no host"));
        }
        let uri = url
            .as_str()
            .parse::<Uri>()
            .map_err(|source| invalid(&source.to_string()))?;
        let authorization = authorization.map(|mut value| {
            value.set_sensitive(true);
            value
        });
        Ok(Self { uri, authorization })
    }
}

#[derive(Debug)]
pub(crate) struct ProxyConnection<T> {
    inner: T,
    proxied: bool,
}

impl<T> ProxyConnection<T> {
    fn new(inner: T, proxied: bool) -> Self {
        Self { inner, proxied }
    }
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.proxied)
    }
}

type Connecting<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

/// Dials destinations directly, or through the configured proxy.
///
/// Plain-http destinations are sent to the proxy in absolute-form; https destinations
/// are tunneled with `CONNECT` so TLS runs end to end.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: HttpConnector,
    proxy: Option<(Tunnel<HttpConnector>, Uri)>,
}

impl ProxyConnector {
    pub(crate) fn new(proxy: Option<ProxyConfig>, dial_timeout: Duration) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_connect_timeout(Some(dial_timeout));
        let proxy = proxy.map(|config| {
            let mut tunnel = Tunnel::new(config.uri.clone(), direct.clone());
            if let Some(authorization) = config.authorization {
                tunnel = tunnel.with_auth(authorization);
            }
            (tunnel, config.uri)
        });
        Self { direct, proxy }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<<HttpConnector as Service<Uri>>::Response>;
    type Error = BoxError;
    type Future = Connecting<Self::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.direct.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
            Poll::Pending => return Poll::Pending,
        }
        match &mut self.proxy {
            Some((tunnel, _)) => tunnel.poll_ready(cx).map_err(|error| Box::new(error) as _),
            None => Poll::Ready(Ok(())),
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let Some((tunnel, proxy_uri)) = &mut self.proxy else {
            let connecting = self.direct.call(dst);
            return Box::pin(async move {
                connecting
                    .await
                    .map(|connection| ProxyConnection::new(connection, false))
                    .map_err(|error| Box::new(error) as _)
            });
        };

        if dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"))
        {
            let connecting = tunnel.call(tunnel_target_uri(dst));
            return Box::pin(async move {
                connecting
                    .await
                    .map(|connection| ProxyConnection::new(connection, false))
                    .map_err(|error| Box::new(error) as _)
            });
        }

        let connecting = self.direct.call(proxy_uri.clone());
        Box::pin(async move {
            connecting
                .await
                .map(|connection| ProxyConnection::new(connection, true))
                .map_err(|error| Box::new(error) as _)
        })
    }
}

/// `CONNECT` needs an explicit port in the authority.
pub(crate) fn tunnel_target_uri(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }
    let Some(port) = crate::util::default_port(&dst) else {
        return dst;
    };
    let Some(host) = dst.host() else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

#[derive(Debug, thiserror::Error)]
#[error("tls handshake not finished after {}ms", after.as_millis())]
pub(crate) struct HandshakeTimedOut {
    after: Duration,
}

/// Bounds connection setup for https destinations: dial plus TLS handshake.
#[derive(Clone)]
pub(crate) struct HandshakeTimeout<C> {
    inner: C,
    limit: Duration,
}

impl<C> HandshakeTimeout<C> {
    pub(crate) fn new(inner: C, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

impl<C> Service<Uri> for HandshakeTimeout<C>
where
    C: Service<Uri>,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Connecting<C::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let limit = dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"))
            .then_some(self.limit);
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            let Some(limit) = limit else {
                return connecting.await.map_err(Into::into);
            };
            match tokio::time::timeout(limit, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(HandshakeTimedOut { after: limit }) as BoxError),
            }
        })
    }
}
