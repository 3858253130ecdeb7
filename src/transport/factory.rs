use std::sync::Arc;

use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tracing::debug;

use super::connector::{HandshakeTimeout, ProxyConfig, ProxyConnector};
use super::http_transport::HttpTransport;
use super::limiters::HostLimiter;
use super::tls;
use crate::config::ClientOptions;
use crate::cookie::CookieStore;

/// Builds the default [`HttpTransport`] from declarative [`ClientOptions`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportFactory;

impl TransportFactory {
    /// Fails with [`Error::InvalidProxy`](crate::Error::InvalidProxy) for a proxy that is
    /// not an `http://` URL, and with [`Error::TlsConfig`](crate::Error::TlsConfig) for
    /// unusable TLS material.
    pub fn build(
        options: &ClientOptions,
        cookie_store: Option<Arc<dyn CookieStore>>,
    ) -> crate::Result<HttpTransport> {
        let proxy = options
            .proxy
            .as_deref()
            .map(|proxy| ProxyConfig::parse(proxy, options.proxy_authorization.clone()))
            .transpose()?;
        let connector = ProxyConnector::new(proxy, options.dial_timeout);

        let tls_config = tls::client_config(&options.tls)?;
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http();
        let https = if options.http2 {
            builder.enable_http1().enable_http2().wrap_connector(connector)
        } else {
            builder.enable_http1().wrap_connector(connector)
        };
        let connector = HandshakeTimeout::new(
            https,
            options
                .dial_timeout
                .saturating_add(options.tls_handshake_timeout),
        );

        let max_idle_per_host = if options.disable_keep_alives {
            0
        } else {
            options.max_idle_connections
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(options.idle_connection_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build(connector);

        debug!(
            backend = tls::BACKEND,
            http2 = options.http2,
            proxied = options.proxy.is_some(),
            follow_redirects = options.follow_redirects,
            max_connections_per_host = options.max_connections_per_host,
            "built http transport"
        );

        Ok(HttpTransport::new(
            client,
            options.read_timeout,
            options.redirect_policy(),
            cookie_store,
            HostLimiter::new(options.max_connections_per_host),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TransportFactory;
    use crate::config::ClientOptions;
    use crate::cookie::{CookieJar, CookieStore};
    use crate::error::ErrorCode;
    use crate::redirect::RedirectPolicy;

    #[tokio::test]
    async fn builds_with_defaults_and_cookie_store() {
        let jar: Arc<dyn CookieStore> = Arc::new(CookieJar::new());
        let transport =
            TransportFactory::build(&ClientOptions::default(), Some(jar)).expect("transport");
        assert!(transport.cookie_store().is_some());
        assert_eq!(transport.redirect_policy(), RedirectPolicy::none());
    }

    #[tokio::test]
    async fn follow_redirects_sets_a_limited_policy() {
        let options = ClientOptions {
            follow_redirects: true,
            max_redirects: 4,
            http2: true,
            ..ClientOptions::default()
        };
        let transport = TransportFactory::build(&options, None).expect("transport");
        assert_eq!(transport.redirect_policy(), RedirectPolicy::limited(4));
    }

    #[tokio::test]
    async fn invalid_proxy_fails_construction() {
        let options = ClientOptions {
            proxy: Some("ftp://proxy.test:21".to_owned()),
            ..ClientOptions::default()
        };
        let error = TransportFactory::build(&options, None).expect_err("invalid proxy");
        assert_eq!(error.code(), ErrorCode::InvalidProxy);
    }
}
