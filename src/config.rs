use std::time::Duration;

use http::header::HeaderValue;
use http::{HeaderMap, Method};

use crate::rate_limit::RateLimit;
use crate::redirect::RedirectPolicy;

pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
pub(crate) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 8;
pub(crate) const DEFAULT_RETRY_ATTEMPTS: usize = 3;
pub(crate) const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// TLS parameters for the default transport. The webpki roots are always trusted.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// Extra trusted root CAs, one PEM bundle per entry.
    pub root_certificates_pem: Vec<Vec<u8>>,
    pub client_identity: Option<ClientIdentity>,
}

/// Declarative client options. [`ClientBuilder`](crate::ClientBuilder) edits these and
/// [`TransportFactory`](crate::TransportFactory) reads the transport-related ones.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub allowed_methods: Vec<Method>,
    /// Applied to a request only where it does not already carry the header.
    pub default_headers: HeaderMap,
    /// Appended to the `Cookie` header in this order.
    pub default_cookies: Vec<(String, String)>,
    pub max_response_body_bytes: usize,
    pub dial_timeout: Duration,
    /// Time allowed for the response head once the request is written.
    pub read_timeout: Duration,
    pub idle_connection_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// `0` means unbounded.
    pub max_connections_per_host: usize,
    pub max_idle_connections: usize,
    pub http2: bool,
    /// `http://` proxy used for every destination.
    pub proxy: Option<String>,
    pub proxy_authorization: Option<HeaderValue>,
    pub disable_keep_alives: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Total number of network calls per `execute`, at least 1.
    pub retry_attempts: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub debug: bool,
    pub close_connection: bool,
    pub rate_limit: Option<RateLimit>,
    pub tls: TlsOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            allowed_methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::HEAD,
                Method::OPTIONS,
            ],
            default_headers: HeaderMap::new(),
            default_cookies: Vec::new(),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            max_connections_per_host: 0,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            http2: false,
            proxy: None,
            proxy_authorization: None,
            disable_keep_alives: false,
            follow_redirects: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            debug: false,
            close_connection: false,
            rate_limit: None,
            tls: TlsOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn redirect_policy(&self) -> RedirectPolicy {
        if self.follow_redirects {
            RedirectPolicy::limited(self.max_redirects)
        } else {
            RedirectPolicy::none()
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.retry_attempts = self.retry_attempts.max(1);
        self.max_backoff = self.max_backoff.max(self.min_backoff);
        self
    }
}

/// Read-only view of the client configuration handed to every pipeline step.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    allowed_methods: Vec<Method>,
    default_headers: HeaderMap,
    default_cookies: Vec<(String, String)>,
    max_response_body_bytes: usize,
    debug: bool,
    close_connection: bool,
}

impl ClientConfig {
    pub(crate) fn from_options(options: &ClientOptions) -> Self {
        Self {
            allowed_methods: options.allowed_methods.clone(),
            default_headers: options.default_headers.clone(),
            default_cookies: options.default_cookies.clone(),
            max_response_body_bytes: options.max_response_body_bytes,
            debug: options.debug,
            close_connection: options.close_connection || options.disable_keep_alives,
        }
    }

    pub fn allowed_methods(&self) -> &[Method] {
        &self.allowed_methods
    }

    pub fn is_method_allowed(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn default_cookies(&self) -> &[(String, String)] {
        &self.default_cookies
    }

    pub fn max_response_body_bytes(&self) -> usize {
        self.max_response_body_bytes
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_options(&ClientOptions::default())
    }
}
