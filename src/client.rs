use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tracing::{Instrument, debug, info_span, warn};

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::config::{ClientConfig, ClientIdentity, ClientOptions};
use crate::context::CallContext;
use crate::cookie::CookieStore;
use crate::error::{AttemptError, Error};
use crate::middleware::{
    Pipeline, PostReceiveStep, PreSendStep, post_receive_fn, pre_send_fn,
};
use crate::rate_limit::{RateLimit, RateLimiter, TokenBucketLimiter, Unlimited};
use crate::request::{AttemptResult, Request};
use crate::response::Response;
use crate::retry::{AttemptOutcome, RetryDecision, RetryPolicy, StandardRetryPolicy};
use crate::transport::{Transport, TransportFactory};
use crate::util::{parse_header_name, parse_header_value};

/// Build phase of a [`Client`]. Middleware can only be registered here.
pub struct ClientBuilder {
    options: ClientOptions,
    pre_send: Vec<Arc<dyn PreSendStep>>,
    post_receive: Vec<Arc<dyn PostReceiveStep>>,
    transport: Option<Arc<dyn Transport>>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn Backoff>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::from_options(ClientOptions::default())
    }

    pub fn from_options(options: ClientOptions) -> Self {
        Self {
            options,
            pre_send: Vec::new(),
            post_receive: Vec::new(),
            transport: None,
            cookie_store: None,
            rate_limiter: None,
            retry_policy: Arc::new(StandardRetryPolicy::new()),
            backoff: Arc::new(ExponentialBackoff),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn allowed_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.options.allowed_methods = methods.into_iter().collect();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.options.default_headers = headers;
        self
    }

    /// Appended to every request's `Cookie` header, in registration order.
    pub fn default_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .default_cookies
            .push((name.into(), value.into()));
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.options.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.options.dial_timeout = dial_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.options.read_timeout = read_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn idle_connection_timeout(mut self, idle_connection_timeout: Duration) -> Self {
        self.options.idle_connection_timeout = idle_connection_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn tls_handshake_timeout(mut self, tls_handshake_timeout: Duration) -> Self {
        self.options.tls_handshake_timeout = tls_handshake_timeout.max(Duration::from_millis(1));
        self
    }

    /// `0` leaves connections per host unbounded.
    pub fn max_connections_per_host(mut self, max_connections_per_host: usize) -> Self {
        self.options.max_connections_per_host = max_connections_per_host;
        self
    }

    pub fn max_idle_connections(mut self, max_idle_connections: usize) -> Self {
        self.options.max_idle_connections = max_idle_connections;
        self
    }

    pub fn http2(mut self, enabled: bool) -> Self {
        self.options.http2 = enabled;
        self
    }

    /// Validated when the client is built.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.options.proxy = Some(proxy.into());
        self
    }

    pub fn proxy_authorization(mut self, mut proxy_authorization: HeaderValue) -> Self {
        proxy_authorization.set_sensitive(true);
        self.options.proxy_authorization = Some(proxy_authorization);
        self
    }

    pub fn try_proxy_authorization(self, proxy_authorization: &str) -> crate::Result<Self> {
        let proxy_authorization = parse_header_value("proxy-authorization", proxy_authorization)?;
        Ok(self.proxy_authorization(proxy_authorization))
    }

    pub fn disable_keep_alives(mut self, disabled: bool) -> Self {
        self.options.disable_keep_alives = disabled;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.options.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.options.max_redirects = max_redirects;
        self
    }

    /// Total number of network calls per `execute`, the first one included.
    pub fn retry_attempts(mut self, retry_attempts: usize) -> Self {
        self.options.retry_attempts = retry_attempts.max(1);
        self
    }

    pub fn backoff_window(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.options.min_backoff = min_backoff;
        self.options.max_backoff = max_backoff.max(min_backoff);
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.options.debug = enabled;
        self
    }

    pub fn close_connection(mut self, close: bool) -> Self {
        self.options.close_connection = close;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.options.rate_limit = Some(rate_limit);
        self
    }

    pub fn tls_root_ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.options.tls.root_certificates_pem.push(pem.into());
        self
    }

    pub fn tls_client_identity_pem(
        mut self,
        cert_chain_pem: impl Into<Vec<u8>>,
        private_key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        self.options.tls.client_identity = Some(ClientIdentity {
            cert_chain_pem: cert_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
        });
        self
    }

    pub fn pre_send_arc(mut self, step: Arc<dyn PreSendStep>) -> Self {
        self.pre_send.push(step);
        self
    }

    /// Runs before the built-in pre-send steps, in registration order.
    pub fn pre_send<S>(self, step: S) -> Self
    where
        S: PreSendStep + 'static,
    {
        self.pre_send_arc(Arc::new(step))
    }

    pub fn pre_send_fn<F>(self, step: F) -> Self
    where
        F: Fn(&mut Request, &ClientConfig) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.pre_send(pre_send_fn(step))
    }

    pub fn post_receive_arc(mut self, step: Arc<dyn PostReceiveStep>) -> Self {
        self.post_receive.push(step);
        self
    }

    /// Runs after the built-in post-receive steps, in registration order.
    pub fn post_receive<S>(self, step: S) -> Self
    where
        S: PostReceiveStep + 'static,
    {
        self.post_receive_arc(Arc::new(step))
    }

    pub fn post_receive_fn<F>(self, step: F) -> Self
    where
        F: Fn(&mut Response, &ClientConfig) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.post_receive(post_receive_fn(step))
    }

    /// Replaces the default transport; transport options are then ignored.
    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Cookie store handed to the default transport; may be shared with other clients.
    pub fn cookie_store(mut self, cookie_store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(cookie_store);
        self
    }

    pub fn rate_limiter<L>(mut self, rate_limiter: L) -> Self
    where
        L: RateLimiter + 'static,
    {
        self.rate_limiter = Some(Arc::new(rate_limiter));
        self
    }

    pub fn retry_policy<P>(mut self, retry_policy: P) -> Self
    where
        P: RetryPolicy + 'static,
    {
        self.retry_policy = Arc::new(retry_policy);
        self
    }

    pub fn backoff<B>(mut self, backoff: B) -> Self
    where
        B: Backoff + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let options = self.options.normalized();
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(TransportFactory::build(&options, self.cookie_store)?),
        };
        let rate_limiter: Arc<dyn RateLimiter> = match (self.rate_limiter, options.rate_limit) {
            (Some(rate_limiter), _) => rate_limiter,
            (None, Some(rate_limit)) => Arc::new(TokenBucketLimiter::new(rate_limit)),
            (None, None) => Arc::new(Unlimited),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                config: ClientConfig::from_options(&options),
                pipeline: Pipeline::seal(self.pre_send, self.post_receive),
                transport,
                rate_limiter,
                retry_policy: self.retry_policy,
                backoff: self.backoff,
                max_attempts: options.retry_attempts,
                min_backoff: options.min_backoff,
                max_backoff: options.max_backoff,
            }),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<dyn RateLimiter>,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn Backoff>,
    max_attempts: usize,
    min_backoff: Duration,
    max_backoff: Duration,
}

/// Frozen client. Cheap to clone; clones share configuration, transport and middleware.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("config", &self.inner.config)
            .field("max_attempts", &self.inner.max_attempts)
            .field("min_backoff", &self.inner.min_backoff)
            .field("max_backoff", &self.inner.max_backoff)
            .finish()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn max_attempts(&self) -> usize {
        self.inner.max_attempts
    }

    /// Runs one call: rate-limit wait, pre-send chain, the attempt loop, post-receive chain.
    ///
    /// A non-retryable status, including any 4xx or 5xx outside the retry set, is a
    /// successful result; inspect [`Response::status`]. Canceling `context` or passing its
    /// deadline ends the call with [`Error::Context`] and no further network calls.
    pub async fn execute(&self, context: &CallContext, request: Request) -> crate::Result<Response> {
        let span = info_span!(
            "xhttp.execute",
            method = %request.method(),
            uri = %request.uri(),
            max_attempts = self.inner.max_attempts,
            attempts = tracing::field::Empty,
        );
        self.execute_in_span(context, request)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        context: &CallContext,
        mut request: Request,
    ) -> crate::Result<Response> {
        let inner = &*self.inner;
        request.reset_for_execution(context.clone());

        inner.rate_limiter.wait(context).await?;
        inner
            .pipeline
            .run_pre_send(&mut request, &inner.config)
            .await?;

        let raw = loop {
            if let Some(error) = context.err() {
                return Err(error.into());
            }
            let wire = request.to_http_request()?;
            let started_at = request.begin_attempt();
            let attempt = request.attempt();
            debug!(attempt, "sending attempt");

            let outcome = tokio::select! {
                biased;
                error = context.done() => {
                    request.record_attempt(started_at, AttemptResult::Error(error.to_string()));
                    tracing::Span::current().record("attempts", attempt);
                    return Err(error.into());
                }
                outcome = inner.transport.send(wire) => outcome,
            };

            let decision = match &outcome {
                Ok(response) => {
                    request.record_attempt(
                        started_at,
                        AttemptResult::Status(response.status().as_u16()),
                    );
                    debug!(attempt, status = response.status().as_u16(), "received response");
                    inner.retry_policy.should_retry(
                        context,
                        &AttemptOutcome::Response {
                            status: response.status(),
                            headers: response.headers(),
                        },
                    )
                }
                Err(error) => {
                    request.record_attempt(started_at, AttemptResult::Error(error.to_string()));
                    debug!(attempt, error = %error, "attempt failed");
                    inner
                        .retry_policy
                        .should_retry(context, &AttemptOutcome::Transport(error))
                }
            };
            tracing::Span::current().record("attempts", attempt);

            let cause = match decision {
                RetryDecision::Accept => match outcome {
                    Ok(response) => break response,
                    Err(error) => return Err(gave_up(&request, AttemptError::Transport(error))),
                },
                RetryDecision::Fail(AttemptError::Context(error)) => return Err(error.into()),
                RetryDecision::Fail(cause) => {
                    warn!(attempt, cause = %cause, "giving up after non-retryable outcome");
                    return Err(gave_up(&request, cause));
                }
                RetryDecision::Retry(cause) => cause,
            };

            let remaining = inner.max_attempts.saturating_sub(attempt);
            if remaining == 0 {
                warn!(attempt, cause = %cause, "giving up after exhausting attempts");
                return Err(gave_up(&request, cause));
            }

            let delay = inner.backoff.wait(
                inner.min_backoff,
                inner.max_backoff,
                attempt - 1,
                outcome.as_ref().ok().map(http::Response::headers),
            );
            drop(outcome);
            warn!(
                attempt,
                remaining,
                delay_ms = delay.as_millis() as u64,
                cause = %cause,
                "retrying request"
            );
            context.sleep(delay).await?;
        };

        let mut response = Response::new(request, raw);
        inner
            .pipeline
            .run_post_receive(&mut response, &inner.config)
            .await?;
        Ok(response)
    }
}

fn gave_up(request: &Request, cause: AttemptError) -> Error {
    Error::GaveUp {
        method: request.method().clone(),
        uri: request.uri().to_string(),
        attempts: request.attempt(),
        cause,
    }
}
