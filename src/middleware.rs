//! The fixed pre-send and post-receive chains.
//!
//! Pre-send runs the caller's steps in registration order, then the built-in
//! method check, request construction and body buffering. Post-receive runs the
//! built-in body read, size check and exchange dump, then the caller's steps.
//! The first error aborts the chain and is returned unchanged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::HeaderMap;
use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderValue};
use http_body_util::BodyExt;
use tracing::info;

use crate::config::ClientConfig;
use crate::content_encoding::{
    DecodeError, decode_body, has_decodable_body, remove_content_encoding_headers,
};
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::transport::DecodeOnRead;
use crate::util::append_cookie_pairs;

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'a>>;

/// Runs once per `execute` call, before the first network attempt.
pub trait PreSendStep: Send + Sync {
    fn run<'a>(&'a self, request: &'a mut Request, config: &'a ClientConfig) -> StepFuture<'a>;
}

/// Runs once per `execute` call, on the terminal response only.
pub trait PostReceiveStep: Send + Sync {
    fn run<'a>(&'a self, response: &'a mut Response, config: &'a ClientConfig)
    -> StepFuture<'a>;
}

/// Adapts a synchronous closure into a [`PreSendStep`].
pub struct PreSendFn<F>(F);

pub fn pre_send_fn<F>(step: F) -> PreSendFn<F>
where
    F: Fn(&mut Request, &ClientConfig) -> crate::Result<()> + Send + Sync,
{
    PreSendFn(step)
}

impl<F> PreSendStep for PreSendFn<F>
where
    F: Fn(&mut Request, &ClientConfig) -> crate::Result<()> + Send + Sync,
{
    fn run<'a>(&'a self, request: &'a mut Request, config: &'a ClientConfig) -> StepFuture<'a> {
        let result = (self.0)(request, config);
        Box::pin(std::future::ready(result))
    }
}

/// Adapts a synchronous closure into a [`PostReceiveStep`].
pub struct PostReceiveFn<F>(F);

pub fn post_receive_fn<F>(step: F) -> PostReceiveFn<F>
where
    F: Fn(&mut Response, &ClientConfig) -> crate::Result<()> + Send + Sync,
{
    PostReceiveFn(step)
}

impl<F> PostReceiveStep for PostReceiveFn<F>
where
    F: Fn(&mut Response, &ClientConfig) -> crate::Result<()> + Send + Sync,
{
    fn run<'a>(
        &'a self,
        response: &'a mut Response,
        config: &'a ClientConfig,
    ) -> StepFuture<'a> {
        let result = (self.0)(response, config);
        Box::pin(std::future::ready(result))
    }
}

pub(crate) struct VerifyMethod;

impl PreSendStep for VerifyMethod {
    fn run<'a>(&'a self, request: &'a mut Request, config: &'a ClientConfig) -> StepFuture<'a> {
        let result = if config.is_method_allowed(request.method()) {
            Ok(())
        } else {
            Err(Error::MethodNotAllowed {
                method: request.method().clone(),
            })
        };
        Box::pin(std::future::ready(result))
    }
}

pub(crate) struct ConstructRequest;

impl ConstructRequest {
    fn apply(request: &mut Request, config: &ClientConfig) -> crate::Result<()> {
        request.install_trace();
        request.set_close_connection(config.close_connection());

        let headers = request.headers_mut();
        merge_absent_headers(headers, config.default_headers());
        if !headers.contains_key(ACCEPT_LANGUAGE) {
            headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }
        append_cookie_pairs(
            headers,
            config
                .default_cookies()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
    }
}

impl PreSendStep for ConstructRequest {
    fn run<'a>(&'a self, request: &'a mut Request, config: &'a ClientConfig) -> StepFuture<'a> {
        Box::pin(std::future::ready(Self::apply(request, config)))
    }
}

fn merge_absent_headers(headers: &mut HeaderMap, defaults: &HeaderMap) {
    for name in defaults.keys() {
        if headers.contains_key(name) {
            continue;
        }
        for value in defaults.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

pub(crate) struct ReadRequestBody;

impl PreSendStep for ReadRequestBody {
    fn run<'a>(&'a self, request: &'a mut Request, _config: &'a ClientConfig) -> StepFuture<'a> {
        Box::pin(std::future::ready(request.materialize_body().map(|_| ())))
    }
}

pub(crate) struct ReadResponseBody;

impl PostReceiveStep for ReadResponseBody {
    fn run<'a>(
        &'a self,
        response: &'a mut Response,
        config: &'a ClientConfig,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(raw) = response.take_raw_body() else {
                return Ok(());
            };
            let method = response.request().method().clone();
            let uri = response.request().uri().to_string();
            let context = response.request().context().cloned().unwrap_or_default();
            let collected = tokio::select! {
                biased;
                error = context.done() => return Err(error.into()),
                collected = raw.collect() => collected,
            };
            let body = match collected {
                Ok(collected) => collected.to_bytes(),
                Err(source) => return Err(Error::ReadBody { method, uri, source }),
            };

            let decode = response.extensions().get::<DecodeOnRead>().is_some()
                && has_decodable_body(&method, response.status(), body.len());
            if !decode {
                response.set_body(body);
                return Ok(());
            }

            let limit = config.max_response_body_bytes();
            let decoded = decode_body(body, response.headers(), limit).map_err(|error| {
                match error {
                    DecodeError::Decode { encoding, message } => Error::DecodeContentEncoding {
                        encoding,
                        method: method.clone(),
                        uri: uri.clone(),
                        message,
                    },
                    DecodeError::TooLarge { actual_bytes } => Error::ResponseTooLarge {
                        limit_bytes: limit,
                        actual_bytes,
                        method: method.clone(),
                        uri: uri.clone(),
                    },
                }
            })?;
            remove_content_encoding_headers(response.headers_mut());
            response.set_body(decoded);
            Ok(())
        })
    }
}

pub(crate) struct VerifyBodySize;

impl PostReceiveStep for VerifyBodySize {
    fn run<'a>(
        &'a self,
        response: &'a mut Response,
        config: &'a ClientConfig,
    ) -> StepFuture<'a> {
        let limit = config.max_response_body_bytes();
        let actual = response.body().len();
        let result = if actual > limit {
            Err(Error::ResponseTooLarge {
                limit_bytes: limit,
                actual_bytes: actual,
                method: response.request().method().clone(),
                uri: response.request().uri().to_string(),
            })
        } else {
            Ok(())
        };
        Box::pin(std::future::ready(result))
    }
}

pub(crate) struct DumpExchange;

impl DumpExchange {
    fn emit(response: &Response) -> crate::Result<()> {
        let request = response.request();
        let request_text = request.dump()?;
        let response_text = response.dump()?;
        info!(
            method = %request.method(),
            url = %request.uri(),
            protocol = ?response.version(),
            host = request.uri().host().unwrap_or_default(),
            status = response.status().as_u16(),
            latency_ms = response.latency().as_millis() as u64,
            attempts = request.attempt(),
            received_at = %httpdate::fmt_http_date(response.received_at_wall()),
            request = %request_text,
            response = %response_text,
            "http exchange"
        );
        Ok(())
    }
}

impl PostReceiveStep for DumpExchange {
    fn run<'a>(
        &'a self,
        response: &'a mut Response,
        config: &'a ClientConfig,
    ) -> StepFuture<'a> {
        let result = if config.debug() {
            Self::emit(response)
        } else {
            Ok(())
        };
        Box::pin(std::future::ready(result))
    }
}

/// Both chains, sealed when the client is built.
#[derive(Clone)]
pub(crate) struct Pipeline {
    pre_send: Vec<Arc<dyn PreSendStep>>,
    post_receive: Vec<Arc<dyn PostReceiveStep>>,
}

impl Pipeline {
    pub(crate) fn seal(
        mut pre_send: Vec<Arc<dyn PreSendStep>>,
        post_receive: Vec<Arc<dyn PostReceiveStep>>,
    ) -> Self {
        pre_send.push(Arc::new(VerifyMethod));
        pre_send.push(Arc::new(ConstructRequest));
        pre_send.push(Arc::new(ReadRequestBody));

        let mut sealed_post_receive: Vec<Arc<dyn PostReceiveStep>> = vec![
            Arc::new(ReadResponseBody),
            Arc::new(VerifyBodySize),
            Arc::new(DumpExchange),
        ];
        sealed_post_receive.extend(post_receive);

        Self {
            pre_send,
            post_receive: sealed_post_receive,
        }
    }

    pub(crate) async fn run_pre_send(
        &self,
        request: &mut Request,
        config: &ClientConfig,
    ) -> crate::Result<()> {
        for step in &self.pre_send {
            step.run(request, config).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_post_receive(
        &self,
        response: &mut Response,
        config: &ClientConfig,
    ) -> crate::Result<()> {
        for step in &self.post_receive {
            step.run(response, config).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> (usize, usize) {
        (self.pre_send.len(), self.post_receive.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use http::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderValue, USER_AGENT};
    use http::{HeaderMap, Method};

    use super::{
        ConstructRequest, DumpExchange, Pipeline, PostReceiveStep, PreSendStep, ReadResponseBody,
        VerifyBodySize, VerifyMethod, post_receive_fn, pre_send_fn,
    };
    use crate::config::{ClientConfig, ClientOptions};
    use crate::context::CallContext;
    use crate::error::{BoxError, ContextError, Error, ErrorCode};
    use crate::request::Request;
    use crate::response::Response;
    use crate::transport::full_body;

    fn config(options: ClientOptions) -> ClientConfig {
        ClientConfig::from_options(&options)
    }

    fn response_with_body(body: &'static [u8]) -> Response {
        let request = Request::get("http://127.0.0.1:1/").expect("uri");
        let raw = http::Response::new(full_body(Bytes::from_static(body)));
        Response::new(request, raw)
    }

    #[tokio::test]
    async fn verify_method_rejects_disallowed_methods() {
        let config = config(ClientOptions {
            allowed_methods: vec![Method::GET],
            ..ClientOptions::default()
        });
        let mut request = Request::post("http://127.0.0.1:1/").expect("uri");
        let error = VerifyMethod
            .run(&mut request, &config)
            .await
            .expect_err("post not allowed");
        assert!(matches!(error, Error::MethodNotAllowed { method } if method == Method::POST));
    }

    #[tokio::test]
    async fn construct_request_fills_defaults_without_overwriting() {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static("xhttp-default"));
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let config = config(ClientOptions {
            default_headers,
            default_cookies: vec![("a".to_owned(), "1".to_owned()), ("b".to_owned(), "2".to_owned())],
            close_connection: true,
            ..ClientOptions::default()
        });

        let mut request = Request::get("http://127.0.0.1:1/")
            .expect("uri")
            .header(USER_AGENT, HeaderValue::from_static("caller"))
            .header(COOKIE, HeaderValue::from_static("session=xyz"));
        ConstructRequest
            .run(&mut request, &config)
            .await
            .expect("construct");

        let headers = request.headers();
        assert_eq!(headers.get(USER_AGENT).expect("ua"), "caller");
        assert_eq!(headers.get(ACCEPT).expect("accept"), "application/json");
        assert_eq!(headers.get(ACCEPT_LANGUAGE).expect("language"), "en");
        assert_eq!(headers.get(COOKIE).expect("cookie"), "session=xyz; a=1; b=2");
        assert!(request.close_connection());
    }

    #[tokio::test]
    async fn construct_request_defaults_accept_headers() {
        let mut request = Request::get("http://127.0.0.1:1/").expect("uri");
        ConstructRequest
            .run(&mut request, &ClientConfig::default())
            .await
            .expect("construct");
        assert_eq!(request.headers().get(ACCEPT).expect("accept"), "*/*");
        assert!(request.headers().get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn verify_body_size_reports_limit_and_actual() {
        let config = config(ClientOptions {
            max_response_body_bytes: 4,
            ..ClientOptions::default()
        });
        let mut response = response_with_body(b"");
        response.set_body(Bytes::from_static(b"too long"));
        let error = VerifyBodySize
            .run(&mut response, &config)
            .await
            .expect_err("too large");
        assert!(matches!(
            error,
            Error::ResponseTooLarge { limit_bytes: 4, actual_bytes: 8, .. }
        ));
    }

    /// A body whose next frame never arrives.
    struct StalledBody;

    impl hyper::body::Body for StalledBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn read_response_body_gives_up_when_the_context_finishes() {
        use http_body_util::BodyExt;

        let context = CallContext::new();
        let mut request = Request::get("http://127.0.0.1:1/").expect("uri");
        request.reset_for_execution(context.clone());
        let raw = http::Response::new(StalledBody.boxed_unsync());
        let mut response = Response::new(request, raw);

        let canceler = context.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            canceler.cancel();
        });
        let error = ReadResponseBody
            .run(&mut response, &ClientConfig::default())
            .await
            .expect_err("canceled while reading");
        assert!(matches!(error, Error::Context(ContextError::Canceled)));
    }

    #[tokio::test]
    async fn dump_exchange_renders_when_debug_is_on() {
        let config = config(ClientOptions {
            debug: true,
            ..ClientOptions::default()
        });
        let mut response = response_with_body(b"");
        response.set_body(Bytes::from_static(b"dumped"));
        DumpExchange
            .run(&mut response, &config)
            .await
            .expect("visible ascii headers render");
        assert!(response.received_at_wall() <= std::time::SystemTime::now());
    }

    #[tokio::test]
    async fn user_steps_surround_built_ins_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let after = order.clone();
        let pipeline = Pipeline::seal(
            vec![
                Arc::new(pre_send_fn(move |request: &mut Request, _: &ClientConfig| {
                    first.lock().expect("order").push("first");
                    request.set_header("x-step", "1")
                })) as Arc<dyn PreSendStep>,
                Arc::new(pre_send_fn(move |_: &mut Request, _: &ClientConfig| {
                    second.lock().expect("order").push("second");
                    Ok(())
                })),
            ],
            vec![Arc::new(post_receive_fn(move |response: &mut Response, _: &ClientConfig| {
                let body = response.text_lossy();
                after.lock().expect("order").push(if body == "done" { "after-read" } else { "unread" });
                Ok(())
            })) as Arc<dyn PostReceiveStep>],
        );
        assert_eq!(pipeline.len(), (5, 4));

        let config = ClientConfig::default();
        let mut request = Request::get("http://127.0.0.1:1/").expect("uri");
        pipeline
            .run_pre_send(&mut request, &config)
            .await
            .expect("pre-send");
        assert_eq!(request.headers().get("x-step").expect("step header"), "1");
        assert_eq!(request.buffered_body(), Some(&Bytes::new()));

        let mut response = response_with_body(b"done");
        pipeline
            .run_post_receive(&mut response, &config)
            .await
            .expect("post-receive");
        assert_eq!(
            *order.lock().expect("order"),
            vec!["first", "second", "after-read"]
        );
    }

    #[tokio::test]
    async fn first_failing_step_aborts_the_chain() {
        let reached = Arc::new(Mutex::new(false));
        let flag = reached.clone();
        let pipeline = Pipeline::seal(
            vec![
                Arc::new(pre_send_fn(|_: &mut Request, _: &ClientConfig| {
                    Err(Error::InvalidUri {
                        uri: "rejected".to_owned(),
                    })
                })) as Arc<dyn PreSendStep>,
                Arc::new(pre_send_fn(move |_: &mut Request, _: &ClientConfig| {
                    *flag.lock().expect("flag") = true;
                    Ok(())
                })),
            ],
            Vec::new(),
        );
        let mut request = Request::get("http://127.0.0.1:1/").expect("uri");
        let error = pipeline
            .run_pre_send(&mut request, &ClientConfig::default())
            .await
            .expect_err("aborted");
        assert_eq!(error.code(), ErrorCode::InvalidUri);
        assert!(!*reached.lock().expect("flag"));
        assert!(request.buffered_body().is_none());
    }
}
