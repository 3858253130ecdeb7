use std::collections::BTreeSet;

use http::{HeaderMap, StatusCode};

use crate::context::CallContext;
use crate::error::{AttemptError, TransportError, TransportErrorKind};

/// What one network call produced, as seen by a [`RetryPolicy`].
#[derive(Clone, Copy, Debug)]
pub enum AttemptOutcome<'a> {
    Response {
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    Transport(&'a TransportError),
}

#[derive(Debug)]
pub enum RetryDecision {
    /// Transient condition; retry if attempts remain, otherwise give up with this cause.
    Retry(AttemptError),
    /// Terminal success: the response is handed to the post-receive chain.
    Accept,
    /// Terminal failure with the real cause.
    Fail(AttemptError),
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, context: &CallContext, outcome: &AttemptOutcome<'_>) -> RetryDecision;
}

/// Retries transport failures and a configured set of response statuses.
///
/// A transport error observed after the call context finished is reported as the
/// context error and never retried.
#[derive(Clone, Debug)]
pub struct StandardRetryPolicy {
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
}

impl StandardRetryPolicy {
    pub fn new() -> Self {
        Self {
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
        }
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }
}

impl Default for StandardRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for StandardRetryPolicy {
    fn should_retry(&self, context: &CallContext, outcome: &AttemptOutcome<'_>) -> RetryDecision {
        match outcome {
            AttemptOutcome::Transport(error) => {
                if let Some(context_error) = context.err() {
                    return RetryDecision::Fail(AttemptError::Context(context_error));
                }
                let cause = AttemptError::Transport((*error).clone());
                if self.retryable_transport_error_kinds.contains(&error.kind()) {
                    RetryDecision::Retry(cause)
                } else {
                    RetryDecision::Fail(cause)
                }
            }
            AttemptOutcome::Response { status, .. } => {
                if self.is_retryable_status(*status) {
                    RetryDecision::Retry(AttemptError::Status { status: *status })
                } else {
                    RetryDecision::Accept
                }
            }
        }
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
        TransportErrorKind::Timeout,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, StatusCode};

    use super::{AttemptOutcome, RetryDecision, RetryPolicy, StandardRetryPolicy};
    use crate::context::CallContext;
    use crate::error::{AttemptError, ContextError, TransportError, TransportErrorKind};

    fn response(status: u16) -> (StatusCode, HeaderMap) {
        (
            StatusCode::from_u16(status).expect("valid status"),
            HeaderMap::new(),
        )
    }

    #[test]
    fn retries_configured_statuses_and_accepts_everything_else() {
        let policy = StandardRetryPolicy::new();
        let context = CallContext::new();
        for code in [429, 500, 502, 503, 504] {
            let (status, headers) = response(code);
            let decision = policy.should_retry(
                &context,
                &AttemptOutcome::Response {
                    status,
                    headers: &headers,
                },
            );
            assert!(
                matches!(decision, RetryDecision::Retry(AttemptError::Status { status: s }) if s == status)
            );
        }
        for code in [200, 301, 404, 501] {
            let (status, headers) = response(code);
            let decision = policy.should_retry(
                &context,
                &AttemptOutcome::Response {
                    status,
                    headers: &headers,
                },
            );
            assert!(matches!(decision, RetryDecision::Accept), "status {code}");
        }
    }

    #[test]
    fn transport_errors_retry_unless_tls() {
        let policy = StandardRetryPolicy::new();
        let context = CallContext::new();
        let refused = TransportError::new(TransportErrorKind::Connect, "connection refused");
        assert!(
            policy
                .should_retry(&context, &AttemptOutcome::Transport(&refused))
                .is_retry()
        );

        let tls = TransportError::new(TransportErrorKind::Tls, "bad certificate");
        assert!(matches!(
            policy.should_retry(&context, &AttemptOutcome::Transport(&tls)),
            RetryDecision::Fail(AttemptError::Transport(_))
        ));
    }

    #[test]
    fn transport_error_after_cancellation_is_terminal_context_error() {
        let policy = StandardRetryPolicy::new();
        let context = CallContext::new();
        context.cancel();
        let reset = TransportError::new(TransportErrorKind::Read, "connection reset");
        assert!(matches!(
            policy.should_retry(&context, &AttemptOutcome::Transport(&reset)),
            RetryDecision::Fail(AttemptError::Context(ContextError::Canceled))
        ));
    }

    #[test]
    fn custom_status_set_replaces_defaults() {
        let policy = StandardRetryPolicy::new().retryable_status_codes([418]);
        let context = CallContext::new();
        let (teapot, headers) = response(418);
        assert!(
            policy
                .should_retry(
                    &context,
                    &AttemptOutcome::Response {
                        status: teapot,
                        headers: &headers,
                    },
                )
                .is_retry()
        );
        let (unavailable, headers) = response(503);
        assert!(matches!(
            policy.should_retry(
                &context,
                &AttemptOutcome::Response {
                    status: unavailable,
                    headers: &headers,
                },
            ),
            RetryDecision::Accept
        ));
    }
}
