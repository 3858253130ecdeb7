use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{TransportError, TransportErrorKind};
use crate::util::lock_unpoisoned;

const PER_HOST_LIMITER_ENTRY_TTL: Duration = Duration::from_secs(300);
const PER_HOST_LIMITER_MAX_ENTRIES: usize = 1024;

struct PerHostLimiterEntry {
    semaphore: Arc<Semaphore>,
    last_used_at: Instant,
}

impl PerHostLimiterEntry {
    fn is_idle(&self, limit: usize) -> bool {
        self.semaphore.available_permits() == limit
    }
}

/// Caps concurrent connections per `host:port`. A permit is held until the
/// response body is dropped.
#[derive(Clone)]
pub(crate) struct HostLimiter {
    limit: usize,
    per_host: Arc<Mutex<BTreeMap<String, PerHostLimiterEntry>>>,
}

impl HostLimiter {
    /// `None` when `limit` is 0, meaning unbounded.
    pub(crate) fn new(limit: usize) -> Option<Self> {
        (limit > 0).then(|| Self {
            limit,
            per_host: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub(crate) async fn acquire(&self, key: String) -> Result<OwnedSemaphorePermit, TransportError> {
        let semaphore = {
            let mut guard = lock_unpoisoned(&self.per_host);
            let now = Instant::now();
            cleanup_stale_entries(&mut guard, self.limit, now);
            let entry = guard.entry(key).or_insert_with(|| PerHostLimiterEntry {
                semaphore: Arc::new(Semaphore::new(self.limit)),
                last_used_at: now,
            });
            entry.last_used_at = now;
            entry.semaphore.clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|error| TransportError::new(TransportErrorKind::Other, error))
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        lock_unpoisoned(&self.per_host).len()
    }
}

fn cleanup_stale_entries(
    entries: &mut BTreeMap<String, PerHostLimiterEntry>,
    limit: usize,
    now: Instant,
) {
    entries.retain(|_, entry| {
        !entry.is_idle(limit) || now.duration_since(entry.last_used_at) <= PER_HOST_LIMITER_ENTRY_TTL
    });

    while entries.len() > PER_HOST_LIMITER_MAX_ENTRIES {
        let oldest_key = entries
            .iter()
            .filter(|(_, entry)| entry.is_idle(limit))
            .min_by_key(|(_, entry)| entry.last_used_at)
            .map(|(host, _)| host.clone());
        let Some(oldest_key) = oldest_key else {
            break;
        };
        entries.remove(&oldest_key);
    }
}

/// Response body that releases its host permit when dropped.
pub(crate) struct PermitBody<B> {
    inner: B,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<B> PermitBody<B> {
    pub(crate) fn new(inner: B, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            inner,
            _permit: permit,
        }
    }
}

impl<B> Body for PermitBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HostLimiter;

    #[test]
    fn zero_limit_means_unbounded() {
        assert!(HostLimiter::new(0).is_none());
    }

    #[tokio::test]
    async fn second_permit_waits_for_the_first_to_drop() {
        let limiter = HostLimiter::new(1).expect("limiter");
        let first = limiter
            .acquire("127.0.0.1:80".to_owned())
            .await
            .expect("first permit");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire("127.0.0.1:80".to_owned()))
                .await;
        assert!(blocked.is_err());

        let other_host = limiter
            .acquire("127.0.0.2:80".to_owned())
            .await
            .expect("independent host");
        drop(other_host);

        drop(first);
        limiter
            .acquire("127.0.0.1:80".to_owned())
            .await
            .expect("released permit");
        assert_eq!(limiter.tracked_hosts(), 2);
    }
}
