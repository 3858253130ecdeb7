use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{HeaderValue, SET_COOKIE};
use http::{HeaderMap, Uri};

use crate::util::lock_unpoisoned;

/// Cookie storage consulted by the transport on every hop, redirects included.
///
/// One store may be shared by several clients through an `Arc`.
pub trait CookieStore: Send + Sync {
    /// The `Cookie` header value to send to `uri`, if any cookie matches.
    fn cookies_for(&self, uri: &Uri) -> Option<HeaderValue>;

    fn store_response_cookies(&self, uri: &Uri, headers: &HeaderMap);
}

#[derive(Clone, Debug)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn parse(set_cookie: &str, uri: &Uri, now: SystemTime) -> Option<Self> {
        let host = uri.host()?.to_ascii_lowercase();
        let mut parts = set_cookie.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            domain: host.clone(),
            host_only: true,
            path: default_path(uri.path()),
            secure: false,
            expires: None,
        };
        let mut max_age_seen = false;
        for attribute in parts {
            let (key, raw_value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (attribute.trim(), ""),
            };
            if key.eq_ignore_ascii_case("domain") {
                let domain = raw_value.trim_start_matches('.').to_ascii_lowercase();
                if domain.is_empty() {
                    continue;
                }
                if !domain_matches(&host, &domain) {
                    return None;
                }
                if is_public_suffix(&domain) {
                    if domain == host {
                        continue;
                    }
                    return None;
                }
                cookie.domain = domain;
                cookie.host_only = false;
            } else if key.eq_ignore_ascii_case("path") {
                if raw_value.starts_with('/') {
                    cookie.path = raw_value.to_owned();
                }
            } else if key.eq_ignore_ascii_case("max-age") {
                let Ok(seconds) = raw_value.parse::<i64>() else {
                    continue;
                };
                max_age_seen = true;
                cookie.expires = Some(if seconds <= 0 {
                    SystemTime::UNIX_EPOCH
                } else {
                    now + Duration::from_secs(seconds.unsigned_abs())
                });
            } else if key.eq_ignore_ascii_case("expires") {
                if !max_age_seen && let Ok(expires) = httpdate::parse_http_date(raw_value) {
                    cookie.expires = Some(expires);
                }
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            }
        }
        Some(cookie)
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn matches(&self, host: &str, path: &str, secure_channel: bool) -> bool {
        if self.secure && !secure_channel {
            return false;
        }
        let host_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(host, &self.domain)
        };
        host_ok && path_matches(path, &self.path)
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// `Domain=` may not widen a cookie to a public suffix such as `com` or `co.uk`.
fn is_public_suffix(domain: &str) -> bool {
    psl::suffix_str(domain) == Some(domain)
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// In-memory cookie jar keyed by domain and path. Nothing is persisted.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one `Set-Cookie` header value as if `uri` had sent it.
    pub fn add_cookie_str(&self, set_cookie: &str, uri: &Uri) {
        let now = SystemTime::now();
        let Some(cookie) = StoredCookie::parse(set_cookie, uri, now) else {
            return;
        };
        let mut cookies = lock_unpoisoned(&self.cookies);
        cookies.retain(|existing| !existing.same_identity(&cookie));
        if !cookie.is_expired(now) {
            cookies.push(cookie);
        }
    }

    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        lock_unpoisoned(&self.cookies)
            .iter()
            .filter(|cookie| !cookie.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.cookies).clear();
    }
}

impl CookieStore for CookieJar {
    fn cookies_for(&self, uri: &Uri) -> Option<HeaderValue> {
        let host = uri.host()?.to_ascii_lowercase();
        let path = if uri.path().is_empty() { "/" } else { uri.path() };
        let secure_channel = uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        let now = SystemTime::now();

        let mut cookies = lock_unpoisoned(&self.cookies);
        cookies.retain(|cookie| !cookie.is_expired(now));
        let mut matching: Vec<&StoredCookie> = cookies
            .iter()
            .filter(|cookie| cookie.matches(&host, path, secure_channel))
            .collect();
        if matching.is_empty() {
            return None;
        }
        // Longer paths first; the sort is stable so ties keep insertion order.
        matching.sort_by(|left, right| right.path.len().cmp(&left.path.len()));
        let joined = matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    fn store_response_cookies(&self, uri: &Uri, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(text) = value.to_str() {
                self.add_cookie_str(text, uri);
            }
        }
    }
}
