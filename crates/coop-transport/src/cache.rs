//! Short-TTL conditional-fetch cache
//!
//! Peers poll each other's key resource with `If-Modified-Since`. The cache
//! sits in front of the transport so concurrent discovery attempts against
//! the same peer share one round trip.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CACHE_CONTROL, DATE, IF_MODIFIED_SINCE};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tracing::trace;

use coop_core::{header_str, Body, CoopResult, HttpTime, Request, Response};

use crate::Transport;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    url: String,
    if_modified_since: Option<String>,
}

impl CacheKey {
    fn of(request: &Request) -> Self {
        CacheKey {
            url: request.url.clone(),
            if_modified_since: request.header(IF_MODIFIED_SINCE).map(str::to_string),
        }
    }
}

#[derive(Clone, Debug)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
    expires_at: Instant,
    seq: u64,
}

impl CachedResponse {
    fn to_response(&self) -> Response {
        let body = match &self.body {
            Some(bytes) => Body::Full(bytes.clone()),
            None => Body::Empty,
        };
        let mut res = http::Response::new(body);
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers.clone();
        res
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CachedResponse>,
    next_seq: u64,
}

/// Response cache keyed by request URL and conditional headers
///
/// Concurrent population is last-writer-wins per key.
pub struct ResponseCache {
    default_max_age: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(default_max_age: Duration, capacity: usize) -> Self {
        ResponseCache {
            default_max_age,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Fresh cached response for `request`, if any
    pub fn lookup(&self, request: &Request) -> Option<Response> {
        let key = CacheKey::of(request);
        let mut inner = self.inner.lock();
        match inner.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.to_response()),
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Remember `response` for `request` and hand it back.
    ///
    /// Streaming bodies and `no-store` exchanges pass through untouched.
    pub fn store(&self, request: &Request, response: Response) -> Response {
        if !matches!(response.status(), StatusCode::OK | StatusCode::NOT_MODIFIED)
            || request.header(CACHE_CONTROL).is_some_and(no_store)
            || header_str(response.headers(), CACHE_CONTROL).is_some_and(no_store)
        {
            return response;
        }
        let body = match response.body() {
            Body::Full(bytes) => Some(bytes.clone()),
            Body::Empty => None,
            Body::Events(_) => return response,
        };

        let ttl = self.time_to_live(response.headers());
        if ttl.is_zero() {
            return response;
        }

        let key = CacheKey::of(request);
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            evict_oldest(&mut inner.entries);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        trace!(url = %key.url, ttl_secs = ttl.as_secs(), "cached response");
        inner.entries.insert(
            key,
            CachedResponse {
                status: response.status(),
                headers: response.headers().clone(),
                body,
                expires_at: Instant::now() + ttl,
                seq,
            },
        );
        response
    }

    /// Drop every entry for `url`, whatever its conditional headers.
    pub fn invalidate(&self, url: &str) {
        self.inner.lock().entries.retain(|key, _| key.url != url);
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer from the cache, or fetch through `transport` and store.
    pub async fn fetch_with(
        &self,
        transport: &dyn Transport,
        request: Request,
    ) -> CoopResult<Response> {
        if let Some(hit) = self.lookup(&request) {
            trace!(url = %request.url, "cache hit");
            return Ok(hit);
        }
        let response = transport.fetch(request.clone()).await?;
        Ok(self.store(&request, response))
    }

    /// Remaining lifetime: `max-age` (or the default) minus the age implied
    /// by the `Date` header.
    fn time_to_live(&self, headers: &HeaderMap) -> Duration {
        let max_age = header_str(headers, CACHE_CONTROL)
            .and_then(max_age)
            .unwrap_or(self.default_max_age);

        let age = header_str(headers, DATE)
            .and_then(|date| HttpTime::parse(date).ok())
            .map(|date| {
                let secs = HttpTime::now().as_unix_secs() - date.as_unix_secs();
                Duration::from_secs(secs.max(0) as u64)
            })
            .unwrap_or_default();

        max_age.saturating_sub(age)
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        ResponseCache::new(DEFAULT_MAX_AGE, DEFAULT_CAPACITY)
    }
}

fn evict_oldest(entries: &mut HashMap<CacheKey, CachedResponse>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.seq)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}

/// Cache-Control directives; some peers separate them with `;`
fn directives(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|d| !d.is_empty())
}

fn no_store(value: &str) -> bool {
    directives(value).any(|d| d.eq_ignore_ascii_case("no-store"))
}

fn max_age(value: &str) -> Option<Duration> {
    directives(value).find_map(|d| {
        let (name, secs) = d.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        secs.trim().parse().ok().map(Duration::from_secs)
    })
}
