//! Key Registry - the topics that make a node discoverable
//!
//! Two nodes follow each other while their key sets intersect. The registry
//! serves the key resource; the fetcher reads a peer's key resource through
//! the conditional-fetch cache.

use std::collections::BTreeSet;

use http::header::{CACHE_CONTROL, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED};
use http::StatusCode;
use tracing::trace;

use coop_core::{
    not_modified, response, Body, CoopError, CoopEvent, CoopResult, CoopUri, HttpTime,
    KeyChange, KeysDocument, Request, Response, APPLICATION_JSON,
};
use coop_transport::{ResponseCache, Transport};

/// `Cache-Control` of the key resource
pub const KEYS_CACHE_CONTROL: &str = "max-age=60";

/// `If-Modified-Since` of an inbound request, if present and well formed
pub fn if_modified_since(request: &Request) -> Option<HttpTime> {
    request
        .header(IF_MODIFIED_SINCE)
        .and_then(|value| HttpTime::parse(value).ok())
}

/// Local key set
#[derive(Clone, Debug)]
pub struct KeyRegistry {
    uri: CoopUri,
    keys: BTreeSet<String>,
    last_modified: HttpTime,
}

impl KeyRegistry {
    pub fn new(uri: CoopUri) -> Self {
        KeyRegistry {
            uri,
            keys: BTreeSet::new(),
            last_modified: HttpTime::now(),
        }
    }

    pub fn uri(&self) -> &CoopUri {
        &self.uri
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn current_keys(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn last_modified(&self) -> HttpTime {
        self.last_modified
    }

    /// Add a key. Returns the `key-added` event, or `None` if already present.
    pub fn add(&mut self, key: &str) -> CoopResult<Option<CoopEvent>> {
        if key.is_empty() {
            return Err(CoopError::InvalidArgument("key must be non-empty".into()));
        }
        if !self.keys.insert(key.to_string()) {
            return Ok(None);
        }
        self.last_modified = HttpTime::now();
        Ok(Some(CoopEvent::KeyAdded(self.change(key))))
    }

    /// Remove a key. Returns the `key-removed` event, or `None` if absent.
    pub fn remove(&mut self, key: &str) -> Option<CoopEvent> {
        if !self.keys.remove(key) {
            return None;
        }
        self.last_modified = HttpTime::now();
        Some(CoopEvent::KeyRemoved(self.change(key)))
    }

    pub fn document(&self) -> KeysDocument {
        KeysDocument {
            uri: self.uri.clone(),
            keys: self.current_keys(),
            time: self.last_modified,
        }
    }

    /// Answer a GET on the key resource.
    pub fn respond(&self, if_modified_since: Option<HttpTime>) -> CoopResult<Response> {
        if if_modified_since.is_some_and(|since| self.last_modified <= since) {
            return Ok(not_modified());
        }
        let last_modified = self.last_modified.to_http_date();
        Ok(response(
            StatusCode::OK,
            &[
                (CONTENT_TYPE, APPLICATION_JSON),
                (LAST_MODIFIED, &last_modified),
                (CACHE_CONTROL, KEYS_CACHE_CONTROL),
            ],
            Body::json(&self.document())?,
        ))
    }

    fn change(&self, key: &str) -> KeyChange {
        KeyChange {
            uri: self.uri.clone(),
            time: self.last_modified,
            key: key.to_string(),
        }
    }
}

/// A peer's key set as last fetched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedKeys {
    pub keys: Vec<String>,
    pub time: HttpTime,
}

/// Conditional reader of peers' key resources
pub struct KeyFetcher {
    cache: ResponseCache,
}

impl KeyFetcher {
    pub fn new(cache: ResponseCache) -> Self {
        KeyFetcher { cache }
    }

    /// Fetch `peer`'s key set.
    ///
    /// With `known` keys the request is conditional and a 304 hands them
    /// back. Any answer that is not a well-formed key document for `peer`
    /// is a `ProtocolViolation`.
    pub async fn fetch(
        &self,
        transport: &dyn Transport,
        peer: &CoopUri,
        known: Option<&FetchedKeys>,
    ) -> CoopResult<FetchedKeys> {
        let mut request = Request::get(peer.as_str());
        if let Some(known) = known {
            request = request.with_header(IF_MODIFIED_SINCE, &known.time.to_http_date());
        }

        let res = self.cache.fetch_with(transport, request).await?;
        match res.status() {
            StatusCode::NOT_MODIFIED => known.cloned().ok_or_else(|| {
                CoopError::ProtocolViolation(format!("{peer} answered 304 to a plain GET"))
            }),
            StatusCode::OK => {
                let doc: KeysDocument = res
                    .body()
                    .parse_json()
                    .map_err(|e| CoopError::ProtocolViolation(format!("{peer} key document: {e}")))?;
                if doc.uri != *peer {
                    return Err(CoopError::ProtocolViolation(format!(
                        "{peer} claims to be {}",
                        doc.uri
                    )));
                }
                trace!(peer = %peer, keys = doc.keys.len(), "fetched keys");
                Ok(FetchedKeys {
                    keys: doc.keys,
                    time: doc.time,
                })
            }
            status => Err(CoopError::ProtocolViolation(format!(
                "{peer} answered {status}"
            ))),
        }
    }

    /// Forget cached answers for `peer`
    pub fn invalidate(&self, peer: &CoopUri) {
        self.cache.invalidate(peer.as_str());
    }

    /// Forget every cached answer
    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl Default for KeyFetcher {
    fn default() -> Self {
        KeyFetcher::new(ResponseCache::default())
    }
}
