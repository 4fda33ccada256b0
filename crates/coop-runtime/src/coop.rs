//! Coop - discovery orchestrator
//!
//! One `Coop` per node. It serves the three well-known resources, treats
//! every inbound request as a hint that the requester might be a coop peer,
//! and follows peers that share a key with it: their list snapshot is merged
//! and their event resource is pumped into the local bus.
//!
//! All four stores sit behind one mutex that is never held across an await.
//! Network calls (key fetch, list fetch, event-source open) are the only
//! suspension points.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use http::header::{CONTENT_TYPE, HeaderName};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use coop_core::{
    response, AdvertisedCoop, Body, CoopError, CoopEvent, CoopNaming, CoopResult, CoopUri,
    HttpTime, MainnetConnected, Request, Response, WellKnown, LAST_EVENT_ID, TEXT_EVENT_STREAM,
};
use coop_state::{
    check_event, if_modified_since, shared_keys, FetchedKeys, Followings, KeyFetcher, KeyRegistry,
    LinkStore, MergedList, MultiProps, Prop, Props,
};
use coop_transport::{EventLog, FetchEvent, HandlerId, RequestHandler, ResponseCache, Transport};

use crate::{CoopConfig, Watch, Watchers};

/// A node announced by a local-network discovery source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub uri: String,
    pub keys: Vec<String>,
}

struct NodeState {
    keys: KeyRegistry,
    links: LinkStore,
    list: MergedList,
    followings: Followings,
    /// Mid-check guard
    checking: HashSet<CoopUri>,
    /// Seen `(key, time)` of `key-added` per source
    seen_keys: HashMap<CoopUri, VecDeque<(String, HttpTime)>>,
}

struct Inner {
    uri: CoopUri,
    naming: CoopNaming,
    config: CoopConfig,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    state: Mutex<NodeState>,
    fetcher: KeyFetcher,
    bus: Watchers,
    log: EventLog,
    handler: Mutex<Option<HandlerId>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to a running coop node
///
/// Cloning is cheap; all clones drive the same node.
#[derive(Clone)]
pub struct Coop {
    inner: Arc<Inner>,
}

impl Coop {
    /// Start a node on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(transport: Arc<dyn Transport>, config: CoopConfig) -> CoopResult<Self> {
        config
            .validate()
            .map_err(|e| CoopError::InvalidArgument(e.to_string()))?;
        let runtime = Handle::try_current()
            .map_err(|e| CoopError::InvalidArgument(format!("no tokio runtime: {e}")))?;

        let naming = config.naming();
        let uri = naming.coop_uri(&transport.local_peer());
        let inner = Arc::new(Inner {
            state: Mutex::new(NodeState {
                keys: KeyRegistry::new(uri.clone()),
                links: LinkStore::new(uri.clone()),
                list: MergedList::new(),
                followings: Followings::new(),
                checking: HashSet::new(),
                seen_keys: HashMap::new(),
            }),
            fetcher: KeyFetcher::new(ResponseCache::new(
                config.key_cache_max_age,
                config.key_cache_capacity,
            )),
            bus: Watchers::new(config.watch_capacity),
            log: EventLog::new(config.event_history),
            handler: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            uri,
            naming,
            config,
            transport,
            runtime,
        });

        let links = inner.bus.tap(|e| e.event_type().is_link());
        let detected = inner.bus.tap(|e| matches!(e, CoopEvent::CoopDetected(_)));
        let keys = inner.bus.tap(|e| matches!(e, CoopEvent::KeyAdded(_)));
        let loops = vec![
            inner.spawn_loop(links, Inner::on_link_event),
            inner.spawn_loop(detected, Inner::on_coop_detected),
            inner.spawn_loop(keys, Inner::on_key_added),
        ];
        *inner.loops.lock() = loops;

        let handler = WellKnownHandler {
            inner: Arc::downgrade(&inner),
        };
        let id = inner.transport.add_handler(Arc::new(handler));
        *inner.handler.lock() = Some(id);

        info!(coop = %inner.uri, "coop started");
        Ok(Coop { inner })
    }

    /// This node's coop URI
    pub fn uri(&self) -> &CoopUri {
        &self.inner.uri
    }

    pub fn naming(&self) -> &CoopNaming {
        &self.inner.naming
    }

    pub fn config(&self) -> &CoopConfig {
        &self.inner.config
    }

    /// Set properties of `target`. Rejected as a whole on any invalid pair.
    pub fn put<K, V>(&self, target: &str, props: impl IntoIterator<Item = (K, V)>) -> CoopResult<()>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.inner.ensure_running()?;
        let mut state = self.inner.state.lock();
        let events = state.links.put(target, props)?;
        for event in events {
            state.list.update_from_event(&event);
            self.inner.emit(event);
        }
        Ok(())
    }

    /// Remove properties `keys` of `target`
    pub fn drop<K: AsRef<str>>(
        &self,
        target: &str,
        keys: impl IntoIterator<Item = K>,
    ) -> CoopResult<()> {
        self.inner.ensure_running()?;
        let mut state = self.inner.state.lock();
        let events = state.links.drop(target, keys);
        for event in events {
            state.list.update_from_event(&event);
            self.inner.emit(event);
        }
        Ok(())
    }

    /// This node's own properties of `target`
    pub fn get_props(&self, target: &str) -> Props {
        self.inner.state.lock().links.get_props(target)
    }

    /// Merged properties of `target` from every source
    pub fn list_props(&self, target: &str) -> Vec<Prop> {
        self.inner.state.lock().list.get_props(target)
    }

    /// Merged properties of `target` grouped by key, then source
    pub fn get_multi_props(&self, target: &str) -> MultiProps {
        self.inner.state.lock().list.get_multi_props(target)
    }

    /// Targets of the merged view whose properties satisfy `predicate`.
    ///
    /// The predicate runs on a snapshot, outside the node lock, so it may
    /// call back into this node.
    pub fn find<P>(&self, predicate: P) -> Vec<String>
    where
        P: Fn(&[Prop]) -> bool,
    {
        let snapshot: Vec<(String, Vec<Prop>)> = self
            .inner
            .state
            .lock()
            .list
            .live()
            .map(|(target, props)| (target.to_string(), props))
            .collect();
        snapshot
            .into_iter()
            .filter(|(_, props)| predicate(props))
            .map(|(target, _)| target)
            .collect()
    }

    /// Live events matching `predicate`. Ends when the node stops.
    pub fn watch<F>(&self, predicate: F) -> Watch
    where
        F: Fn(&CoopEvent) -> bool + Send + 'static,
    {
        self.inner.bus.watch(predicate)
    }

    pub fn add_key(&self, key: &str) -> CoopResult<()> {
        self.inner.ensure_running()?;
        let reactivated = {
            let mut state = self.inner.state.lock();
            let Some(event) = state.keys.add(key)? else {
                return Ok(());
            };
            self.inner.emit(event);
            state.followings.holding_key(key)
        };

        // Intersections changed; cached peer key sets may hide a new match.
        self.inner.fetcher.clear();
        for uri in reactivated {
            if !self.inner.bus.is_watching(&uri) {
                self.inner.spawn_check(uri);
            }
        }
        Ok(())
    }

    pub fn remove_key(&self, key: &str) -> CoopResult<()> {
        self.inner.ensure_running()?;
        let detaching = {
            let mut state = self.inner.state.lock();
            let Some(event) = state.keys.remove(key) else {
                return Ok(());
            };
            self.inner.emit(event);
            state.followings.detaching_followings(state.keys.keys())
        };

        for uri in detaching {
            if self.inner.bus.close_remote(&uri) {
                info!(coop = %self.inner.uri, peer = %uri, "unfollowed");
            }
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().keys.current_keys()
    }

    /// Followed peers, most recently updated first
    pub fn followings(&self) -> Vec<CoopUri> {
        let state = self.inner.state.lock();
        state.followings.followings(state.keys.keys())
    }

    /// Known peers that no longer share a key
    pub fn detaching_followings(&self) -> Vec<CoopUri> {
        let state = self.inner.state.lock();
        state.followings.detaching_followings(state.keys.keys())
    }

    pub fn is_following(&self, uri: &CoopUri) -> bool {
        let state = self.inner.state.lock();
        state.followings.is_following(uri, state.keys.keys())
    }

    /// Offer a node found on the local network. Returns whether discovery
    /// was started.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let inner = &self.inner;
        if inner.is_stopped() {
            return false;
        }
        let uri = match inner.naming.parse(&advertisement.uri) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(coop = %inner.uri, error = %e, "ignored advertisement");
                return false;
            }
        };
        if uri == inner.uri || self.is_following(&uri) {
            return false;
        }

        inner.emit(CoopEvent::MainnetConnected(MainnetConnected {
            uri: inner.uri.clone(),
            time: HttpTime::now(),
            coop: AdvertisedCoop {
                uri: uri.clone(),
                keys: advertisement.keys,
            },
        }));
        inner.spawn_check(uri);
        true
    }

    /// Run discovery against `candidate` and wait for it to finish.
    pub async fn check_coop(&self, candidate: CoopUri) {
        self.inner.check_coop(candidate).await;
    }

    /// Stop serving and replicating. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }
}

impl std::fmt::Debug for Coop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coop")
            .field("uri", &self.inner.uri)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Releases the mid-check mark of a candidate on every exit path
struct CheckGuard<'a> {
    inner: &'a Inner,
    uri: CoopUri,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().checking.remove(&self.uri);
    }
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> CoopResult<()> {
        if self.is_stopped() {
            Err(CoopError::Closed)
        } else {
            Ok(())
        }
    }

    /// Publish a locally produced event to the event resource and the bus.
    fn emit(&self, event: CoopEvent) {
        self.log.dispatch(&event);
        self.bus.publish(event);
    }

    fn spawn_loop(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<CoopEvent>,
        on_event: fn(&Arc<Inner>, CoopEvent),
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                on_event(&inner, event);
            }
        })
    }

    fn spawn_check(self: &Arc<Self>, candidate: CoopUri) {
        if self.is_stopped() {
            return;
        }
        let inner = self.clone();
        self.runtime.spawn(async move {
            inner.check_coop(candidate).await;
        });
    }

    fn on_link_event(self: &Arc<Self>, event: CoopEvent) {
        self.state.lock().list.update_from_event(&event);
    }

    fn on_coop_detected(self: &Arc<Self>, event: CoopEvent) {
        if event.source() == &self.uri {
            return;
        }
        if let Some(announced) = check_event(&event, &self.naming) {
            self.spawn_check(announced);
        }
    }

    fn on_key_added(self: &Arc<Self>, event: CoopEvent) {
        let CoopEvent::KeyAdded(change) = &event else {
            return;
        };
        if change.uri == self.uri {
            return;
        }

        let ours = {
            let mut state = self.state.lock();
            let seen = state.seen_keys.entry(change.uri.clone()).or_default();
            let entry = (change.key.clone(), change.time);
            if seen.contains(&entry) {
                return;
            }
            if seen.len() >= self.config.key_added_cache.max(1) {
                seen.pop_front();
            }
            seen.push_back(entry);
            state.keys.contains(&change.key)
        };

        // Forward to our own followers only; the bus already delivered it.
        self.log.dispatch(&event);

        if ours {
            self.fetcher.invalidate(&change.uri);
            self.spawn_check(change.uri.clone());
        }
    }

    async fn check_coop(self: &Arc<Self>, candidate: CoopUri) {
        if self.is_stopped() || candidate == self.uri || !self.naming.accepts(&candidate) {
            return;
        }

        let known = {
            let mut state = self.state.lock();
            let following = state.followings.is_following(&candidate, state.keys.keys())
                && self.bus.is_watching(&candidate);
            if following || !state.checking.insert(candidate.clone()) {
                return;
            }
            state.followings.known(&candidate)
        };
        let _guard = CheckGuard {
            inner: self.as_ref(),
            uri: candidate.clone(),
        };

        let fetched = match self
            .fetcher
            .fetch(self.transport.as_ref(), &candidate, known.as_ref())
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                debug!(coop = %self.uri, peer = %candidate, error = %e, "not a coop node");
                return;
            }
        };

        let shared = shared_keys(&fetched.keys, self.state.lock().keys.keys());
        if shared.is_empty() {
            debug!(coop = %self.uri, peer = %candidate, "no shared key");
            return;
        }

        if let Err(e) = self.follow_coop(&candidate).await {
            info!(coop = %self.uri, peer = %candidate, error = %e, "follow failed");
            return;
        }
        self.record_follow(candidate, fetched);
    }

    /// Merge the candidate's snapshot and subscribe to its events.
    async fn follow_coop(&self, candidate: &CoopUri) -> CoopResult<()> {
        let res = self
            .transport
            .fetch(Request::get(candidate.list_uri()))
            .await?;
        let snapshot = LinkStore::parse_response(&res, candidate)?;
        let merged = self.state.lock().list.add_from_links(&snapshot);
        debug!(coop = %self.uri, peer = %candidate, merged, "merged snapshot");

        let events = self
            .transport
            .open_event_source(&candidate.event_uri(), None)
            .await?;
        if !self.bus.watch_remote(candidate.clone(), events) {
            return Err(CoopError::Closed);
        }
        Ok(())
    }

    /// Record the follow. The local key set may have changed while the
    /// follow was in flight; a peer left without a shared key is recorded
    /// but its source is closed and nothing is announced.
    fn record_follow(&self, candidate: CoopUri, fetched: FetchedKeys) {
        let mut state = self.state.lock();
        if self.is_stopped() {
            return;
        }
        let event = state
            .followings
            .put(candidate.clone(), fetched.keys, fetched.time, &self.uri);

        if state
            .followings
            .cross_keys(&candidate, state.keys.keys())
            .is_empty()
        {
            self.bus.close_remote(&candidate);
            info!(coop = %self.uri, peer = %candidate, "no shared key left, not following");
            return;
        }
        self.emit(event);
        info!(coop = %self.uri, peer = %candidate, "following");
    }

    /// Answer a request addressed to one of our well-known resources.
    fn respond(&self, request: &Request, resource: WellKnown) -> CoopResult<Response> {
        match resource {
            WellKnown::Keys => self
                .state
                .lock()
                .keys
                .respond(if_modified_since(request)),
            WellKnown::List => self
                .state
                .lock()
                .links
                .respond(if_modified_since(request)),
            WellKnown::Event => {
                let last_event_id = request.header(HeaderName::from_static(LAST_EVENT_ID));
                Ok(response(
                    StatusCode::OK,
                    &[(CONTENT_TYPE, TEXT_EVENT_STREAM)],
                    Body::Events(self.log.subscribe(last_event_id)),
                ))
            }
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.handler.lock().take() {
            self.transport.remove_handler(id);
        }
        self.bus.close();
        self.log.close();
        for task in self.loops.lock().drain(..) {
            task.abort();
        }
        info!(coop = %self.uri, "coop stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves the well-known resources and turns inbound traffic into discovery
struct WellKnownHandler {
    inner: Weak<Inner>,
}

impl RequestHandler for WellKnownHandler {
    fn handle(&self, event: &mut FetchEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.is_stopped() {
            return;
        }

        // Any traffic is a discovery hint about the requester.
        inner.spawn_check(inner.naming.coop_uri(event.remote_peer()));

        if event.request().method != Method::GET {
            return;
        }
        let Some((peer, resource)) = inner.naming.resolve(event.url()) else {
            return;
        };
        if peer != inner.uri.peer_id() {
            return;
        }

        match inner.respond(event.request(), resource) {
            Ok(res) => event.respond_with(res),
            Err(e) => {
                warn!(coop = %inner.uri, url = event.url(), error = %e, "cannot answer");
                event.respond_with(response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &[],
                    Body::Empty,
                ));
            }
        }
    }
}
