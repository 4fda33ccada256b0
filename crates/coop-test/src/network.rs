//! In-memory peer network
//!
//! Every joined peer gets a `MemoryTransport`. A fetch is routed to the
//! handlers registered by the peer named in the URL authority, carrying the
//! requester's identity, exactly like a real peer transport would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use coop_core::{CoopError, CoopResult, PeerId, Request, Response};
use coop_transport::{FetchEvent, HandlerId, RequestHandler, Transport};

#[derive(Default)]
struct PeerSlot {
    handlers: Vec<(HandlerId, Arc<dyn RequestHandler>)>,
    next_handler: u64,
    online: bool,
}

#[derive(Default)]
struct NetworkInner {
    peers: HashMap<PeerId, PeerSlot>,
    /// Requests delivered per URL
    served: HashMap<String, usize>,
    /// Fixed extra latency per URL
    slow: HashMap<String, Duration>,
}

/// Shared in-process network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    jitter: Option<(Duration, Arc<Mutex<StdRng>>)>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkInner::default())),
            jitter: None,
        }
    }

    /// Delay every fetch by a random amount up to `max`, from a seeded RNG
    pub fn with_jitter(max: Duration, seed: u64) -> Self {
        MemoryNetwork {
            jitter: Some((max, Arc::new(Mutex::new(StdRng::seed_from_u64(seed))))),
            ..Self::new()
        }
    }

    /// Attach a peer and return its transport
    pub fn join(&self, peer: impl Into<String>) -> Arc<MemoryTransport> {
        let peer = PeerId::new(peer);
        self.inner.lock().peers.entry(peer.clone()).or_default().online = true;
        Arc::new(MemoryTransport {
            peer,
            network: self.clone(),
        })
    }

    /// Make `peer` unreachable. Its handlers stay registered.
    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(slot) = self.inner.lock().peers.get_mut(peer) {
            slot.online = false;
        }
    }

    pub fn reconnect(&self, peer: &PeerId) {
        if let Some(slot) = self.inner.lock().peers.get_mut(peer) {
            slot.online = true;
        }
    }

    /// Delay every later request to `url` by `delay`
    pub fn slow_down(&self, url: impl Into<String>, delay: Duration) {
        self.inner.lock().slow.insert(url.into(), delay);
    }

    /// Requests delivered to `url` so far
    pub fn served(&self, url: &str) -> usize {
        self.inner.lock().served.get(url).copied().unwrap_or(0)
    }

    fn handlers_of(&self, url: &str) -> CoopResult<Vec<Arc<dyn RequestHandler>>> {
        let target = authority(url)
            .ok_or_else(|| CoopError::Unreachable(format!("no peer in {url}")))?;
        let mut inner = self.inner.lock();
        let handlers = match inner.peers.get(&target) {
            Some(slot) if slot.online => slot.handlers.iter().map(|(_, h)| h.clone()).collect(),
            _ => return Err(CoopError::Unreachable(format!("peer {target} unreachable"))),
        };
        *inner.served.entry(url.to_string()).or_default() += 1;
        Ok(handlers)
    }

    async fn delay(&self, url: &str) {
        let slow = self.inner.lock().slow.get(url).copied();
        if let Some(slow) = slow {
            tokio::time::sleep(slow).await;
        }
        let Some((max, rng)) = &self.jitter else {
            return;
        };
        let millis = max.as_millis() as u64;
        if millis == 0 {
            return;
        }
        let wait = rng.lock().gen_range(0..=millis);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer authority of `<scheme>:<peer>/...`
fn authority(url: &str) -> Option<PeerId> {
    let (_, rest) = url.split_once(':')?;
    let peer = rest.split('/').next()?;
    (!peer.is_empty()).then(|| PeerId::new(peer))
}

/// One peer's endpoint on a `MemoryNetwork`
pub struct MemoryTransport {
    peer: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    async fn fetch(&self, request: Request) -> CoopResult<Response> {
        self.network.delay(&request.url).await;
        let handlers = self.network.handlers_of(&request.url)?;
        trace!(from = %self.peer, url = %request.url, "fetch");

        let (mut event, response) = FetchEvent::new(request, self.peer.clone());
        for handler in handlers {
            handler.handle(&mut event);
            if event.is_responded() {
                break;
            }
        }
        drop(event);

        response
            .await
            .map_err(|_| CoopError::Unreachable("request dropped".into()))
    }

    fn add_handler(&self, handler: Arc<dyn RequestHandler>) -> HandlerId {
        let mut inner = self.network.inner.lock();
        let slot = inner.peers.entry(self.peer.clone()).or_default();
        let id = HandlerId(slot.next_handler);
        slot.next_handler += 1;
        slot.handlers.push((id, handler));
        id
    }

    fn remove_handler(&self, id: HandlerId) {
        if let Some(slot) = self.network.inner.lock().peers.get_mut(&self.peer) {
            slot.handlers.retain(|(handler, _)| *handler != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coop_core::{response, Body};
    use http::StatusCode;

    struct Teapot;

    impl RequestHandler for Teapot {
        fn handle(&self, event: &mut FetchEvent) {
            if event.url().ends_with("/tea") {
                let status = StatusCode::IM_A_TEAPOT;
                event.respond_with(response(status, &[], Body::Empty));
            }
        }
    }

    struct Whoami;

    impl RequestHandler for Whoami {
        fn handle(&self, event: &mut FetchEvent) {
            let peer = event.remote_peer().to_string();
            event.respond_with(response(
                StatusCode::OK,
                &[],
                Body::Full(peer.into_bytes().into()),
            ));
        }
    }

    #[tokio::test]
    async fn test_routes_by_authority_with_requester_identity() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let b = net.join("b");
        b.add_handler(Arc::new(Teapot));
        b.add_handler(Arc::new(Whoami));

        let tea = a.fetch(Request::get("http2p:b/tea")).await.unwrap();
        assert_eq!(tea.status(), StatusCode::IM_A_TEAPOT);

        let who = a.fetch(Request::get("http2p:b/who")).await.unwrap();
        assert_eq!(who.body().bytes().unwrap().as_ref(), b"a");
        assert_eq!(net.served("http2p:b/who"), 1);
    }

    #[tokio::test]
    async fn test_unhandled_is_404_and_unknown_is_unreachable() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        net.join("b");

        let res = a.fetch(Request::get("http2p:b/anything")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let err = a.fetch(Request::get("http2p:ghost/x")).await.unwrap_err();
        assert!(matches!(err, CoopError::Unreachable(_)));

        net.disconnect(&PeerId::new("b"));
        assert!(a.fetch(Request::get("http2p:b/anything")).await.is_err());
    }

    #[tokio::test]
    async fn test_removed_handler_stops_answering() {
        let net = MemoryNetwork::with_jitter(Duration::from_millis(3), 7);
        let a = net.join("a");
        let b = net.join("b");
        let id = b.add_handler(Arc::new(Whoami));
        b.remove_handler(id);

        let res = a.fetch(Request::get("http2p:b/who")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_slow_url_is_delayed() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        net.join("b");
        net.slow_down("http2p:b/slow", Duration::from_millis(80));

        let started = tokio::time::Instant::now();
        a.fetch(Request::get("http2p:b/fast")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(80));

        let started = tokio::time::Instant::now();
        a.fetch(Request::get("http2p:b/slow")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
