//! End-to-end Integration Test Suite
//!
//! Scenarios that run several coop nodes on one in-memory network:
//! - Mutual following on a shared key
//! - Snapshot catch-up and live link replication
//! - Transitive discovery through relayed announcements
//! - Unfollowing, shutdown and unreachable candidates

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use coop_core::{CoopResult, CoopUri, PeerId, Request, Response};
use coop_runtime::{Coop, CoopConfig};
use coop_transport::Transport;

use crate::network::{MemoryNetwork, MemoryTransport};

/// How long `eventually` waits before giving up
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// TEST NODE
// ============================================================================

/// A coop node together with its endpoint on the test network
pub struct TestNode {
    pub coop: Coop,
    pub transport: Arc<MemoryTransport>,
}

impl TestNode {
    pub fn uri(&self) -> &CoopUri {
        self.coop.uri()
    }

    pub fn peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Request `other`'s key set, which hints `other` to check this node.
    pub async fn contact(&self, other: &TestNode) -> CoopResult<Response> {
        self.transport
            .fetch(Request::get(other.uri().as_str()))
            .await
    }
}

// ============================================================================
// CLUSTER HARNESS
// ============================================================================

/// Starts coop nodes on a shared `MemoryNetwork`
pub struct TestCluster {
    pub network: MemoryNetwork,
    config: CoopConfig,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::on(MemoryNetwork::new())
    }

    pub fn on(network: MemoryNetwork) -> Self {
        TestCluster {
            network,
            config: CoopConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a node named `peer` holding `keys`.
    pub fn node(&self, peer: &str, keys: &[&str]) -> CoopResult<TestNode> {
        let transport = self.network.join(peer);
        let coop = Coop::start(transport.clone(), self.config.clone())?;
        for key in keys {
            coop.add_key(key)?;
        }
        Ok(TestNode { coop, transport })
    }

    /// A peer with no coop node behind it
    pub fn bare(&self, peer: &str) -> Arc<MemoryTransport> {
        self.network.join(peer)
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` until it holds. Returns `false` on timeout.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok()
}

/// Let spawned tasks run for `duration` of wall time.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Run `check` and wait for both sides of the follow to be recorded.
pub async fn follow_each_other<F, Fut>(a: &TestNode, b: &TestNode, check: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    check().await;
    eventually(|| a.coop.is_following(b.uri()) && b.coop.is_following(a.uri())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use coop_core::{CoopError, CoopEvent, CoopNaming, EventType, MessageEvent};
    use coop_runtime::Advertisement;
    use futures::StreamExt;
    use http::StatusCode;

    const TARGET: &str = "https://example.org/paper";

    fn pair(cluster: &TestCluster, keys_a: &[&str], keys_b: &[&str]) -> (TestNode, TestNode) {
        let a = cluster.node("a", keys_a).unwrap();
        let b = cluster.node("b", keys_b).unwrap();
        (a, b)
    }

    async fn connected(cluster: &TestCluster) -> (TestNode, TestNode) {
        let (a, b) = pair(cluster, &["k"], &["k"]);
        assert!(follow_each_other(&a, &b, || a.coop.check_coop(b.uri().clone())).await);
        (a, b)
    }

    #[tokio::test]
    async fn test_shared_key_leads_to_mutual_follow() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["k"]);

        a.coop.check_coop(b.uri().clone()).await;
        assert!(a.coop.is_following(b.uri()));
        assert_eq!(a.coop.followings(), vec![b.uri().clone()]);

        // A's key fetch told B about A.
        assert!(eventually(|| b.coop.is_following(a.uri())).await);
    }

    #[tokio::test]
    async fn test_no_shared_key_no_follow() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["other"]);

        a.coop.check_coop(b.uri().clone()).await;
        settle(Duration::from_millis(100)).await;
        assert!(!a.coop.is_following(b.uri()));
        assert!(!b.coop.is_following(a.uri()));
        assert_eq!(cluster.network.served(&b.uri().list_uri()), 0);
    }

    #[tokio::test]
    async fn test_common_key_added_later_then_contact() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["other"]);
        a.coop.check_coop(b.uri().clone()).await;
        settle(Duration::from_millis(50)).await;
        assert!(!a.coop.is_following(b.uri()));

        a.coop.add_key("x").unwrap();
        b.coop.add_key("x").unwrap();
        a.contact(&b).await.unwrap();
        assert!(eventually(|| a.coop.is_following(b.uri()) && b.coop.is_following(a.uri())).await);
    }

    #[tokio::test]
    async fn test_inbound_request_triggers_discovery() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["k"]);

        let res = a.contact(&b).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(eventually(|| b.coop.is_following(a.uri())).await);
    }

    #[tokio::test]
    async fn test_snapshot_catch_up_on_follow() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["k"]);
        a.coop.put(TARGET, [("title", "Coops"), ("year", "2021")]).unwrap();

        b.coop.check_coop(a.uri().clone()).await;
        let props = b.coop.get_multi_props(TARGET);
        assert_eq!(props["title"][a.uri()], "Coops");
        assert_eq!(props["year"][a.uri()], "2021");
        // B's own store is untouched.
        assert!(b.coop.get_props(TARGET).is_empty());
    }

    #[tokio::test]
    async fn test_live_link_replication() {
        let cluster = TestCluster::new();
        let (a, b) = connected(&cluster).await;
        let mut watch = b.coop.watch(|e| e.event_type() == EventType::LinkAdded);

        a.coop.put(TARGET, [("title", "Coops")]).unwrap();

        let event = tokio::time::timeout(SETTLE_TIMEOUT, watch.next())
            .await
            .unwrap()
            .unwrap();
        let change = event.link_change().unwrap();
        assert_eq!(&change.uri, a.uri());
        assert_eq!(change.link.uri, TARGET);

        assert!(eventually(|| !b.coop.list_props(TARGET).is_empty()).await);
        let found = b.coop.find(|props| props.iter().any(|p| p.value == "Coops"));
        assert_eq!(found, vec![TARGET.to_string()]);

        a.coop.drop(TARGET, ["title"]).unwrap();
        assert!(eventually(|| b.coop.list_props(TARGET).is_empty()).await);
    }

    #[tokio::test]
    async fn test_both_sources_kept_side_by_side() {
        let cluster = TestCluster::new();
        let (a, b) = connected(&cluster).await;

        a.coop.put(TARGET, [("rating", "4")]).unwrap();
        b.coop.put(TARGET, [("rating", "5")]).unwrap();

        let converged = |node: &TestNode| {
            node.coop
                .get_multi_props(TARGET)
                .get("rating")
                .map_or(0, |sources| sources.len())
                == 2
        };
        assert!(eventually(|| converged(&a) && converged(&b)).await);
        assert_eq!(a.coop.get_multi_props(TARGET), b.coop.get_multi_props(TARGET));
    }

    #[tokio::test]
    async fn test_key_added_relay_reaches_third_node() {
        let cluster = TestCluster::new();
        let a = cluster.node("a", &["p"]).unwrap();
        let b = cluster.node("b", &["p", "q"]).unwrap();
        let c = cluster.node("c", &["q"]).unwrap();

        assert!(follow_each_other(&a, &b, || a.coop.check_coop(b.uri().clone())).await);
        assert!(follow_each_other(&b, &c, || b.coop.check_coop(c.uri().clone())).await);
        assert!(!a.coop.is_following(c.uri()));

        // C's announcement travels C -> B -> A.
        c.coop.add_key("p").unwrap();
        assert!(eventually(|| a.coop.is_following(c.uri()) && c.coop.is_following(a.uri())).await);
    }

    #[tokio::test]
    async fn test_coop_detected_spreads_through_mesh() {
        let network = MemoryNetwork::with_jitter(Duration::from_millis(5), 42);
        let cluster = TestCluster::on(network);
        let a = cluster.node("a", &["k"]).unwrap();
        let b = cluster.node("b", &["k"]).unwrap();
        let c = cluster.node("c", &["k"]).unwrap();

        assert!(follow_each_other(&a, &b, || a.coop.check_coop(b.uri().clone())).await);
        a.coop.check_coop(c.uri().clone()).await;

        // B hears about C from A's coop-detected announcement.
        let meshed = || {
            [(&a, &b), (&a, &c), (&b, &c)].iter().all(|(x, y)| {
                x.coop.is_following(y.uri()) && y.coop.is_following(x.uri())
            })
        };
        assert!(eventually(meshed).await);

        for node in [&a, &b, &c] {
            let target = format!("https://example.org/{}", node.peer());
            node.coop.put(&target, [("owner", node.peer().to_string())]).unwrap();
        }
        let everything = |node: &TestNode| node.coop.find(|props| !props.is_empty()).len() == 3;
        assert!(eventually(|| everything(&a) && everything(&b) && everything(&c)).await);
    }

    #[tokio::test]
    async fn test_remove_key_unfollows() {
        let cluster = TestCluster::new();
        let (a, b) = connected(&cluster).await;
        b.coop.put(TARGET, [("title", "before")]).unwrap();
        assert!(eventually(|| !a.coop.list_props(TARGET).is_empty()).await);

        a.coop.remove_key("k").unwrap();
        assert!(!a.coop.is_following(b.uri()));
        assert_eq!(a.coop.detaching_followings(), vec![b.uri().clone()]);

        let mut watch = a.coop.watch(|e| e.event_type() == EventType::LinkAdded);
        let later = "https://example.org/later";
        b.coop.put(later, [("title", "after")]).unwrap();
        let delivered = tokio::time::timeout(Duration::from_millis(200), watch.next()).await;
        assert!(delivered.is_err());
        assert!(a.coop.list_props(later).is_empty());

        // What was merged stays searchable.
        assert_eq!(a.coop.find(|props| !props.is_empty()), vec![TARGET.to_string()]);
    }

    #[tokio::test]
    async fn test_readding_key_refollows() {
        let cluster = TestCluster::new();
        let (a, b) = connected(&cluster).await;

        a.coop.remove_key("k").unwrap();
        assert!(!a.coop.is_following(b.uri()));

        a.coop.add_key("k").unwrap();
        assert!(eventually(|| a.coop.is_following(b.uri())).await);

        b.coop.put(TARGET, [("title", "again")]).unwrap();
        assert!(eventually(|| !a.coop.list_props(TARGET).is_empty()).await);
    }

    #[tokio::test]
    async fn test_stop_is_terminal_and_idempotent() {
        let cluster = TestCluster::new();
        let (a, b) = connected(&cluster).await;
        let mut watch = a.coop.watch(|_| true);

        a.coop.stop();
        a.coop.stop();
        assert!(a.coop.is_stopped());
        assert!(matches!(a.coop.put(TARGET, [("k", "v")]), Err(CoopError::Closed)));
        assert!(matches!(a.coop.add_key("x"), Err(CoopError::Closed)));
        assert!(watch.next().await.is_none());

        let res = b.contact(&a).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(!a.coop.advertise(Advertisement {
            uri: b.uri().to_string(),
            keys: vec!["k".into()],
        }));
    }

    #[tokio::test]
    async fn test_advertise() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["k"]);
        let mut watch = a.coop.watch(|e| e.event_type() == EventType::MainnetConnected);

        assert!(!a.coop.advertise(Advertisement {
            uri: a.uri().to_string(),
            keys: vec![],
        }));
        assert!(!a.coop.advertise(Advertisement {
            uri: "other:b/.well-known/http2p/coop/".into(),
            keys: vec![],
        }));
        assert!(!a.coop.advertise(Advertisement {
            uri: "not a uri".into(),
            keys: vec![],
        }));

        assert!(a.coop.advertise(Advertisement {
            uri: b.uri().to_string(),
            keys: vec!["k".into()],
        }));
        match watch.next().await {
            Some(CoopEvent::MainnetConnected(connected)) => {
                assert_eq!(&connected.coop.uri, b.uri());
                assert_eq!(connected.coop.keys, vec!["k".to_string()]);
            }
            other => panic!("expected mainnet-connected, got {other:?}"),
        }

        assert!(eventually(|| a.coop.is_following(b.uri())).await);
        assert!(!a.coop.advertise(Advertisement {
            uri: b.uri().to_string(),
            keys: vec!["k".into()],
        }));
    }

    #[tokio::test]
    async fn test_unreachable_and_non_coop_candidates() {
        let cluster = TestCluster::new();
        let a = cluster.node("a", &["k"]).unwrap();
        cluster.bare("plain");
        let naming = CoopNaming::default();

        let ghost = naming.coop_uri(&PeerId::new("ghost"));
        a.coop.check_coop(ghost.clone()).await;
        assert!(!a.coop.is_following(&ghost));

        let plain = naming.coop_uri(&PeerId::new("plain"));
        a.coop.check_coop(plain.clone()).await;
        assert!(!a.coop.is_following(&plain));
        assert_eq!(cluster.network.served(plain.as_str()), 1);

        // A failed check leaves no trace, so a retry goes out again.
        a.coop.check_coop(plain.clone()).await;
        assert_eq!(cluster.network.served(plain.as_str()), 2);
    }

    #[tokio::test]
    async fn test_open_stream_outlives_disconnect() {
        let cluster = TestCluster::new();
        let (a, b) = connected(&cluster).await;
        cluster.network.disconnect(&b.peer());

        // The open stream keeps flowing; only new requests fail.
        b.coop.put(TARGET, [("title", "still")]).unwrap();
        assert!(eventually(|| !a.coop.list_props(TARGET).is_empty()).await);

        b.coop.stop();
        cluster.network.reconnect(&b.peer());
        a.coop.check_coop(b.uri().clone()).await;
        assert_eq!(a.coop.followings(), vec![b.uri().clone()]);
    }

    #[tokio::test]
    async fn test_event_resource_resumes_after_last_event_id() {
        let cluster = TestCluster::new();
        let a = cluster.node("a", &[]).unwrap();
        let reader = cluster.bare("reader");
        for n in 1..=3 {
            let target = format!("https://example.org/{n}");
            a.coop.put(&target, [("n", n.to_string())]).unwrap();
        }

        let mut events = reader
            .open_event_source(&a.uri().event_uri(), Some("1"))
            .await
            .unwrap();
        let ids: Vec<Option<String>> = vec![
            events.next().await.unwrap().id,
            events.next().await.unwrap().id,
        ];
        assert_eq!(ids, vec![Some("2".to_string()), Some("3".to_string())]);

        a.coop.put("https://example.org/4", [("n", "4")]).unwrap();
        let live: MessageEvent = events.next().await.unwrap();
        assert_eq!(live.id.as_deref(), Some("4"));
        assert_eq!(live.event, "link-added");

        a.coop.stop();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_list_resource_is_conditional() {
        let cluster = TestCluster::new();
        let a = cluster.node("a", &[]).unwrap();
        let reader = cluster.bare("reader");
        a.coop.put(TARGET, [("title", "Coops")]).unwrap();

        let first = reader.fetch(Request::get(a.uri().list_uri())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let last_modified = first
            .headers()
            .get(http::header::LAST_MODIFIED)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let again = reader
            .fetch(
                Request::get(a.uri().list_uri())
                    .with_header(http::header::IF_MODIFIED_SINCE, &last_modified),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_concurrent_checks_fetch_list_once() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["k"]);
        let candidate = b.uri().clone();

        tokio::join!(
            a.coop.check_coop(candidate.clone()),
            a.coop.check_coop(candidate.clone()),
            a.coop.check_coop(candidate.clone()),
        );
        assert!(eventually(|| b.coop.is_following(a.uri())).await);
        settle(Duration::from_millis(50)).await;

        assert_eq!(cluster.network.served(&candidate.list_uri()), 1);
        assert_eq!(cluster.network.served(&candidate.event_uri()), 1);
    }

    #[tokio::test]
    async fn test_key_removed_while_follow_in_flight() {
        let cluster = TestCluster::new();
        let (a, b) = pair(&cluster, &["k"], &["k"]);
        cluster
            .network
            .slow_down(b.uri().list_uri(), Duration::from_millis(150));

        let coop = a.coop.clone();
        let candidate = b.uri().clone();
        let check = tokio::spawn(async move { coop.check_coop(candidate).await });
        settle(Duration::from_millis(50)).await;
        a.coop.remove_key("k").unwrap();
        check.await.unwrap();

        assert!(!a.coop.is_following(b.uri()));
        assert_eq!(a.coop.detaching_followings(), vec![b.uri().clone()]);

        let mut watch = a.coop.watch(|e| e.event_type() == EventType::LinkAdded);
        let later = "https://example.org/after-unfollow";
        b.coop.put(later, [("title", "after")]).unwrap();
        let delivered = tokio::time::timeout(Duration::from_millis(200), watch.next()).await;
        assert!(delivered.is_err());
        assert!(a.coop.list_props(later).is_empty());

        // The record survives, so the key coming back resumes the follow.
        a.coop.add_key("k").unwrap();
        assert!(eventually(|| a.coop.is_following(b.uri())).await);
        b.coop.put(TARGET, [("title", "again")]).unwrap();
        assert!(eventually(|| !a.coop.list_props(TARGET).is_empty()).await);
    }

    /// Everything `node` has put on its event resource so far
    async fn event_log(reader: &MemoryTransport, node: &TestNode) -> Vec<CoopEvent> {
        let mut stream = reader
            .open_event_source(&node.uri().event_uri(), Some("0"))
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(100), stream.next()).await
        {
            events.push(CoopEvent::from_message(&message).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_key_added_relayed_once_around_a_cycle() {
        let cluster = TestCluster::new();
        let a = cluster.node("a", &["k"]).unwrap();
        let b = cluster.node("b", &["k"]).unwrap();
        let c = cluster.node("c", &["k"]).unwrap();

        assert!(follow_each_other(&a, &b, || a.coop.check_coop(b.uri().clone())).await);
        assert!(follow_each_other(&b, &c, || b.coop.check_coop(c.uri().clone())).await);
        assert!(follow_each_other(&a, &c, || a.coop.check_coop(c.uri().clone())).await);

        c.coop.add_key("p").unwrap();
        settle(Duration::from_millis(300)).await;

        let reader = cluster.bare("reader");
        for node in [&a, &b, &c] {
            let announced = event_log(&reader, node)
                .await
                .into_iter()
                .filter(|e| matches!(e, CoopEvent::KeyAdded(k) if &k.uri == c.uri() && k.key == "p"))
                .count();
            assert_eq!(announced, 1, "key-added(p) in the log of {}", node.uri());
        }
    }
}
