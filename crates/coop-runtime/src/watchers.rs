//! Event Bus - in-process fan-out of protocol events
//!
//! Two kinds of subscribers:
//! - user watches: bounded, a slow watcher loses the oldest events
//! - internal taps: unbounded and lossless, feeding the node's own stores
//!
//! Remote event sources of followed peers are pumped into the bus by one
//! task each.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{future, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use coop_core::{CoopEvent, CoopUri, EventStream, EventType};

/// Filter of an internal tap
pub type TapFilter = fn(&CoopEvent) -> bool;

/// Event types accepted from a followed peer's event resource
pub fn is_replicated(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::LinkAdded | EventType::LinkRemoved | EventType::CoopDetected | EventType::KeyAdded
    )
}

/// Live, cancellable sequence of events matching a predicate
pub struct Watch {
    stream: Option<BoxStream<'static, CoopEvent>>,
}

impl Watch {
    fn closed() -> Self {
        Watch { stream: None }
    }

    /// Stop delivery. Pending events are discarded.
    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Stream for Watch {
    type Item = CoopEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CoopEvent>> {
        let polled = match self.stream.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => return Poll::Ready(None),
        };
        if let Poll::Ready(None) = polled {
            self.stream = None;
        }
        polled
    }
}

struct BusInner {
    sender: Option<broadcast::Sender<CoopEvent>>,
    taps: Vec<(TapFilter, mpsc::UnboundedSender<CoopEvent>)>,
    remotes: HashMap<CoopUri, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

/// Per-node event bus
#[derive(Clone)]
pub struct Watchers {
    inner: Arc<Mutex<BusInner>>,
}

impl Watchers {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Watchers {
            inner: Arc::new(Mutex::new(BusInner {
                sender: Some(sender),
                taps: Vec::new(),
                remotes: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Subscribe to events matching `predicate`. A closed bus yields a
    /// watch that ends immediately.
    pub fn watch<F>(&self, predicate: F) -> Watch
    where
        F: Fn(&CoopEvent) -> bool + Send + 'static,
    {
        let inner = self.inner.lock();
        let Some(sender) = inner.sender.as_ref() else {
            return Watch::closed();
        };

        let stream = BroadcastStream::new(sender.subscribe())
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(event) => predicate(&event).then_some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        debug!(skipped, "watch lagging, oldest events dropped");
                        None
                    }
                })
            })
            .boxed();
        Watch {
            stream: Some(stream),
        }
    }

    /// Lossless internal subscription. Ends when the bus closes.
    pub fn tap(&self, filter: TapFilter) -> mpsc::UnboundedReceiver<CoopEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if inner.sender.is_some() {
            inner.taps.push((filter, tx));
        }
        rx
    }

    /// Deliver `event` to every matching subscriber. Returns `false` once
    /// the bus is closed.
    pub fn publish(&self, event: CoopEvent) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(sender) = inner.sender.as_ref() else {
            return false;
        };

        // Err only means no watch is open.
        let _ = sender.send(event.clone());
        inner
            .taps
            .retain(|(filter, tx)| !filter(&event) || tx.send(event.clone()).is_ok());
        true
    }

    /// Pump a followed peer's event source into the bus, replacing any
    /// previous source for `uri`. Returns `false` (dropping `stream`) once
    /// the bus is closed.
    pub fn watch_remote(&self, uri: CoopUri, stream: EventStream) -> bool {
        let mut inner = self.inner.lock();
        if inner.sender.is_none() {
            return false;
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let bus = self.clone();
        let key = uri.clone();
        let task = tokio::spawn(async move {
            bus.pump(&key, stream).await;
            bus.forget_remote(&key, generation);
        });

        if let Some((_, previous)) = inner.remotes.insert(uri, (generation, task)) {
            previous.abort();
        }
        true
    }

    /// Close the event source of `uri`. Returns whether one was open.
    pub fn close_remote(&self, uri: &CoopUri) -> bool {
        match self.inner.lock().remotes.remove(uri) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether an event source of `uri` is being pumped
    pub fn is_watching(&self, uri: &CoopUri) -> bool {
        self.inner.lock().remotes.contains_key(uri)
    }

    /// End every watch, tap and remote source. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.sender = None;
        inner.taps.clear();
        for (_, (_, task)) in inner.remotes.drain() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().sender.is_none()
    }

    async fn pump(&self, uri: &CoopUri, mut stream: EventStream) {
        while let Some(message) = stream.next().await {
            let replicated = message
                .event
                .parse::<EventType>()
                .map(is_replicated)
                .unwrap_or(false);
            if !replicated {
                continue;
            }
            match CoopEvent::from_message(&message) {
                Ok(event) => {
                    if !self.publish(event) {
                        return;
                    }
                }
                Err(e) => debug!(coop = %uri, error = %e, "dropped malformed remote event"),
            }
        }
        debug!(coop = %uri, "remote event source ended");
    }

    fn forget_remote(&self, uri: &CoopUri, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.remotes.get(uri).is_some_and(|(g, _)| *g == generation) {
            inner.remotes.remove(uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use coop_core::{CoopNaming, HttpTime, KeyChange, MessageEvent, PeerId};
    use tokio::time::timeout;

    fn source() -> CoopUri {
        CoopNaming::default().coop_uri(&PeerId::new("remote"))
    }

    fn key_added(key: &str) -> CoopEvent {
        CoopEvent::KeyAdded(KeyChange {
            uri: source(),
            time: HttpTime::from_unix_secs(1),
            key: key.into(),
        })
    }

    #[tokio::test]
    async fn test_watch_filters_and_preserves_order() {
        let bus = Watchers::new(16);
        let mut watch = bus.watch(|e| matches!(e, CoopEvent::KeyAdded(c) if c.key != "skip"));
        for key in ["a", "skip", "b"] {
            assert!(bus.publish(key_added(key)));
        }

        let first = watch.next().await.unwrap();
        let second = watch.next().await.unwrap();
        assert_eq!(first, key_added("a"));
        assert_eq!(second, key_added("b"));
    }

    #[tokio::test]
    async fn test_closed_watch_gets_nothing() {
        let bus = Watchers::new(16);
        let mut watch = bus.watch(|_| true);
        watch.close();
        bus.publish(key_added("a"));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_watch_drops_oldest() {
        let bus = Watchers::new(2);
        let mut watch = bus.watch(|_| true);
        let mut tap = bus.tap(|_| true);
        for key in ["1", "2", "3", "4"] {
            bus.publish(key_added(key));
        }

        assert_eq!(watch.next().await.unwrap(), key_added("3"));
        assert_eq!(watch.next().await.unwrap(), key_added("4"));
        for key in ["1", "2", "3", "4"] {
            assert_eq!(tap.recv().await.unwrap(), key_added(key));
        }
    }

    #[tokio::test]
    async fn test_remote_source_feeds_bus() {
        let bus = Watchers::new(16);
        let mut watch = bus.watch(|_| true);
        let messages = vec![
            MessageEvent::new("key-added", "not json"),
            MessageEvent::new("key-removed", "{}"),
            key_added("x").to_message().unwrap(),
        ];
        assert!(bus.watch_remote(source(), futures::stream::iter(messages).boxed()));

        let event = timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, key_added("x"));

        // the finite source ends and is forgotten
        timeout(Duration::from_secs(1), async {
            while bus.is_watching(&source()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let bus = Watchers::new(16);
        let mut watch = bus.watch(|_| true);
        let mut tap = bus.tap(|_| true);
        assert!(bus.watch_remote(source(), futures::stream::pending::<MessageEvent>().boxed()));

        bus.close();
        bus.close();
        assert!(!bus.is_watching(&source()));
        assert!(!bus.publish(key_added("a")));
        assert!(watch.next().await.is_none());
        assert!(tap.recv().await.is_none());
        assert!(bus.watch(|_| true).next().await.is_none());
        assert!(!bus.watch_remote(source(), futures::stream::pending::<MessageEvent>().boxed()));
    }
}
