//! Resumable event log
//!
//! Backs a node's `event` resource. Every dispatched message gets the next
//! id; subscribers presenting a `Last-Event-ID` first receive the retained
//! messages after it, then the live tail.

use std::collections::VecDeque;

use futures::{future, stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use coop_core::{CoopEvent, EventStream, MessageEvent};

struct LogInner {
    history: VecDeque<(u64, MessageEvent)>,
    next_id: u64,
    sender: Option<broadcast::Sender<MessageEvent>>,
}

/// Bounded, id-stamped history plus a live fan-out
pub struct EventLog {
    capacity: usize,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// `capacity` bounds both the replay history and the live buffer of
    /// each subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        EventLog {
            capacity,
            inner: Mutex::new(LogInner {
                history: VecDeque::with_capacity(capacity),
                next_id: 1,
                sender: Some(sender),
            }),
        }
    }

    /// Append a protocol event. Returns its id, or `None` once closed.
    pub fn dispatch(&self, event: &CoopEvent) -> Option<u64> {
        match event.to_message() {
            Ok(message) => self.dispatch_message(message),
            Err(e) => {
                warn!(event = %event.event_type(), error = %e, "unencodable event");
                None
            }
        }
    }

    pub fn dispatch_message(&self, message: MessageEvent) -> Option<u64> {
        let mut inner = self.inner.lock();
        let sender = inner.sender.clone()?;

        let id = inner.next_id;
        inner.next_id += 1;
        let message = message.with_id(id.to_string());

        if inner.history.len() == self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back((id, message.clone()));

        // No live subscribers is fine; history still has it.
        let _ = sender.send(message);
        Some(id)
    }

    /// Open a subscription, replaying retained messages after `last_event_id`.
    ///
    /// An absent or unparsable id replays nothing. A closed log yields an
    /// empty stream.
    pub fn subscribe(&self, last_event_id: Option<&str>) -> EventStream {
        let inner = self.inner.lock();
        let Some(sender) = inner.sender.as_ref() else {
            return stream::empty().boxed();
        };

        let replay: Vec<MessageEvent> = match last_event_id.and_then(|id| id.trim().parse().ok()) {
            Some(after) => inner
                .history
                .iter()
                .filter(|(id, _)| *id > after)
                .map(|(_, message)| message.clone())
                .collect(),
            None => Vec::new(),
        };
        // Subscribed under the lock, so nothing falls between replay and live.
        let live = BroadcastStream::new(sender.subscribe()).filter_map(|item| {
            future::ready(match item {
                Ok(message) => Some(message),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagging");
                    None
                }
            })
        });

        stream::iter(replay).chain(live).boxed()
    }

    /// End every subscription. Later dispatches are ignored.
    pub fn close(&self) {
        self.inner.lock().sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().sender.is_none()
    }

    /// Number of retained messages
    pub fn len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
