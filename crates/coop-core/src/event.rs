//! Event definitions
//!
//! Events are the only way coop nodes learn about each other's changes.
//! The same JSON payload travels over a peer's `event` resource and through
//! the in-process event bus.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CoopError, CoopResult, CoopUri, HttpTime, LogicalStamp, MessageEvent};

/// Event type classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    KeyAdded,
    KeyRemoved,
    LinkAdded,
    LinkRemoved,
    CoopDetected,
    MainnetConnected,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::KeyAdded => "key-added",
            EventType::KeyRemoved => "key-removed",
            EventType::LinkAdded => "link-added",
            EventType::LinkRemoved => "link-removed",
            EventType::CoopDetected => "coop-detected",
            EventType::MainnetConnected => "mainnet-connected",
        }
    }

    /// Is this one of the two property events?
    pub fn is_link(self) -> bool {
        matches!(self, EventType::LinkAdded | EventType::LinkRemoved)
    }
}

impl FromStr for EventType {
    type Err = CoopError;

    fn from_str(s: &str) -> CoopResult<Self> {
        match s {
            "key-added" => Ok(EventType::KeyAdded),
            "key-removed" => Ok(EventType::KeyRemoved),
            "link-added" => Ok(EventType::LinkAdded),
            "link-removed" => Ok(EventType::LinkRemoved),
            "coop-detected" => Ok(EventType::CoopDetected),
            "mainnet-connected" => Ok(EventType::MainnetConnected),
            other => Err(CoopError::InvalidArgument(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property assertion about `uri`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub uri: String,
    pub key: String,
    pub value: String,
}

/// Payload of `key-added` / `key-removed`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    pub uri: CoopUri,
    pub time: HttpTime,
    pub key: String,
}

/// Payload of `link-added` / `link-removed`
///
/// A removal carries the last value for observability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChange {
    pub uri: CoopUri,
    pub time: HttpTime,
    pub clock: u64,
    pub link: Link,
}

impl LinkChange {
    pub fn stamp(&self) -> LogicalStamp {
        LogicalStamp::new(self.time, self.clock)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoopRef {
    pub href: CoopUri,
}

/// Payload of `coop-detected`: the source now follows `coop.href`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoopDetected {
    pub uri: CoopUri,
    pub time: HttpTime,
    pub coop: CoopRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedCoop {
    pub uri: CoopUri,
    pub keys: Vec<String>,
}

/// Payload of `mainnet-connected`: a node was advertised on the local network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainnetConnected {
    pub uri: CoopUri,
    pub time: HttpTime,
    pub coop: AdvertisedCoop,
}

/// Coop protocol event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoopEvent {
    KeyAdded(KeyChange),
    KeyRemoved(KeyChange),
    LinkAdded(LinkChange),
    LinkRemoved(LinkChange),
    CoopDetected(CoopDetected),
    MainnetConnected(MainnetConnected),
}

impl CoopEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            CoopEvent::KeyAdded(_) => EventType::KeyAdded,
            CoopEvent::KeyRemoved(_) => EventType::KeyRemoved,
            CoopEvent::LinkAdded(_) => EventType::LinkAdded,
            CoopEvent::LinkRemoved(_) => EventType::LinkRemoved,
            CoopEvent::CoopDetected(_) => EventType::CoopDetected,
            CoopEvent::MainnetConnected(_) => EventType::MainnetConnected,
        }
    }

    /// The coop URI of the node that produced the event
    pub fn source(&self) -> &CoopUri {
        match self {
            CoopEvent::KeyAdded(e) | CoopEvent::KeyRemoved(e) => &e.uri,
            CoopEvent::LinkAdded(e) | CoopEvent::LinkRemoved(e) => &e.uri,
            CoopEvent::CoopDetected(e) => &e.uri,
            CoopEvent::MainnetConnected(e) => &e.uri,
        }
    }

    pub fn time(&self) -> HttpTime {
        match self {
            CoopEvent::KeyAdded(e) | CoopEvent::KeyRemoved(e) => e.time,
            CoopEvent::LinkAdded(e) | CoopEvent::LinkRemoved(e) => e.time,
            CoopEvent::CoopDetected(e) => e.time,
            CoopEvent::MainnetConnected(e) => e.time,
        }
    }

    /// The property change, for link events
    pub fn link_change(&self) -> Option<&LinkChange> {
        match self {
            CoopEvent::LinkAdded(e) | CoopEvent::LinkRemoved(e) => Some(e),
            _ => None,
        }
    }

    pub fn to_json(&self) -> CoopResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encode as a server-sent message named after the event type
    pub fn to_message(&self) -> CoopResult<MessageEvent> {
        Ok(MessageEvent::new(self.event_type().as_str(), self.to_json()?))
    }

    /// Decode and validate a server-sent message.
    ///
    /// The message name must match the payload `type`; URIs, times and
    /// clocks are checked while deserializing.
    pub fn from_message(message: &MessageEvent) -> CoopResult<Self> {
        let expected: EventType = message.event.parse()?;
        let event: CoopEvent = serde_json::from_str(&message.data)
            .map_err(|e| CoopError::InvalidArgument(format!("malformed {expected} payload: {e}")))?;

        if event.event_type() != expected {
            return Err(CoopError::InvalidArgument(format!(
                "event named {expected} carries a {} payload",
                event.event_type()
            )));
        }

        if let Some(change) = event.link_change() {
            url::Url::parse(&change.link.uri).map_err(|e| {
                CoopError::InvalidArgument(format!("invalid link uri {:?}: {e}", change.link.uri))
            })?;
        }

        Ok(event)
    }
}
