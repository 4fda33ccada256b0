//! Following Registry
//!
//! Remembers every peer this node has followed together with its last known
//! key set. Whether a peer is currently followed is derived: the recorded
//! keys must intersect the local key set as it is now.

use std::collections::{BTreeSet, HashMap};

use coop_core::{
    CoopDetected, CoopError, CoopEvent, CoopNaming, CoopRef, CoopResult, CoopUri, HttpTime,
    MessageEvent,
};

use crate::FetchedKeys;

#[derive(Clone, Debug)]
struct Record {
    keys: BTreeSet<String>,
    last_modified: HttpTime,
    seq: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Followings {
    records: HashMap<CoopUri, Record>,
    next_seq: u64,
}

impl Followings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a follow of `uri`. Returns the `coop-detected` announcement
    /// issued by `self_uri`.
    pub fn put(
        &mut self,
        uri: CoopUri,
        keys: impl IntoIterator<Item = String>,
        last_modified: HttpTime,
        self_uri: &CoopUri,
    ) -> CoopEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            uri.clone(),
            Record {
                keys: keys.into_iter().collect(),
                last_modified,
                seq,
            },
        );

        CoopEvent::CoopDetected(CoopDetected {
            uri: self_uri.clone(),
            time: HttpTime::now(),
            coop: CoopRef { href: uri },
        })
    }

    /// Recorded keys of `uri` shared with `local`
    pub fn cross_keys(&self, uri: &CoopUri, local: &BTreeSet<String>) -> Vec<String> {
        self.records
            .get(uri)
            .map(|record| shared_keys(&record.keys, local))
            .unwrap_or_default()
    }

    pub fn is_following(&self, uri: &CoopUri, local: &BTreeSet<String>) -> bool {
        self.records
            .get(uri)
            .is_some_and(|record| !record.keys.is_disjoint(local))
    }

    /// Active followings, most recently updated first
    pub fn followings(&self, local: &BTreeSet<String>) -> Vec<CoopUri> {
        let mut active: Vec<(&CoopUri, &Record)> = self
            .records
            .iter()
            .filter(|(_, record)| !record.keys.is_disjoint(local))
            .collect();
        active.sort_by(|(_, a), (_, b)| {
            (b.last_modified, b.seq).cmp(&(a.last_modified, a.seq))
        });
        active.into_iter().map(|(uri, _)| uri.clone()).collect()
    }

    /// Recorded peers that no longer share a key
    pub fn detaching_followings(&self, local: &BTreeSet<String>) -> Vec<CoopUri> {
        let mut detaching: Vec<CoopUri> = self
            .records
            .iter()
            .filter(|(_, record)| record.keys.is_disjoint(local))
            .map(|(uri, _)| uri.clone())
            .collect();
        detaching.sort();
        detaching
    }

    /// Recorded peers whose last known keys include `key`
    pub fn holding_key(&self, key: &str) -> Vec<CoopUri> {
        self.records
            .iter()
            .filter(|(_, record)| record.keys.contains(key))
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Last fetched key set of `uri`, for conditional re-fetching
    pub fn known(&self, uri: &CoopUri) -> Option<FetchedKeys> {
        self.records.get(uri).map(|record| FetchedKeys {
            keys: record.keys.iter().cloned().collect(),
            time: record.last_modified,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keys of a peer's set that are also in `local`
pub fn shared_keys<'a>(
    remote: impl IntoIterator<Item = &'a String>,
    local: &BTreeSet<String>,
) -> Vec<String> {
    remote
        .into_iter()
        .filter(|key| local.contains(*key))
        .cloned()
        .collect()
}

/// The coop announced by a `coop-detected` event, if it is one of ours
pub fn check_event(event: &CoopEvent, naming: &CoopNaming) -> Option<CoopUri> {
    match event {
        CoopEvent::CoopDetected(detected) if naming.accepts(&detected.coop.href) => {
            Some(detected.coop.href.clone())
        }
        _ => None,
    }
}

/// Decode a wire `coop-detected` message and extract the announced coop
pub fn parse_event(message: &MessageEvent, naming: &CoopNaming) -> CoopResult<CoopUri> {
    let event = CoopEvent::from_message(message)?;
    check_event(&event, naming).ok_or_else(|| {
        CoopError::InvalidArgument(format!(
            "{} does not announce a {}: coop",
            message.event,
            naming.scheme()
        ))
    })
}
