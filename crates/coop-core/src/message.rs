//! Wire documents served at the well-known resources

use serde::{Deserialize, Serialize};

use crate::{CoopUri, HttpTime, LogicalStamp};

/// Body of the key resource (`.../coop/`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysDocument {
    pub uri: CoopUri,
    pub keys: Vec<String>,
    pub time: HttpTime,
}

/// One property assignment in a snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// All properties a source asserts about one target URI
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSet {
    pub uri: String,
    pub links: Vec<KeyValue>,
}

/// Body of the list resource (`.../coop/list`) - a full snapshot, not a diff
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinksSnapshot {
    pub uri: CoopUri,
    pub time: HttpTime,
    pub clock: u64,
    pub list: Vec<LinkSet>,
}

impl LinksSnapshot {
    /// Stamp shared by every assertion in the snapshot
    pub fn stamp(&self) -> LogicalStamp {
        LogicalStamp::new(self.time, self.clock)
    }

    /// Iterate `(target, key, value)` triples
    pub fn triples(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.list.iter().flat_map(|set| {
            set.links
                .iter()
                .map(move |kv| (set.uri.as_str(), kv.key.as_str(), kv.value.as_str()))
        })
    }
}
