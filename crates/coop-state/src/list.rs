//! Merged Index - every followed source's annotations, conflict-resolved
//!
//! Entries are keyed by (target, key, source). Each source owns its own
//! entries; for one entry the assertion with the greatest `(time, clock)`
//! wins. Removals leave a tombstone so a late, older `link-added` cannot
//! resurrect a deleted value.

use std::collections::BTreeMap;

use coop_core::{CoopEvent, CoopUri, LinksSnapshot, LogicalStamp};

/// One live property as seen in the merged view
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Prop {
    pub key: String,
    pub value: String,
    pub source: CoopUri,
}

/// key -> source -> value
pub type MultiProps = BTreeMap<String, BTreeMap<CoopUri, String>>;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    /// `None` is a tombstone
    value: Option<String>,
    stamp: LogicalStamp,
}

#[derive(Clone, Debug, Default)]
pub struct MergedList {
    /// target -> (key, source) -> entry
    targets: BTreeMap<String, BTreeMap<(String, CoopUri), Entry>>,
}

impl MergedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one assertion. Returns whether it was accepted.
    pub fn apply(
        &mut self,
        target: &str,
        key: &str,
        source: &CoopUri,
        value: Option<&str>,
        stamp: LogicalStamp,
    ) -> bool {
        let entries = self.targets.entry(target.to_string()).or_default();
        let slot = (key.to_string(), source.clone());
        if let Some(existing) = entries.get(&slot) {
            if !stamp.supersedes(&existing.stamp) {
                return false;
            }
        }
        entries.insert(
            slot,
            Entry {
                value: value.map(str::to_string),
                stamp,
            },
        );
        true
    }

    /// Merge a full snapshot from its source. Returns the number of accepted
    /// assertions.
    pub fn add_from_links(&mut self, snapshot: &LinksSnapshot) -> usize {
        let stamp = snapshot.stamp();
        snapshot
            .triples()
            .filter(|&(target, key, value)| {
                self.apply(target, key, &snapshot.uri, Some(value), stamp)
            })
            .count()
    }

    /// Merge one `link-added` / `link-removed`. Other events are ignored.
    pub fn update_from_event(&mut self, event: &CoopEvent) -> bool {
        match event {
            CoopEvent::LinkAdded(change) => self.apply(
                &change.link.uri,
                &change.link.key,
                &change.uri,
                Some(&change.link.value),
                change.stamp(),
            ),
            CoopEvent::LinkRemoved(change) => self.apply(
                &change.link.uri,
                &change.link.key,
                &change.uri,
                None,
                change.stamp(),
            ),
            _ => false,
        }
    }

    /// Live properties of `target`, across all sources
    pub fn get_props(&self, target: &str) -> Vec<Prop> {
        let Some(entries) = self.targets.get(target) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|((key, source), entry)| {
                entry.value.as_ref().map(|value| Prop {
                    key: key.clone(),
                    value: value.clone(),
                    source: source.clone(),
                })
            })
            .collect()
    }

    /// Live properties of `target` grouped by key. Conflicting values from
    /// different sources are all kept.
    pub fn get_multi_props(&self, target: &str) -> MultiProps {
        let mut grouped = MultiProps::new();
        for prop in self.get_props(target) {
            grouped
                .entry(prop.key)
                .or_default()
                .insert(prop.source, prop.value);
        }
        grouped
    }

    /// Targets whose live property list satisfies `predicate`.
    ///
    /// Lazy and finite; targets with no live property are skipped.
    pub fn find<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a str> + 'a
    where
        P: Fn(&[Prop]) -> bool + 'a,
    {
        self.live()
            .filter_map(move |(target, props)| predicate(&props).then_some(target))
    }

    /// Every target with at least one live property, with those properties
    pub fn live(&self) -> impl Iterator<Item = (&str, Vec<Prop>)> + '_ {
        self.targets.keys().filter_map(move |target| {
            let props = self.get_props(target);
            (!props.is_empty()).then_some((target.as_str(), props))
        })
    }

    /// Number of targets ever mentioned, tombstoned or not
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
