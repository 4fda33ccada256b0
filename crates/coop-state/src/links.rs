//! Property Store - this node's own annotations
//!
//! Target URI -> key -> value. Every mutation advances the node's logical
//! clock and yields the event describing it.

use std::collections::BTreeMap;

use http::header::{CONTENT_TYPE, LAST_MODIFIED};
use http::StatusCode;

use coop_core::{
    not_modified, response, Body, CoopError, CoopEvent, CoopResult, CoopUri, HttpTime, KeyValue,
    Link, LinkChange, LinkSet, LinksSnapshot, LogicalClock, LogicalStamp, Response,
};

/// Properties of one target: key -> value
pub type Props = BTreeMap<String, String>;

fn validate(target: &str, key: &str) -> CoopResult<()> {
    if key.is_empty() {
        return Err(CoopError::InvalidArgument(format!(
            "empty property key for {target}"
        )));
    }
    url::Url::parse(target).map_err(|e| {
        CoopError::InvalidArgument(format!("invalid target uri {target:?}: {e}"))
    })?;
    Ok(())
}

/// Local annotations with change stamping
#[derive(Clone, Debug)]
pub struct LinkStore {
    uri: CoopUri,
    links: BTreeMap<String, Props>,
    clock: LogicalClock,
}

impl LinkStore {
    pub fn new(uri: CoopUri) -> Self {
        LinkStore {
            uri,
            links: BTreeMap::new(),
            clock: LogicalClock::new(),
        }
    }

    /// Stamp of the latest mutation
    pub fn stamp(&self) -> LogicalStamp {
        self.clock.current()
    }

    pub fn last_modified(&self) -> HttpTime {
        self.clock.current().time
    }

    /// Apply `add` for each pair. The whole call is rejected if any pair is
    /// invalid.
    pub fn put<K, V>(
        &mut self,
        target: &str,
        props: impl IntoIterator<Item = (K, V)>,
    ) -> CoopResult<Vec<CoopEvent>>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let props: Vec<(String, String)> = props
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for (key, _) in &props {
            validate(target, key)?;
        }

        let mut events = Vec::with_capacity(props.len());
        for (key, value) in props {
            events.extend(self.add(target, &key, &value)?);
        }
        Ok(events)
    }

    /// Set one property. Returns `None` when the value is unchanged.
    pub fn add(&mut self, target: &str, key: &str, value: &str) -> CoopResult<Option<CoopEvent>> {
        validate(target, key)?;

        let props = self.links.entry(target.to_string()).or_default();
        if props.get(key).map(String::as_str) == Some(value) {
            return Ok(None);
        }
        props.insert(key.to_string(), value.to_string());

        Ok(Some(CoopEvent::LinkAdded(self.change(target, key, value))))
    }

    /// Delete one property. The event carries the last value.
    pub fn remove(&mut self, target: &str, key: &str) -> Option<CoopEvent> {
        let props = self.links.get_mut(target)?;
        let value = props.remove(key)?;
        if props.is_empty() {
            self.links.remove(target);
        }

        Some(CoopEvent::LinkRemoved(self.change(target, key, &value)))
    }

    /// Bulk `remove`
    pub fn drop<K: AsRef<str>>(
        &mut self,
        target: &str,
        keys: impl IntoIterator<Item = K>,
    ) -> Vec<CoopEvent> {
        keys.into_iter()
            .filter_map(|key| self.remove(target, key.as_ref()))
            .collect()
    }

    pub fn get_props(&self, target: &str) -> Props {
        self.links.get(target).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> LinksSnapshot {
        let stamp = self.stamp();
        LinksSnapshot {
            uri: self.uri.clone(),
            time: stamp.time,
            clock: stamp.clock,
            list: self
                .links
                .iter()
                .map(|(target, props)| LinkSet {
                    uri: target.clone(),
                    links: props
                        .iter()
                        .map(|(key, value)| KeyValue {
                            key: key.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Answer a GET on the list resource.
    pub fn respond(&self, if_modified_since: Option<HttpTime>) -> CoopResult<Response> {
        if if_modified_since.is_some_and(|since| self.last_modified() <= since) {
            return Ok(not_modified());
        }
        let last_modified = self.last_modified().to_http_date();
        Ok(response(
            StatusCode::OK,
            &[
                (CONTENT_TYPE, coop_core::APPLICATION_JSON),
                (LAST_MODIFIED, &last_modified),
            ],
            Body::json(&self.snapshot())?,
        ))
    }

    /// Validate a fetched list resource of `source`.
    pub fn parse_response(response: &Response, source: &CoopUri) -> CoopResult<LinksSnapshot> {
        if response.status() != StatusCode::OK {
            return Err(CoopError::ProtocolViolation(format!(
                "{source} list answered {}",
                response.status()
            )));
        }
        let snapshot: LinksSnapshot = response
            .body()
            .parse_json()
            .map_err(|e| CoopError::ProtocolViolation(format!("{source} list: {e}")))?;

        if snapshot.uri != *source {
            return Err(CoopError::ProtocolViolation(format!(
                "{source} list claims to be {}",
                snapshot.uri
            )));
        }
        if let Some(bad) = snapshot
            .list
            .iter()
            .find(|set| url::Url::parse(&set.uri).is_err())
        {
            return Err(CoopError::ProtocolViolation(format!(
                "{source} list names invalid uri {:?}",
                bad.uri
            )));
        }
        Ok(snapshot)
    }

    fn change(&mut self, target: &str, key: &str, value: &str) -> LinkChange {
        let stamp = self.clock.tick();
        LinkChange {
            uri: self.uri.clone(),
            time: stamp.time,
            clock: stamp.clock,
            link: Link {
                uri: target.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            },
        }
    }
}
