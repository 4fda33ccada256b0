//! Identity types for coop nodes
//!
//! Every node is addressed by the peer identity of its transport. Its coop
//! URI has the form `<scheme>:<peer-id>/.well-known/<app>/coop/`, with two
//! sub-resources hanging off it: `list` and `event`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CoopError, CoopResult};

pub const DEFAULT_SCHEME: &str = "http2p";
pub const DEFAULT_APP: &str = "http2p";

const WELL_KNOWN: &str = "/.well-known/";
const COOP_SEGMENT: &str = "/coop/";

/// Peer identity - the authority part of every peer-addressed URI
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three resources a coop node serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WellKnown {
    /// `.../coop/` - the key set
    Keys,
    /// `.../coop/list` - the property snapshot
    List,
    /// `.../coop/event` - the live event stream
    Event,
}

impl WellKnown {
    pub fn suffix(self) -> &'static str {
        match self {
            WellKnown::Keys => "",
            WellKnown::List => "list",
            WellKnown::Event => "event",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "" => Some(WellKnown::Keys),
            "list" => Some(WellKnown::List),
            "event" => Some(WellKnown::Event),
            _ => None,
        }
    }
}

/// Coop URI - stable identifier of a node's discovery/replication endpoint
///
/// Always ends with `/coop/`, so sub-resources are formed by appending
/// their suffix.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoopUri {
    uri: String,
    scheme_len: usize,
    peer_end: usize,
}

impl CoopUri {
    /// Parse a coop URI, checking its structure only (any scheme, any app).
    pub fn parse(uri: &str) -> CoopResult<Self> {
        let invalid = || CoopError::InvalidArgument(format!("not a coop URI: {uri}"));
        url::Url::parse(uri).map_err(|_| invalid())?;

        let (scheme, rest) = uri.split_once(':').ok_or_else(invalid)?;
        let peer_len = rest.find('/').ok_or_else(invalid)?;
        if scheme.is_empty() || peer_len == 0 {
            return Err(invalid());
        }

        let path = &rest[peer_len..];
        let app = path
            .strip_prefix(WELL_KNOWN)
            .and_then(|p| p.strip_suffix(COOP_SEGMENT))
            .ok_or_else(invalid)?;
        if app.is_empty() || app.contains('/') {
            return Err(invalid());
        }

        Ok(CoopUri {
            uri: uri.to_string(),
            scheme_len: scheme.len(),
            peer_end: scheme.len() + 1 + peer_len,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub fn scheme(&self) -> &str {
        &self.uri[..self.scheme_len]
    }

    /// Peer identity embedded in the URI authority
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(&self.uri[self.scheme_len + 1..self.peer_end])
    }

    /// The `<app>` path segment
    pub fn app(&self) -> &str {
        let path = &self.uri[self.peer_end + WELL_KNOWN.len()..];
        &path[..path.len() - COOP_SEGMENT.len()]
    }

    /// Absolute URI of one of this node's resources
    pub fn resource(&self, resource: WellKnown) -> String {
        format!("{}{}", self.uri, resource.suffix())
    }

    pub fn list_uri(&self) -> String {
        self.resource(WellKnown::List)
    }

    pub fn event_uri(&self) -> String {
        self.resource(WellKnown::Event)
    }
}

impl fmt::Debug for CoopUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coop({})", self.uri)
    }
}

impl fmt::Display for CoopUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl TryFrom<String> for CoopUri {
    type Error = CoopError;

    fn try_from(uri: String) -> CoopResult<Self> {
        CoopUri::parse(&uri)
    }
}

impl From<CoopUri> for String {
    fn from(uri: CoopUri) -> Self {
        uri.uri
    }
}

/// Naming convention shared by all nodes of one deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoopNaming {
    scheme: String,
    app: String,
}

impl CoopNaming {
    pub fn new(scheme: impl Into<String>, app: impl Into<String>) -> Self {
        CoopNaming {
            scheme: scheme.into(),
            app: app.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Coop URI of the node reachable through `peer`
    pub fn coop_uri(&self, peer: &PeerId) -> CoopUri {
        let scheme_len = self.scheme.len();
        let peer_end = scheme_len + 1 + peer.as_str().len();
        CoopUri {
            uri: format!(
                "{}:{}{}{}{}",
                self.scheme,
                peer,
                WELL_KNOWN,
                self.app,
                COOP_SEGMENT
            ),
            scheme_len,
            peer_end,
        }
    }

    /// Whether `uri` belongs to this deployment's scheme and app
    pub fn accepts(&self, uri: &CoopUri) -> bool {
        uri.scheme() == self.scheme && uri.app() == self.app
    }

    /// Parse a coop URI and require this deployment's scheme and app.
    pub fn parse(&self, uri: &str) -> CoopResult<CoopUri> {
        let parsed = CoopUri::parse(uri)?;
        if !self.accepts(&parsed) {
            return Err(CoopError::InvalidArgument(format!(
                "coop URI outside {}:/{}: {uri}",
                self.scheme, self.app
            )));
        }
        Ok(parsed)
    }

    /// Split a request URL into the addressed peer and well-known resource.
    pub fn resolve(&self, url: &str) -> Option<(PeerId, WellKnown)> {
        let rest = url.strip_prefix(&self.scheme)?.strip_prefix(':')?;
        let peer_len = rest.find('/')?;
        let suffix = rest[peer_len..]
            .strip_prefix(WELL_KNOWN)?
            .strip_prefix(self.app.as_str())?
            .strip_prefix(COOP_SEGMENT)?;
        let resource = WellKnown::from_suffix(suffix)?;
        Some((PeerId::new(&rest[..peer_len]), resource))
    }
}

impl Default for CoopNaming {
    fn default() -> Self {
        CoopNaming::new(DEFAULT_SCHEME, DEFAULT_APP)
    }
}
