//! Response bodies exchanged through the transport
//!
//! Responses use the `http` crate types; only the body is coop-specific,
//! because the event resource answers with a live stream of messages
//! instead of bytes.

use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;
use http::header::{AsHeaderName, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::{CoopError, CoopResult};

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
pub const LAST_EVENT_ID: &str = "last-event-id";

pub type Response = http::Response<Body>;

/// Outbound request
///
/// Peer-addressed URLs (`http2p:<peer>/...`) are not valid `http::Uri`s, so
/// the URL is carried as a plain string next to `http` headers.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Request {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Add a header; values that are not valid header text are skipped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

/// Header value as text, if present and visible ASCII
pub fn header_str(headers: &HeaderMap, name: impl AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build a response from status, headers and body.
pub fn response(status: StatusCode, headers: &[(HeaderName, &str)], body: Body) -> Response {
    let mut res = http::Response::new(body);
    *res.status_mut() = status;
    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            res.headers_mut().insert(name.clone(), value);
        }
    }
    res
}

pub fn not_found() -> Response {
    response(StatusCode::NOT_FOUND, &[], Body::Empty)
}

pub fn not_modified() -> Response {
    response(StatusCode::NOT_MODIFIED, &[], Body::Empty)
}

/// One server-sent message: optional id, event name and data line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

impl MessageEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        MessageEvent {
            id: None,
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Live message stream
pub type EventStream = BoxStream<'static, MessageEvent>;

/// Response body
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    Events(EventStream),
}

impl Body {
    pub fn json<T: serde::Serialize>(value: &T) -> CoopResult<Self> {
        Ok(Body::Full(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Buffered bytes, if this is not a stream
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Decode a buffered JSON body
    pub fn parse_json<T: DeserializeOwned>(&self) -> CoopResult<T> {
        match self {
            Body::Full(bytes) => Ok(serde_json::from_slice(bytes)?),
            Body::Empty => Err(CoopError::Codec("empty body".into())),
            Body::Events(_) => Err(CoopError::Codec("streaming body".into())),
        }
    }

    pub fn into_events(self) -> Option<EventStream> {
        match self {
            Body::Events(stream) => Some(stream),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Events(_) => f.write_str("Body::Events(..)"),
        }
    }
}
