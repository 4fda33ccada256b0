//! Transport seam
//!
//! A coop node never touches sockets. It consumes three capabilities from
//! the peer transport: fetching a peer-addressed URL, receiving inbound
//! requests together with the requester's identity, and subscribing to a
//! remote event stream.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{ACCEPT, HeaderName};
use http::StatusCode;
use tokio::sync::oneshot;

use coop_core::{
    not_found, CoopError, CoopResult, EventStream, PeerId, Request, Response, LAST_EVENT_ID,
    TEXT_EVENT_STREAM,
};

/// Identifier of a registered request handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

/// Inbound request addressed to the local node
///
/// Exactly one response is delivered per request. A handler that does not
/// answer leaves the request to the next handler; when the event is dropped
/// unanswered the requester receives 404.
pub struct FetchEvent {
    request: Request,
    remote: PeerId,
    responder: Option<oneshot::Sender<Response>>,
}

impl FetchEvent {
    pub fn new(request: Request, remote: PeerId) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let event = FetchEvent {
            request,
            remote,
            responder: Some(tx),
        };
        (event, rx)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    /// Identity of the peer that sent the request
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub fn is_responded(&self) -> bool {
        self.responder.is_none()
    }

    /// Answer the request.
    ///
    /// # Panics
    ///
    /// Responding twice is a handler bug and panics.
    pub fn respond_with(&mut self, response: Response) {
        match self.responder.take() {
            Some(responder) => {
                // The requester may have given up; nothing to do then.
                let _ = responder.send(response);
            }
            None => panic!("already responded to {}", self.request.url),
        }
    }
}

impl Drop for FetchEvent {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(not_found());
        }
    }
}

/// Inbound request handler
pub trait RequestHandler: Send + Sync {
    fn handle(&self, event: &mut FetchEvent);
}

/// Peer transport consumed by a coop node
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of the local endpoint
    fn local_peer(&self) -> PeerId;

    /// Send `request` to the peer named in its URL authority.
    ///
    /// Fails with `Unreachable` when the peer cannot be contacted.
    async fn fetch(&self, request: Request) -> CoopResult<Response>;

    /// Register a handler for requests addressed to the local peer
    fn add_handler(&self, handler: Arc<dyn RequestHandler>) -> HandlerId;

    /// Deregister a handler; unknown ids are ignored
    fn remove_handler(&self, id: HandlerId);

    /// Subscribe to a remote event resource.
    ///
    /// Resolves once the subscription is open. Dropping the stream closes it.
    async fn open_event_source(
        &self,
        url: &str,
        last_event_id: Option<&str>,
    ) -> CoopResult<EventStream> {
        let mut request = Request::get(url).with_header(ACCEPT, TEXT_EVENT_STREAM);
        if let Some(id) = last_event_id {
            request = request.with_header(HeaderName::from_static(LAST_EVENT_ID), id);
        }

        let response = self.fetch(request).await?;
        if response.status() != StatusCode::OK {
            return Err(CoopError::Unreachable(format!(
                "event source {url} answered {}",
                response.status()
            )));
        }
        response.into_body().into_events().ok_or_else(|| {
            CoopError::ProtocolViolation(format!("event source {url} is not an event stream"))
        })
    }
}
