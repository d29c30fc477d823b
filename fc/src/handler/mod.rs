//! Request handlers
//!
//! The router hands every `request` and `gridRequest` to one
//! [`RequestHandler`] chosen when the controller is built. Handlers run
//! synchronously on the polling task. Most answer the sender at once; the
//! dependent handler holds replies until every registered peer has reported.

use thiserror::Error;

use crate::channel::PeerId;
use crate::protocol::{AtomRecord, Envelope, GridDescriptor};

mod atoms;
mod dependent;
mod grid;
mod progress;

pub use atoms::{DEFAULT_PROGRESS_EVERY, IndependentAtomHandler};
pub use dependent::{BatchModel, DependentAtomHandler};
pub use grid::{DEFAULT_MAX_GRID_NODES, GridSample, GridSamplingHandler};
pub use progress::{ProgressSink, TracingProgress};

/// Work the router dispatches to a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Atoms(Vec<AtomRecord>),
    Grid(GridDescriptor),
}

impl Request {
    /// The wire `type` this request arrived as
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Atoms(_) => "request",
            Request::Grid(_) => "gridRequest",
        }
    }
}

/// Reasons a handler declines a request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    #[error("Handler '{handler}' does not serve '{kind}' messages")]
    Unsupported {
        handler: &'static str,
        kind: &'static str,
    },

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),
}

/// An envelope addressed to one peer
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub to: PeerId,
    pub envelope: Envelope,
}

impl Reply {
    pub fn new(to: PeerId, envelope: Envelope) -> Self {
        Self { to, envelope }
    }
}

/// Strategy for turning requests into replies
pub trait RequestHandler: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Serve a request from `from` while `peers` peers are registered
    ///
    /// The replies may address any peer, and may be empty when the answer
    /// is deferred to a later [`RequestHandler::poll`].
    fn handle(&mut self, from: PeerId, request: Request, peers: u64) -> Result<Vec<Reply>, HandlerError>;

    /// Advance deferred work; the router calls this once per poll iteration
    fn poll(&mut self, _peers: u64) -> Vec<Reply> {
        Vec::new()
    }
}

impl<H: RequestHandler + ?Sized> RequestHandler for Box<H> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn handle(&mut self, from: PeerId, request: Request, peers: u64) -> Result<Vec<Reply>, HandlerError> {
        (**self).handle(from, request, peers)
    }

    fn poll(&mut self, peers: u64) -> Vec<Reply> {
        (**self).poll(peers)
    }
}

/// Serve `request` as the only registered peer and unwrap the single reply
#[cfg(test)]
pub(crate) fn serve<H: RequestHandler>(handler: &mut H, request: Request) -> Result<Envelope, HandlerError> {
    let from = PeerId(1);
    let mut replies = handler.handle(from, request, 1)?;
    assert_eq!(replies.len(), 1, "expected exactly one reply, got {:?}", replies);
    let reply = replies.remove(0);
    assert_eq!(reply.to, from);
    Ok(reply.envelope)
}
