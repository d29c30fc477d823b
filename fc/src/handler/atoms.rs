//! Independent-atom handler

use tracing::debug;

use super::{HandlerError, ProgressSink, Reply, Request, RequestHandler, TracingProgress};
use crate::channel::PeerId;
use crate::protocol::{AtomRecord, Envelope, ForceDelta};

/// Requests between progress notifications
pub const DEFAULT_PROGRESS_EVERY: u64 = 100;

/// Calls a per-atom callback once for every atom in a batch
///
/// Atoms are processed in order with no state shared between them, so the
/// response lines up index-for-index with the request.
pub struct IndependentAtomHandler<F> {
    callback: F,
    requests: u64,
    progress_every: u64,
    sink: Box<dyn ProgressSink>,
}

impl<F> IndependentAtomHandler<F>
where
    F: FnMut(&AtomRecord) -> ForceDelta + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            requests: 0,
            progress_every: DEFAULT_PROGRESS_EVERY,
            sink: Box::new(TracingProgress),
        }
    }

    /// Notify every `n` requests; zero disables notifications
    pub fn with_progress_every(mut self, n: u64) -> Self {
        self.progress_every = n;
        self
    }

    pub fn with_progress_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Requests served so far
    pub fn requests(&self) -> u64 {
        self.requests
    }
}

impl<F> RequestHandler for IndependentAtomHandler<F>
where
    F: FnMut(&AtomRecord) -> ForceDelta + Send,
{
    fn name(&self) -> &'static str {
        "atoms"
    }

    fn handle(&mut self, from: PeerId, request: Request, _peers: u64) -> Result<Vec<Reply>, HandlerError> {
        let atoms = match request {
            Request::Atoms(atoms) => atoms,
            other => {
                return Err(HandlerError::Unsupported {
                    handler: self.name(),
                    kind: other.kind(),
                });
            }
        };

        self.requests += 1;
        if self.progress_every > 0 && self.requests % self.progress_every == 0 {
            self.sink.on_progress(self.requests);
        }

        debug!(atoms = atoms.len(), request = self.requests, "IndependentAtomHandler: computing");
        let deltas: Vec<ForceDelta> = atoms.iter().map(|atom| (self.callback)(atom)).collect();
        Ok(vec![Reply::new(from, Envelope::atom_response(deltas))])
    }
}
