//! Dependent-atom handler
//!
//! For force models where every atom's force depends on the whole system.
//! Each registered peer sends its share of a timestep; once all shares are
//! in, the model sees the concatenated batch and each peer gets back the
//! slice of forces for the atoms it sent.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{DEFAULT_PROGRESS_EVERY, HandlerError, ProgressSink, Reply, Request, RequestHandler, TracingProgress};
use crate::channel::PeerId;
use crate::protocol::{AtomRecord, Envelope, ForceDelta};

/// A force model that needs a full timestep before it can answer
pub trait BatchModel: Send {
    /// Offer every atom of the step, ordered by peer
    ///
    /// Returning `false` means the model is not ready yet; it is offered the
    /// same batch again on the next poll.
    fn prepare(&mut self, atoms: &[AtomRecord]) -> bool;

    /// Force on the atom at `index` of the batch last accepted by `prepare`
    fn force(&mut self, index: usize) -> ForceDelta;
}

impl<M: BatchModel + ?Sized> BatchModel for Box<M> {
    fn prepare(&mut self, atoms: &[AtomRecord]) -> bool {
        (**self).prepare(atoms)
    }

    fn force(&mut self, index: usize) -> ForceDelta {
        (**self).force(index)
    }
}

/// Gathers one request per registered peer, then answers them all together
///
/// Peers still in the gather phase get `waiting`. Once the batch is sealed,
/// every peer in it gets `waiting` on each poll the model declines. Requests
/// that arrive while a sealed batch waits on the model start the next one.
pub struct DependentAtomHandler<M> {
    model: M,
    gathering: BTreeMap<PeerId, Vec<AtomRecord>>,
    sealed: Option<Sealed>,
    steps: u64,
    progress_every: u64,
    sink: Box<dyn ProgressSink>,
}

struct Sealed {
    shares: BTreeMap<PeerId, Vec<AtomRecord>>,
    atoms: Vec<AtomRecord>,
}

impl<M: BatchModel> DependentAtomHandler<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            gathering: BTreeMap::new(),
            sealed: None,
            steps: 0,
            progress_every: DEFAULT_PROGRESS_EVERY,
            sink: Box::new(TracingProgress),
        }
    }

    /// Notify every `n` completed steps; zero disables notifications
    pub fn with_progress_every(mut self, n: u64) -> Self {
        self.progress_every = n;
        self
    }

    pub fn with_progress_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Steps answered so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Peers whose share of the next step has arrived
    pub fn gathered(&self) -> usize {
        self.gathering.len()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    fn seal(&mut self) -> Vec<Reply> {
        let shares = std::mem::take(&mut self.gathering);
        let atoms: Vec<AtomRecord> = shares.values().flatten().cloned().collect();
        debug!(peers = shares.len(), atoms = atoms.len(), "DependentAtomHandler: batch sealed");
        self.sealed = Some(Sealed { shares, atoms });
        self.try_finish()
    }

    fn try_finish(&mut self) -> Vec<Reply> {
        let Some(sealed) = self.sealed.as_ref() else {
            return Vec::new();
        };
        if !self.model.prepare(&sealed.atoms) {
            return sealed
                .shares
                .keys()
                .map(|&peer| Reply::new(peer, Envelope::Waiting))
                .collect();
        }

        let Some(Sealed { shares, .. }) = self.sealed.take() else {
            return Vec::new();
        };
        let mut replies = Vec::with_capacity(shares.len());
        let mut index = 0;
        for (peer, share) in shares {
            let deltas: Vec<ForceDelta> = (index..index + share.len()).map(|i| self.model.force(i)).collect();
            index += share.len();
            replies.push(Reply::new(peer, Envelope::atom_response(deltas)));
        }

        self.steps += 1;
        if self.progress_every > 0 && self.steps % self.progress_every == 0 {
            self.sink.on_progress(self.steps);
        }
        replies
    }
}

impl<M: BatchModel> RequestHandler for DependentAtomHandler<M> {
    fn name(&self) -> &'static str {
        "dependent"
    }

    fn handle(&mut self, from: PeerId, request: Request, peers: u64) -> Result<Vec<Reply>, HandlerError> {
        let atoms = match request {
            Request::Atoms(atoms) => atoms,
            other => {
                return Err(HandlerError::Unsupported {
                    handler: self.name(),
                    kind: other.kind(),
                });
            }
        };

        if self.gathering.insert(from, atoms).is_some() {
            info!(peer = %from, "Peer resent its share; keeping the latest");
        }
        if self.sealed.is_some() || (self.gathering.len() as u64) < peers {
            return Ok(vec![Reply::new(from, Envelope::Waiting)]);
        }
        Ok(self.seal())
    }

    /// Retry a sealed batch, or seal one a departure just completed
    fn poll(&mut self, peers: u64) -> Vec<Reply> {
        if self.sealed.is_some() {
            return self.try_finish();
        }
        if !self.gathering.is_empty() && self.gathering.len() as u64 >= peers {
            return self.seal();
        }
        Vec::new()
    }
}
