//! Grid-sampling handler
//!
//! Collapses what would be one round trip per atom into a single
//! request/response covering a whole lattice: the engine asks for forces at
//! every node and interpolates locally between them.

use tracing::debug;

use super::{HandlerError, Reply, Request, RequestHandler};
use crate::channel::PeerId;
use crate::protocol::{AtomRecord, Envelope, ForceDelta, GridDescriptor, GridNode};

/// Largest lattice served in one response
pub const DEFAULT_MAX_GRID_NODES: u64 = 1 << 24;

/// What the callback sees for one lattice node
#[derive(Debug, Clone, Copy)]
pub struct GridSample<'a> {
    pub index: [u64; 3],
    pub position: [f64; 3],
    /// Set only for the first node of a request
    pub first: bool,
    /// Atoms forwarded with the request, empty when none were sent
    pub atoms: &'a [AtomRecord],
}

/// Calls a position callback once per lattice node, in x-major order
pub struct GridSamplingHandler<F> {
    callback: F,
    max_nodes: u64,
    every: Option<u64>,
    grids: u64,
}

impl<F> GridSamplingHandler<F>
where
    F: FnMut(&GridSample<'_>) -> ForceDelta + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            max_nodes: DEFAULT_MAX_GRID_NODES,
            every: None,
            grids: 0,
        }
    }

    pub fn with_max_nodes(mut self, max_nodes: u64) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    /// Ask the engine to resample every `steps` timesteps
    pub fn with_every(mut self, steps: u64) -> Self {
        self.every = Some(steps);
        self
    }

    /// Grids sampled so far
    pub fn grids(&self) -> u64 {
        self.grids
    }

    fn validate(&self, grid: &GridDescriptor) -> Result<u64, HandlerError> {
        if grid.offset.iter().chain(grid.spacing.iter()).any(|v| !v.is_finite()) {
            return Err(HandlerError::InvalidGrid("offset and spacing must be finite".to_string()));
        }
        let total = grid
            .node_total()
            .ok_or_else(|| HandlerError::InvalidGrid("node count overflows".to_string()))?;
        if total > self.max_nodes {
            return Err(HandlerError::InvalidGrid(format!(
                "{} nodes exceeds the limit of {}",
                total, self.max_nodes
            )));
        }
        Ok(total)
    }
}

impl<F> RequestHandler for GridSamplingHandler<F>
where
    F: FnMut(&GridSample<'_>) -> ForceDelta + Send,
{
    fn name(&self) -> &'static str {
        "grid"
    }

    fn handle(&mut self, from: PeerId, request: Request, _peers: u64) -> Result<Vec<Reply>, HandlerError> {
        let grid = match request {
            Request::Grid(grid) => grid,
            other => {
                return Err(HandlerError::Unsupported {
                    handler: self.name(),
                    kind: other.kind(),
                });
            }
        };

        let total = self.validate(&grid)?;
        self.grids += 1;
        debug!(counts = ?grid.node_counts, total, "GridSamplingHandler: sampling");

        let atoms = grid.atoms.as_deref().unwrap_or(&[]);
        let mut nodes = Vec::with_capacity(total as usize);
        for index in grid.indices() {
            let sample = GridSample {
                index,
                position: grid.position(index),
                first: nodes.is_empty(),
                atoms,
            };
            nodes.push(GridNode::new(index, (self.callback)(&sample)));
        }

        let response = Envelope::Response {
            atoms: None,
            nodes: Some(nodes),
            every: self.every,
        };
        Ok(vec![Reply::new(from, response)])
    }
}
