//! Force fields assembled from grid responses

use thiserror::Error;
use tracing::debug;

use crate::protocol::{ForceDelta, GridDescriptor, GridNode};

/// Problems with a node list returned for a grid request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LatticeError {
    #[error("Node {index:?} lies outside a {counts:?} lattice")]
    OutOfRange { index: [u64; 3], counts: [u64; 3] },

    #[error("Node {index:?} appears more than once")]
    Duplicate { index: [u64; 3] },

    #[error("Expected {expected} nodes, got {got}")]
    Missing { expected: u64, got: u64 },

    #[error("Lattice of {counts:?} is too large to hold")]
    TooLarge { counts: [u64; 3] },
}

/// A dense lattice of force deltas
#[derive(Debug, Clone, PartialEq)]
pub struct ForceField {
    offset: [f64; 3],
    spacing: [f64; 3],
    counts: [u64; 3],
    forces: Vec<ForceDelta>,
}

impl ForceField {
    /// Place every node of a response onto the lattice it was requested for
    pub fn from_nodes(grid: &GridDescriptor, nodes: &[GridNode]) -> Result<Self, LatticeError> {
        let counts = grid.node_counts;
        let total = grid
            .node_total()
            .and_then(|t| usize::try_from(t).ok())
            .ok_or(LatticeError::TooLarge { counts })?;

        let mut slots: Vec<Option<ForceDelta>> = vec![None; total];
        for node in nodes {
            let index = node.index();
            if (0..3).any(|axis| index[axis] >= counts[axis]) {
                return Err(LatticeError::OutOfRange { index, counts });
            }
            let slot = &mut slots[flat_index(counts, index)];
            if slot.replace(node.force).is_some() {
                return Err(LatticeError::Duplicate { index });
            }
        }

        let got = nodes.len() as u64;
        let forces: Option<Vec<ForceDelta>> = slots.into_iter().collect();
        let forces = forces.ok_or(LatticeError::Missing {
            expected: total as u64,
            got,
        })?;

        debug!(?counts, "ForceField::from_nodes: assembled");
        Ok(Self {
            offset: grid.offset,
            spacing: grid.spacing,
            counts,
            forces,
        })
    }

    pub fn node_counts(&self) -> [u64; 3] {
        self.counts
    }

    pub fn is_empty(&self) -> bool {
        self.forces.is_empty()
    }

    /// Force stored at one node
    pub fn at(&self, index: [u64; 3]) -> Option<ForceDelta> {
        if (0..3).any(|axis| index[axis] >= self.counts[axis]) {
            return None;
        }
        self.forces.get(flat_index(self.counts, index)).copied()
    }

    /// Trilinear interpolation between the eight nodes around `position`
    ///
    /// Points outside the lattice use the outermost cell, so the field
    /// continues linearly past its edges. An axis with a single node is
    /// constant along that axis. Returns `None` for an empty lattice.
    pub fn interpolate(&self, position: [f64; 3]) -> Option<ForceDelta> {
        if self.is_empty() {
            return None;
        }

        let mut lower = [0u64; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let (bin, t) = self.locate(axis, position[axis]);
            lower[axis] = bin;
            frac[axis] = t;
        }

        let mut out = [0.0f64; 3];
        for corner in 0..8u8 {
            let mut index = lower;
            let mut weight = 1.0;
            for axis in 0..3 {
                let upper = corner & (1 << axis) != 0;
                if self.counts[axis] > 1 && upper {
                    index[axis] += 1;
                }
                if self.counts[axis] > 1 {
                    weight *= if upper { frac[axis] } else { 1.0 - frac[axis] };
                } else if upper {
                    weight = 0.0;
                }
            }
            if weight == 0.0 {
                continue;
            }
            let force = self.at(index)?.to_array();
            for (o, f) in out.iter_mut().zip(force) {
                *o += weight * f;
            }
        }
        Some(ForceDelta::from(out))
    }

    /// Lower node of the cell holding `coord`, and the fraction across it
    fn locate(&self, axis: usize, coord: f64) -> (u64, f64) {
        let count = self.counts[axis];
        if count < 2 {
            return (0, 0.0);
        }
        let spacing = self.spacing[axis];
        let relative = (coord - self.offset[axis]) / spacing;
        let last_cell = (count - 2) as f64;
        let bin = relative.floor().clamp(0.0, last_cell);
        (bin as u64, relative - bin)
    }
}

fn flat_index(counts: [u64; 3], index: [u64; 3]) -> usize {
    ((index[0] * counts[1] + index[1]) * counts[2] + index[2]) as usize
}
