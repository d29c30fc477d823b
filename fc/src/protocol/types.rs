//! Payload types carried inside envelopes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One particle as sent by the engine. Opaque to the controller.
pub type AtomRecord = Map<String, Value>;

/// Force correction for one atom or lattice node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForceDelta {
    pub dfx: f64,
    pub dfy: f64,
    pub dfz: f64,
}

impl ForceDelta {
    pub const ZERO: ForceDelta = ForceDelta {
        dfx: 0.0,
        dfy: 0.0,
        dfz: 0.0,
    };

    pub fn new(dfx: f64, dfy: f64, dfz: f64) -> Self {
        Self { dfx, dfy, dfz }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.dfx, self.dfy, self.dfz]
    }
}

impl From<[f64; 3]> for ForceDelta {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Typed atom state for engine-side emitters
///
/// Serialises to the field names the engine fix writes. Dipole components are
/// only present on the wire when `dipole` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AtomData {
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub force: [f64; 3],
    pub dipole: Option<[f64; 3]>,
}

impl AtomData {
    /// Convert to the opaque record form sent in a `request`
    pub fn to_record(&self) -> AtomRecord {
        let mut record = Map::new();
        for (axis, i) in [("x", 0), ("y", 1), ("z", 2)] {
            record.insert(axis.to_string(), Value::from(self.position[i]));
            record.insert(format!("v{axis}"), Value::from(self.velocity[i]));
            record.insert(format!("f{axis}"), Value::from(self.force[i]));
        }
        if let Some(mu) = self.dipole {
            record.insert("mux".to_string(), Value::from(mu[0]));
            record.insert("muy".to_string(), Value::from(mu[1]));
            record.insert("muz".to_string(), Value::from(mu[2]));
        }
        record
    }

    /// Best-effort parse of a record; missing numeric fields read as zero
    pub fn from_record(record: &AtomRecord) -> Self {
        let num = |key: &str| record.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let dipole = if record.contains_key("mux") {
            Some([num("mux"), num("muy"), num("muz")])
        } else {
            None
        };
        Self {
            position: [num("x"), num("y"), num("z")],
            velocity: [num("vx"), num("vy"), num("vz")],
            force: [num("fx"), num("fy"), num("fz")],
            dipole,
        }
    }
}

/// A regularly spaced 3-D lattice of sample points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDescriptor {
    pub offset: [f64; 3],
    pub spacing: [f64; 3],
    #[serde(rename = "nodeCounts")]
    pub node_counts: [u64; 3],

    /// Atoms the engine chose to forward along with the sampling request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atoms: Option<Vec<AtomRecord>>,
}

impl GridDescriptor {
    pub fn new(offset: [f64; 3], spacing: [f64; 3], node_counts: [u64; 3]) -> Self {
        Self {
            offset,
            spacing,
            node_counts,
            atoms: None,
        }
    }

    /// Total number of lattice nodes, or `None` on overflow
    pub fn node_total(&self) -> Option<u64> {
        self.node_counts[0]
            .checked_mul(self.node_counts[1])?
            .checked_mul(self.node_counts[2])
    }

    /// Absolute position of the node at `index`
    pub fn position(&self, index: [u64; 3]) -> [f64; 3] {
        [
            self.offset[0] + self.spacing[0] * index[0] as f64,
            self.offset[1] + self.spacing[1] * index[1] as f64,
            self.offset[2] + self.spacing[2] * index[2] as f64,
        ]
    }

    /// Iterate node indices in canonical order: x outermost, z innermost
    pub fn indices(&self) -> impl Iterator<Item = [u64; 3]> + '_ {
        let [nx, ny, nz] = self.node_counts;
        (0..nx).flat_map(move |x| (0..ny).flat_map(move |y| (0..nz).map(move |z| [x, y, z])))
    }
}

/// Force sampled at one lattice node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridNode {
    #[serde(rename = "xIndex")]
    pub x_index: u64,
    #[serde(rename = "yIndex")]
    pub y_index: u64,
    #[serde(rename = "zIndex")]
    pub z_index: u64,
    #[serde(flatten)]
    pub force: ForceDelta,
}

impl GridNode {
    pub fn new(index: [u64; 3], force: ForceDelta) -> Self {
        Self {
            x_index: index[0],
            y_index: index[1],
            z_index: index[2],
            force,
        }
    }

    pub fn index(&self) -> [u64; 3] {
        [self.x_index, self.y_index, self.z_index]
    }
}
