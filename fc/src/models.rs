//! Demonstration force models served by `fc run`

use serde::{Deserialize, Serialize};

use crate::handler::{BatchModel, GridSample};
use crate::protocol::{AtomRecord, ForceDelta};

/// Built-in force corrections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    /// No correction anywhere
    #[default]
    Zero,
    /// Soft walls at y = ±radius pushing atoms back toward the bulk
    Wall,
}

/// Parameters of the sigmoid wall
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wall {
    pub radius: f64,
    pub steepness: f64,
    pub magnitude: f64,
}

impl Default for Wall {
    fn default() -> Self {
        Self {
            radius: 50.0,
            steepness: 1.0,
            magnitude: 0.1,
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Wall {
    /// Correction at height `y`
    pub fn force_at(&self, y: f64) -> ForceDelta {
        let dfy = self.magnitude
            * (sigmoid(self.steepness * (-y - self.radius)) - sigmoid(self.steepness * (y - self.radius)));
        ForceDelta::new(0.0, dfy, 0.0)
    }
}

impl Model {
    /// Per-atom callback for the independent-atom handler
    ///
    /// Atoms without a numeric `y` get no correction.
    pub fn atom_callback(self) -> impl FnMut(&AtomRecord) -> ForceDelta + Send + 'static {
        let wall = Wall::default();
        move |atom: &AtomRecord| match self {
            Model::Zero => ForceDelta::ZERO,
            Model::Wall => atom
                .get("y")
                .and_then(|y| y.as_f64())
                .map(|y| wall.force_at(y))
                .unwrap_or(ForceDelta::ZERO),
        }
    }

    /// Per-node callback for the grid-sampling handler
    pub fn grid_callback(self) -> impl FnMut(&GridSample<'_>) -> ForceDelta + Send + 'static {
        let wall = Wall::default();
        move |sample: &GridSample<'_>| match self {
            Model::Zero => ForceDelta::ZERO,
            Model::Wall => wall.force_at(sample.position[1]),
        }
    }

    /// Whole-step model for the dependent-atom handler
    pub fn batch_model(self) -> StepModel {
        StepModel {
            model: self,
            wall: Wall::default(),
            forces: Vec::new(),
        }
    }
}

/// Applies a model to a full timestep at once
///
/// The wall follows the system: it is centred on the mean `y` of every atom
/// in the step rather than on the origin.
#[derive(Debug, Clone)]
pub struct StepModel {
    model: Model,
    wall: Wall,
    forces: Vec<ForceDelta>,
}

impl BatchModel for StepModel {
    fn prepare(&mut self, atoms: &[AtomRecord]) -> bool {
        let heights: Vec<Option<f64>> = atoms.iter().map(|a| a.get("y").and_then(|y| y.as_f64())).collect();
        let known: Vec<f64> = heights.iter().flatten().copied().collect();
        let centre = if known.is_empty() {
            0.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        self.forces = heights
            .iter()
            .map(|y| match (self.model, y) {
                (Model::Wall, Some(y)) => self.wall.force_at(y - centre),
                _ => ForceDelta::ZERO,
            })
            .collect();
        true
    }

    fn force(&mut self, index: usize) -> ForceDelta {
        self.forces.get(index).copied().unwrap_or(ForceDelta::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wall_is_antisymmetric() {
        let wall = Wall::default();
        for y in [0.0, 10.0, 49.0, 50.0, 75.0] {
            let up = wall.force_at(y).dfy;
            let down = wall.force_at(-y).dfy;
            assert!((up + down).abs() < 1e-12);
        }
        assert!(wall.force_at(0.0).dfy.abs() < 1e-12);
    }

    #[test]
    fn test_wall_pushes_back_toward_bulk() {
        let wall = Wall::default();
        assert!(wall.force_at(60.0).dfy < -0.09);
        assert!(wall.force_at(-60.0).dfy > 0.09);
        assert!(wall.force_at(20.0).dfy.abs() < 1e-6);
    }

    #[test]
    fn test_atom_callback_reads_y() {
        let mut cb = Model::Wall.atom_callback();
        let atom = json!({"x": 0.0, "y": 60.0}).as_object().unwrap().clone();
        assert!(cb(&atom).dfy < 0.0);
        assert_eq!(cb(&AtomRecord::new()), ForceDelta::ZERO);
    }

    #[test]
    fn test_step_model_wall_follows_centre() {
        let mut model = Model::Wall.batch_model();
        let atoms: Vec<AtomRecord> = [100.0, 160.0, 40.0]
            .iter()
            .map(|y| json!({"y": y}).as_object().unwrap().clone())
            .collect();

        assert!(model.prepare(&atoms));
        assert!(model.force(0).dfy.abs() < 1e-6);
        assert!(model.force(1).dfy < -0.09);
        assert!(model.force(2).dfy > 0.09);
        assert_eq!(model.force(3), ForceDelta::ZERO);
    }

    #[test]
    fn test_zero_model() {
        let mut cb = Model::Zero.grid_callback();
        let sample = GridSample {
            index: [0, 0, 0],
            position: [0.0, 100.0, 0.0],
            first: true,
            atoms: &[],
        };
        assert_eq!(cb(&sample), ForceDelta::ZERO);
    }
}
