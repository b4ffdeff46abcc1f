//! Simulation parameters and their validation.

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised when validating a growth configuration.
#[derive(Debug, Error)]
pub enum GrowthConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Initial mesh shape seeded before the first frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitShape {
    #[default]
    Sphere,
    Plane,
    Environment,
    Mesh,
}

/// Per-frame food accrual policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Food {
    Random,
    #[default]
    Area,
    XCoord,
    Radial,
    Collisions,
    Curvature,
    Inherit,
    Hybrid,
    Shift,
    Tentacle,
}

/// How a saturated cell chooses its ring partition axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Partition at ring index 0 and its diametric opposite.
    Zero,
    /// Partition at the farthest neighbor and its diametric opposite.
    #[default]
    Long,
}

/// Which spatial accelerator backs the collision phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    #[default]
    KdTree,
    Grid,
}

/// Static configuration for a growth simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthConfig {
    /// Initial mesh shape.
    pub init_shape: InitShape,
    /// Polygon file backing `InitShape::Mesh`.
    pub mesh_path: Option<PathBuf>,
    /// Active food accrual policy.
    pub food_mode: Food,
    /// Ring partition strategy for splits.
    pub split_mode: SplitMode,
    /// Spatial accelerator backing the collision phase.
    pub accelerator: Accelerator,
    /// Food level above which a cell splits.
    pub threshold: f64,
    /// Ring size above which a cell splits regardless of food.
    pub max_degree: usize,
    /// Spring force coefficient.
    pub spring_factor: f64,
    /// Planar relaxation coefficient.
    pub planar_factor: f64,
    /// Bulge force coefficient.
    pub bulge_factor: f64,
    /// Rest length of mesh edges.
    pub spring_length: f64,
    /// Radius of the collision repulsion ball.
    pub collision_radius: f64,
    /// Scale applied to the averaged collision response.
    pub collision_factor: f64,
    /// Cells older than this skip their own collision scan.
    pub collision_age_threshold: u32,
    /// Integration scale applied to accumulated deltas.
    pub dampening: f64,
    /// Exponent applied by the CURVATURE food policy.
    pub curvature_factor: f64,
    /// Icosphere subdivision level for `InitShape::Sphere`.
    pub sphere_subdivisions: u32,
    /// Grid side length for `InitShape::Plane` / `InitShape::Environment`.
    pub plane_resolution: usize,
    /// Scaffold band width (in grid rows) for `InitShape::Environment`.
    pub environment_border: usize,
    /// Maximum number of recent frame reports retained in-memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Worker count for parallel phases; `None` derives it from the host.
    pub worker_threads: Option<usize>,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            init_shape: InitShape::Sphere,
            mesh_path: None,
            food_mode: Food::Area,
            split_mode: SplitMode::Long,
            accelerator: Accelerator::KdTree,
            threshold: 15.0,
            max_degree: 12,
            spring_factor: 0.2,
            planar_factor: 0.12,
            bulge_factor: 0.08,
            spring_length: 1.0,
            collision_radius: 1.4,
            collision_factor: 0.2,
            collision_age_threshold: u32::MAX,
            dampening: 0.12,
            curvature_factor: 2.0,
            sphere_subdivisions: 2,
            plane_resolution: 24,
            environment_border: 2,
            history_capacity: 256,
            rng_seed: None,
            worker_threads: None,
        }
    }
}

impl GrowthConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), GrowthConfigError> {
        if self.threshold <= 0.0 || !self.threshold.is_finite() {
            return Err(GrowthConfigError::InvalidConfig(
                "threshold must be positive",
            ));
        }
        if self.max_degree < 3 {
            return Err(GrowthConfigError::InvalidConfig(
                "max_degree must be at least 3",
            ));
        }
        if self.spring_length <= 0.0 || !self.spring_length.is_finite() {
            return Err(GrowthConfigError::InvalidConfig(
                "spring_length must be positive",
            ));
        }
        if self.collision_radius <= 0.0 || !self.collision_radius.is_finite() {
            return Err(GrowthConfigError::InvalidConfig(
                "collision_radius must be positive",
            ));
        }
        if self.dampening <= 0.0 || !self.dampening.is_finite() {
            return Err(GrowthConfigError::InvalidConfig(
                "dampening must be positive",
            ));
        }
        if self.spring_factor < 0.0
            || self.planar_factor < 0.0
            || self.bulge_factor < 0.0
            || self.collision_factor < 0.0
        {
            return Err(GrowthConfigError::InvalidConfig(
                "force and collision factors must be non-negative",
            ));
        }
        if !self.curvature_factor.is_finite() {
            return Err(GrowthConfigError::InvalidConfig(
                "curvature_factor must be finite",
            ));
        }
        if self.plane_resolution < 2
            && matches!(self.init_shape, InitShape::Plane | InitShape::Environment)
        {
            return Err(GrowthConfigError::InvalidConfig(
                "plane_resolution must be at least 2",
            ));
        }
        if self.init_shape == InitShape::Mesh && self.mesh_path.is_none() {
            return Err(GrowthConfigError::InvalidConfig(
                "init_shape = mesh requires mesh_path",
            ));
        }
        if self.history_capacity == 0 {
            return Err(GrowthConfigError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(GrowthConfigError::InvalidConfig(
                "worker_threads must be non-zero when set",
            ));
        }
        Ok(())
    }

    /// Returns an RNG from the configured seed, or from entropy if absent.
    pub(crate) fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        GrowthConfig::default().validate().expect("default valid");
    }

    #[test]
    fn validation_names_the_offending_field() {
        let bad = GrowthConfig {
            dampening: 0.0,
            ..GrowthConfig::default()
        };
        let err = bad.validate().expect_err("zero dampening rejected");
        assert!(err.to_string().contains("dampening"));

        let bad = GrowthConfig {
            max_degree: 2,
            ..GrowthConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = GrowthConfig {
            init_shape: InitShape::Mesh,
            ..GrowthConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn seeded_rngs_agree() {
        use rand::Rng;
        let config = GrowthConfig {
            rng_seed: Some(99),
            ..GrowthConfig::default()
        };
        let mut a = config.seeded_rng();
        let mut b = config.seeded_rng();
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }
}
