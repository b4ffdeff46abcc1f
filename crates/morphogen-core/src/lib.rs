//! Differential growth of a cellular mesh.
//!
//! A dynamic triangulated surface whose vertices ("cells") gather a scalar
//! resource, split when saturated, repel one another through space, and
//! relax toward a smooth surface under local spring/planar/bulge forces.
//! The engine runs bulk-synchronous frames: growth, spatial-index-backed
//! collision response, parallel force evaluation, then integration.

pub mod cell;
pub mod config;
pub mod engine;
pub mod geometry;
pub mod ply;
pub mod snapshot;

pub use cell::{connect, Cell, ForceSample};
pub use config::{
    Accelerator, Food, GrowthConfig, GrowthConfigError, InitShape, SplitMode,
};
pub use engine::{
    EngineError, Frame, FrameReport, NullProgress, ProgressSink, Simulation, MAX_POP,
};
pub use ply::BootstrapError;
pub use snapshot::MeshSnapshot;

pub use glam::DVec3;
