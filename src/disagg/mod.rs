//! Disaggregation of the seed hazard into 8-D matrices.

pub mod disaggregator;
pub mod matrix;
pub mod seeds;

pub use self::disaggregator::{DisaggStats, Disaggregator};
pub use self::matrix::{AXES, DisaggMatrix};
pub use self::seeds::{DisaggSeeds, compute_seeds};
