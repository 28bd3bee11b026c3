//! CPU-side post-processing of correlator output.
//!
//! Flag propagation runs while the device still works on the block;
//! integration and weighting run once the visibilities are back on the host.

pub mod flags;
pub mod integration;

pub use flags::{FlagPropagator, SparseSet};
pub use integration::{apply_weights, Integrator};
