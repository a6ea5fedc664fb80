//! Stage-2 training for PG2 pose-guided person image generation.
//!
//! A frozen stage-1 generator produces a coarse image of the person in the
//! target pose; generator 2 learns a difference map that refines it while a
//! conditional discriminator judges (condition, image) pairs.

pub mod data;
pub mod engine;
pub mod handlers;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod training;
pub mod utils;
