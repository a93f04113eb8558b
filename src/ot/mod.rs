//! Pure operational-transform algebra: applying operations to text and
//! transforming concurrent operations against each other so that all
//! replicas converge.

pub mod engine;

pub use engine::*;
