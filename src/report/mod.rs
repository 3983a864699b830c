//! Report output.

mod generator;

pub use generator::*;
