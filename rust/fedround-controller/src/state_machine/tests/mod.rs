//! State machine test utilities.

pub mod builder;
pub mod nodes;
pub mod utils;
