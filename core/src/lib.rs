//! # inflight core
//!
//! Graphics-API independent pieces of the frame orchestrator: math helpers,
//! shadow cascade fitting, the worker task system and profiling macros.

pub mod cascade;
pub mod math;
pub mod profiling;
pub mod tasks;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
