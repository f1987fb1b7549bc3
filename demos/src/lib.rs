//! # inflight demos
//!
//! Headless drivers for the inflight frame loop.
//!
//! ## Available Demos
//!
//! - `frame_loop` - Shadow cascades, an opaque pass and a composite pass
//!   rendered for a fixed number of frames, optionally with a swapchain resize

pub mod args;
pub mod scene;

/// Demos library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
