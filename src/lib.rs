//! VR360 Studio Library
//!
//! Core components for the native VR/360 production and streaming studio:
//! the per-tick frame router, GPU zero-copy interop, and the encoder,
//! virtual-camera, stitcher and super-resolution adapters.

pub mod app;
pub mod gpu;
pub mod media;
pub mod pipeline;
pub mod render;
pub mod sources;
pub mod utils;

pub use media::GpuFrameView;
pub use pipeline::{FrameRouter, TickOutcome};
