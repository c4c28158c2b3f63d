//! Application Layer
//!
//! Persistent studio settings and the helpers that turn them into
//! configured pipeline adapters.

mod config;

pub use config::{Settings, RESOLUTIONS};
