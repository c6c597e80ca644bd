//! Utility functions and data structures.
//!
//! - [`app_data`] - Config file and per-user paths (XDG-compliant)
//! - [`version_segment`] - Memory-mapped cross-process version counter

pub mod app_data;
pub mod version_segment;

pub use app_data::*;
pub use version_segment::{default_segment_path, VersionSegment};
