pub mod depth;
pub mod detection;
pub mod geometry;
pub mod overlay;
pub mod pipeline;
pub mod ranking;
pub mod video;

// Re-export the top-level error type so callers only need `depthrank_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
