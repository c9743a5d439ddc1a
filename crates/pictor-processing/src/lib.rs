//! Image artifact generation.
//!
//! [`render`] is the synchronous codec path (decode, fit into the target box,
//! encode). [`ImageArtifactGenerator`] wraps it behind the async
//! [`ArtifactGenerator`] seam the worker uses, loading plain files and archive
//! entries through the storage resolver.

pub mod error;
pub mod generator;
pub mod quality;
pub mod render;

pub use error::GenerateError;
pub use generator::{ArtifactGenerator, ImageArtifactGenerator};
pub use quality::{adjust_cache_quality, estimate_jpeg_quality};
pub use render::{probe_dimensions, render, GeneratedArtifact, RenderSpec};
