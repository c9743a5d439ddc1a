//! Pictor Core Library
//!
//! Domain models, error types, configuration and constants shared by every
//! crate of the artifact-generation pipeline.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::{Config, LogFormat};
pub use error::{ErrorType, ItemError, LogLevel};
