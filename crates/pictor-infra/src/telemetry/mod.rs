//! Tracing subscriber setup shared by pictor binaries.

mod init;

pub use init::{default_filter, init_telemetry, shutdown_telemetry};
