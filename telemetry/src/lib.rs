//! Logging and metrics initialisation shared by conveyor binaries and tests.

pub mod metrics;
pub mod tracing;
