//! Drift detection agent: watches resource directories for file changes and
//! ships content-addressed change sets to a server transport.

/// Agent directory resolution.
pub mod app_dirs;
/// TOML configuration.
pub mod config;
/// Drift detection engine.
pub mod drift;
/// Tracing setup for the binary.
pub mod logging;
