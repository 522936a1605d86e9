//! Shared utilities for Garrison services

pub mod telemetry;

pub use telemetry::init_tracing;
