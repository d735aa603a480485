//! Middleware for observability.
//!
//! Request logging with latency tracking for the admin API.

pub mod logging;

pub use logging::request_logging_simple;
