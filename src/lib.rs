//! Execgate - an HTTP shim that turns a command into a network function
//!
//! This library provides a watchdog process that:
//! - Spawns a fresh child process for every inbound HTTP request
//! - Streams the request body to the child's stdin and the child's stdout
//!   back as the response body
//! - Enforces read, write and hard execution timeouts, signalling the whole
//!   process group when a deadline fires
//! - Exposes request metadata to the child as `Http_*` environment variables
//! - Limits concurrent invocations and exports Prometheus metrics
//! - Coordinates graceful shutdown with an external lock-file health probe

pub mod auth;
pub mod config;
pub mod health;
pub mod lockfile;
pub mod metrics;
pub mod runner;
pub mod server;
pub mod shutdown;

/// Version information for the watchdog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
