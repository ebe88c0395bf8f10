#![forbid(unsafe_code)]

//! Headless orchestration of long-running coding-agent worker processes.
//!
//! The crate spawns workers under a scrubbed environment and a confined
//! working directory, throttles them through a priority admission queue,
//! tails the progress files they write, and raises alerts when a worker
//! dies or stops making progress.

pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod progress;
pub mod security;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
