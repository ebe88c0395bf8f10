//! Worker progress files: parsing, tailing and writing.
//!
//! Workers append one JSON record per line to `<task>.jsonl` in the
//! progress directory (through the `emit` subcommand wired into their
//! hooks file). The watcher tails those files and republishes new records
//! as [`ProgressBatch`](crate::models::progress::ProgressBatch)es.

pub mod emitter;
pub mod parser;
pub mod watcher;

pub use watcher::{ProgressTail, ProgressWatcher};
