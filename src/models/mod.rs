//! Domain model module declarations.

pub mod alert;
pub mod progress;
pub mod queue;
pub mod session;
