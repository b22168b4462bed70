//! Action flags: durable, at-most-once work hand-off between producers and
//! workers, with an in-process event bus for wake-ups.

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flags;
pub mod store;
pub mod worker;

pub use coordinator::FlagCoordinator;
pub use error::{Error, Result};
pub use flags::{Flag, FlagStatus, FlagType};
