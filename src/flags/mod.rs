//! Flags: the unit of work hand-off between producers and workers.

pub mod model;

pub use model::{
    DEFAULT_FLAG_TTL, Flag, FlagEventKind, FlagStatus, FlagType, StatusCounts,
};
