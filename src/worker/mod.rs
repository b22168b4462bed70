//! Worker contract and runner.
//!
//! - `state`: runner state machine (Idle → AttemptingClaim → Executing → Reporting)
//! - `runner`: `FlagWorker` trait and the loop that drives it
//! - `echo`: trivial worker used for smoke tests

pub mod echo;
pub mod runner;
pub mod state;

pub use echo::EchoWorker;
pub use runner::{FlagWorker, WorkOutcome, WorkerRunner};
pub use state::{WorkerState, WorkerStatus};
