//! Issuance processing: the poll loop and per-job orchestration.

mod poll;
mod processor;

pub use poll::{PollHandle, spawn_poll_task};
pub use processor::{IssuanceError, IssuanceProcessor, ProcessOutcome};
