//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod coordinator;
mod election;
mod update;

pub use coordinator::{CoordinatorState, ProcessingFailurePolicy};
pub use election::{ElectionState, LeadershipEvent};
pub use update::{Checkpoint, Update};
