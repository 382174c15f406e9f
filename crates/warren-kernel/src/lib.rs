//! # warren-kernel: the replicated state machine
//!
//! The kernel is the only legal mutator of cluster state. It consumes the
//! typed command stream committed by consensus and applies each command
//! deterministically: no I/O, no clocks, no randomness. Timestamps and IDs
//! are supplied by the proposer inside the command itself.
//!
//! # Example
//!
//! ```ignore
//! let state = State::new();
//! let cmd = Command::CreateService { .. };
//!
//! let (new_state, effects) = apply_committed(state, cmd)?;
//! // The runtime fans `effects` out to event subscribers...
//! ```
//!
//! Validation failures return a structured [`KernelError`] to the proposer
//! and leave no trace in the state (the consensus runtime applies from a
//! retained copy, so a rejected command is a pure no-op).

mod command;
mod effects;
mod kernel;
mod state;

#[cfg(test)]
mod tests;

pub use command::Command;
pub use effects::Effect;
pub use kernel::{apply_committed, KernelError};
pub use state::State;
