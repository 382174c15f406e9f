//! Effects produced by the kernel.
//!
//! The kernel is pure. Anything that must happen outside the state itself
//! (today: fanning a change notification out to `StreamEvents` subscribers)
//! is described as an effect and executed by the consensus runtime after the
//! apply succeeds.

use serde::{Deserialize, Serialize};
use warren_types::ClusterEvent;

/// An effect to be executed by the runtime after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Publish a change notification to event-stream subscribers.
    Emit(ClusterEvent),
}
