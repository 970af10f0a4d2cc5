use thiserror::Error;

use crate::actor::ActorHandle;

/// Per-actor faults and driver invariant violations. Per-actor faults
/// isolate to the offending call or turn; only invariant violations
/// propagate out of `advance_tick`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("no implementation of '{function}' for {actor}")]
    Dispatch { actor: ActorHandle, function: String },

    #[error("latent op '{op}' invoked outside state code on {actor}")]
    LatentContract { actor: ActorHandle, op: String },

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("class '{class}' has no state '{state}'")]
    UnknownState { class: String, state: String },

    #[error("state '{state}' has no label '{label}'")]
    UnknownLabel { state: String, label: String },

    #[error("snapshot attempted while an actor turn is in progress")]
    SnapshotMidTurn,

    #[error("snapshot blob rejected: {0}")]
    CorruptSnapshot(String),
}
