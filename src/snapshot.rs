use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::actor::{ActorHandle, ActorInstance, Continuation, PendingTransition};
use crate::driver::{Runtime, SignalDelivery};
use crate::error::Fault;
use crate::latent::LatentRequest;
use crate::registry::ClassRegistry;
use crate::value::Value;

/// Everything observable about one actor at a tick boundary. Handles
/// (slot + generation) are preserved so handle-typed variables stay
/// valid across restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub handle: ActorHandle,
    pub class: String,
    pub state: Option<String>,
    pub continuation: Continuation,
    pub pending_transition: Option<PendingTransition>,
    pub pending_latent: Option<LatentRequest>,
    pub vars: BTreeMap<String, Value>,
}

/// Blob payload: actors in spawn order plus signals posted but not yet
/// consumed by a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub actors: Vec<ActorRecord>,
    pub signals: Vec<SignalDelivery>,
}

impl Runtime {
    /// Valid only between ticks, when no actor holds a call frame. A
    /// populated reentrancy guard means a call chain is live, which
    /// the driver's tick-boundary guarantee makes structurally
    /// impossible; seeing it here is an internal-consistency fault.
    pub fn snapshot(&self) -> Result<Vec<u8>, Fault> {
        if self.in_turn {
            return Err(Fault::SnapshotMidTurn);
        }
        let mut actors = Vec::with_capacity(self.actors.len());
        for &handle in self.actors.order() {
            let actor = self.actors.resolve(handle).expect("spawn order lists live actors");
            if !actor.reentrancy_guard.is_empty() {
                return Err(Fault::SnapshotMidTurn);
            }
            actors.push(ActorRecord {
                handle,
                class: self.registry.class(actor.class).name.clone(),
                state: actor.state.clone(),
                continuation: actor.continuation.clone(),
                pending_transition: actor.pending_transition.clone(),
                pending_latent: actor.pending_latent.clone(),
                vars: actor.vars.clone(),
            });
        }
        let snapshot = RuntimeSnapshot { actors, signals: self.signals.clone() };
        bincode::serialize(&snapshot).map_err(|err| Fault::CorruptSnapshot(err.to_string()))
    }

    /// Rebuilds a population against a registry linked from the same
    /// class set. Class and state identities are re-resolved by name
    /// and rejected if the registry no longer knows them.
    pub fn restore(registry: Arc<ClassRegistry>, blob: &[u8]) -> Result<Runtime, Fault> {
        let snapshot: RuntimeSnapshot =
            bincode::deserialize(blob).map_err(|err| Fault::CorruptSnapshot(err.to_string()))?;
        let mut runtime = Runtime::new(registry);
        for record in snapshot.actors {
            let class = runtime
                .registry
                .find(&record.class)
                .ok_or_else(|| Fault::UnknownClass(record.class.clone()))?;
            if let Some(state) = &record.state {
                if runtime.registry.state(class, state).is_none() {
                    return Err(Fault::UnknownState {
                        class: record.class.clone(),
                        state: state.clone(),
                    });
                }
            }
            if record.pending_latent.is_some() && record.state.is_none() {
                return Err(Fault::CorruptSnapshot(format!(
                    "{} holds a latent request without a state",
                    record.handle
                )));
            }
            let mut instance = ActorInstance::new(class, record.vars);
            instance.state = record.state;
            instance.continuation = record.continuation;
            instance.pending_transition = record.pending_transition;
            instance.pending_latent = record.pending_latent;
            runtime
                .actors
                .restore_at(record.handle, instance)
                .map_err(|err| Fault::CorruptSnapshot(err.to_string()))?;
        }
        runtime.actors.rebuild_free_list();
        runtime.signals = snapshot.signals;
        Ok(runtime)
    }
}
