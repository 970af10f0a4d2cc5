use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::latent::LatentRequest;
use crate::registry::ClassId;
use crate::value::Value;

/// Generational reference to an actor. Destroying the actor bumps the
/// slot generation, so every outstanding handle turns into the null
/// sentinel: it stops resolving and calls through it become no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorHandle {
    slot: u32,
    generation: u32,
}

impl ActorHandle {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn to_bits(self) -> u64 {
        (self.generation as u64) << 32 | self.slot as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self { slot: bits as u32, generation: (bits >> 32) as u32 }
    }

    pub fn slot(self) -> u32 {
        self.slot
    }
}

impl std::fmt::Display for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor#{}", self.to_bits())
    }
}

/// Serializable resume position of an actor's state code. Captured
/// only at state-code depth, never from inside a function call chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// Fresh in a state, about to run the entry label from the top.
    AtStart,
    At { label: String, pc: usize },
    /// No runnable state code until the next transition.
    Halted,
}

/// A transition recorded from inside a function call, applied once
/// control is back at the actor's state-code frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransition {
    /// `None` targets NoState.
    pub state: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug)]
pub struct ActorInstance {
    pub class: ClassId,
    /// `None` is NoState.
    pub state: Option<String>,
    pub continuation: Continuation,
    pub pending_transition: Option<PendingTransition>,
    pub pending_latent: Option<LatentRequest>,
    pub vars: BTreeMap<String, Value>,
    /// Names of non-reentrant functions currently in flight.
    pub reentrancy_guard: BTreeSet<String>,
}

impl ActorInstance {
    pub fn new(class: ClassId, vars: BTreeMap<String, Value>) -> Self {
        Self {
            class,
            state: None,
            continuation: Continuation::Halted,
            pending_transition: None,
            pending_latent: None,
            vars,
            reentrancy_guard: BTreeSet::new(),
        }
    }

    pub fn var(&self, name: &str) -> Value {
        self.vars.get(name).cloned().unwrap_or(Value::Nil)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    instance: Option<ActorInstance>,
}

/// Mutable per-entity records, iterated in spawn order by the driver.
#[derive(Debug, Default)]
pub struct ActorStore {
    slots: Vec<Slot>,
    order: Vec<ActorHandle>,
    free: Vec<u32>,
}

impl ActorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: ActorInstance) -> ActorHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.instance = Some(instance);
        let handle = ActorHandle::new(slot, entry.generation);
        self.order.push(handle);
        handle
    }

    pub fn remove(&mut self, handle: ActorHandle) -> Option<ActorInstance> {
        let entry = self.slots.get_mut(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let instance = entry.instance.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.order.retain(|h| *h != handle);
        self.free.push(handle.slot);
        Some(instance)
    }

    pub fn resolve(&self, handle: ActorHandle) -> Option<&ActorInstance> {
        let entry = self.slots.get(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.instance.as_ref()
    }

    pub fn resolve_mut(&mut self, handle: ActorHandle) -> Option<&mut ActorInstance> {
        let entry = self.slots.get_mut(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.instance.as_mut()
    }

    pub fn is_live(&self, handle: ActorHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Live handles in spawn order; the driver's iteration order.
    pub fn order(&self) -> &[ActorHandle] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.free.clear();
    }

    /// Re-creates an actor at the exact slot and generation a snapshot
    /// recorded, so handles stored in variables stay valid.
    pub(crate) fn restore_at(&mut self, handle: ActorHandle, instance: ActorInstance) -> Result<()> {
        let index = handle.slot as usize;
        while self.slots.len() <= index {
            self.slots.push(Slot::default());
        }
        let entry = &mut self.slots[index];
        if entry.instance.is_some() {
            bail!("snapshot restores slot {} twice", handle.slot);
        }
        entry.generation = handle.generation;
        entry.instance = Some(instance);
        self.order.push(handle);
        Ok(())
    }

    pub(crate) fn rebuild_free_list(&mut self) {
        self.free = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.instance.is_none())
            .map(|(idx, _)| idx as u32)
            .collect();
    }
}
