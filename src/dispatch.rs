use crate::actor::ActorInstance;
use crate::registry::{ClassId, ClassRegistry, FnChain, FnRef};

/// Explicit dispatch selector for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// State chain first (filtered by the active state's ignore set),
    /// then the global chain.
    Normal,
    /// Global chain only; the state scope is bypassed entirely.
    Global,
    /// Search strictly above the given class, in the scope the calling
    /// frame was executing in. Never combined with `Global`.
    SuperFrom(ClassId),
}

/// Which override chain a body was resolved from. `SuperFrom` calls
/// stay within the caller's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    State,
}

#[derive(Debug, Clone)]
pub struct ResolvedFn {
    pub target: FnRef,
    pub scope: Scope,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Found(ResolvedFn),
    /// Suppressed by the active state's ignore set; the call is a
    /// zero-valued no-op with no global fallback.
    Ignored,
    NotFound,
}

pub fn resolve(
    registry: &ClassRegistry,
    actor: &ActorInstance,
    name: &str,
    mode: DispatchMode,
    caller_scope: Scope,
) -> Resolution {
    match mode {
        DispatchMode::Normal => resolve_normal(registry, actor, name),
        DispatchMode::Global => resolve_global(registry, actor, name),
        DispatchMode::SuperFrom(class) => resolve_super(registry, actor, name, class, caller_scope),
    }
}

fn resolve_normal(registry: &ClassRegistry, actor: &ActorInstance, name: &str) -> Resolution {
    if let Some(state_name) = &actor.state {
        if let Some(state) = registry.state(actor.class, state_name) {
            // Ignore check applies to the concrete active state only.
            if state.ignores.contains(name) {
                return Resolution::Ignored;
            }
            if let Some(first) = state.functions.get(name).and_then(|chain| chain.first()) {
                return Resolution::Found(ResolvedFn { target: first.clone(), scope: Scope::State });
            }
        }
    }
    match global_chain(registry, actor).get(name).and_then(|chain| chain.first()) {
        Some(first) => Resolution::Found(ResolvedFn { target: first.clone(), scope: Scope::Global }),
        None => Resolution::NotFound,
    }
}

fn resolve_global(registry: &ClassRegistry, actor: &ActorInstance, name: &str) -> Resolution {
    match global_chain(registry, actor).get(name).and_then(|chain| chain.first()) {
        Some(first) => Resolution::Found(ResolvedFn { target: first.clone(), scope: Scope::Global }),
        None => Resolution::NotFound,
    }
}

fn resolve_super(
    registry: &ClassRegistry,
    actor: &ActorInstance,
    name: &str,
    above: ClassId,
    caller_scope: Scope,
) -> Resolution {
    let chain: Option<&FnChain> = match caller_scope {
        Scope::State => actor
            .state
            .as_ref()
            .and_then(|state_name| registry.state(actor.class, state_name))
            .and_then(|state| state.functions.get(name)),
        Scope::Global => global_chain(registry, actor).get(name),
    };
    let Some(chain) = chain else { return Resolution::NotFound };
    match chain.iter().find(|entry| registry.is_strict_ancestor(entry.class, above)) {
        Some(entry) => {
            Resolution::Found(ResolvedFn { target: entry.clone(), scope: caller_scope })
        }
        None => Resolution::NotFound,
    }
}

fn global_chain<'r>(
    registry: &'r ClassRegistry,
    actor: &ActorInstance,
) -> &'r std::collections::BTreeMap<String, FnChain> {
    &registry.class(actor.class).globals
}
