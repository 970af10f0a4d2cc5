use crate::actor::{ActorInstance, Continuation, PendingTransition};
use crate::error::Fault;
use crate::registry::ClassRegistry;
use crate::script::ENTRY_LABEL;

/// What a transition changed; the driver turns this into events and
/// hook invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTransition {
    pub exited: Option<String>,
    pub entered: Option<String>,
    pub cancelled_latent: bool,
}

/// Checks a transition target against the registry before any hook
/// runs, so a bad target faults without side effects.
pub fn validate(
    registry: &ClassRegistry,
    actor: &ActorInstance,
    target: &PendingTransition,
) -> Result<(), Fault> {
    let Some(state_name) = &target.state else { return Ok(()) };
    let class = registry.class(actor.class);
    let Some(state) = class.states.get(state_name) else {
        return Err(Fault::UnknownState { class: class.name.clone(), state: state_name.clone() });
    };
    if let Some(label) = &target.label {
        if !state.labels.contains_key(label) {
            return Err(Fault::UnknownLabel { state: state_name.clone(), label: label.clone() });
        }
    }
    Ok(())
}

/// Mutates the actor's state machine fields for a validated target:
/// cancels any pending latent, swaps the state, resets the
/// continuation to the target label. Targeting the current state is a
/// full exit-then-re-entry. Hook dispatch stays with the driver.
pub fn apply(
    registry: &ClassRegistry,
    actor: &mut ActorInstance,
    target: &PendingTransition,
) -> AppliedTransition {
    let exited = actor.state.take();
    let cancelled_latent = actor.pending_latent.take().is_some();
    // The caller took the request being applied; anything recorded in
    // `pending_transition` now came from the exit hook and must stay
    // queued for the next flush.

    match &target.state {
        Some(state_name) => {
            let label = target.label.clone().unwrap_or_else(|| ENTRY_LABEL.to_string());
            let has_label = registry
                .state(actor.class, state_name)
                .map_or(false, |state| state.labels.contains_key(&label));
            actor.state = Some(state_name.clone());
            actor.continuation = if has_label {
                Continuation::At { label, pc: 0 }
            } else {
                // A state without code at its entry label is legal; it
                // just has nothing to run until the next transition.
                Continuation::Halted
            };
        }
        None => {
            actor.state = None;
            actor.continuation = Continuation::Halted;
        }
    }

    AppliedTransition { exited, entered: actor.state.clone(), cancelled_latent }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::{LatentPredicate, LatentRequest};
    use crate::registry::{ClassRegistry, RegistryBuilder};
    use crate::script::{ClassDef, Op, StateDef};
    use std::collections::BTreeMap;

    fn registry() -> ClassRegistry {
        let mut labels = BTreeMap::new();
        labels.insert(ENTRY_LABEL.to_string(), vec![Op::Stop]);
        let mut builder = RegistryBuilder::new();
        builder.declare(ClassDef {
            name: "pawn".into(),
            parent: None,
            defaults: BTreeMap::new(),
            functions: Vec::new(),
            states: vec![
                StateDef {
                    name: "idle".into(),
                    expands: None,
                    auto: false,
                    ignores: Vec::new(),
                    functions: Vec::new(),
                    labels: labels.clone(),
                },
                StateDef {
                    name: "attacking".into(),
                    expands: None,
                    auto: false,
                    ignores: Vec::new(),
                    functions: Vec::new(),
                    labels,
                },
            ],
        });
        builder.link().expect("link")
    }

    fn actor_in(registry: &ClassRegistry, state: &str) -> ActorInstance {
        let class = registry.find("pawn").expect("pawn");
        let mut actor = ActorInstance::new(class, BTreeMap::new());
        actor.state = Some(state.to_string());
        actor.continuation = Continuation::At { label: ENTRY_LABEL.into(), pc: 0 };
        actor
    }

    fn target(state: Option<&str>, label: Option<&str>) -> PendingTransition {
        PendingTransition { state: state.map(str::to_string), label: label.map(str::to_string) }
    }

    #[test]
    fn unknown_state_faults_before_any_mutation() {
        let registry = registry();
        let actor = actor_in(&registry, "idle");
        let err = validate(&registry, &actor, &target(Some("flying"), None)).unwrap_err();
        assert!(matches!(err, Fault::UnknownState { .. }), "got {err:?}");
    }

    #[test]
    fn explicit_unknown_label_faults() {
        let registry = registry();
        let actor = actor_in(&registry, "idle");
        let err = validate(&registry, &actor, &target(Some("attacking"), Some("missing"))).unwrap_err();
        assert!(matches!(err, Fault::UnknownLabel { .. }), "got {err:?}");
    }

    #[test]
    fn transition_cancels_pending_latent() {
        let registry = registry();
        let mut actor = actor_in(&registry, "idle");
        actor.pending_latent = Some(LatentRequest {
            predicate: LatentPredicate::ElapsedTime { remaining: 10.0 },
            resume: Continuation::At { label: ENTRY_LABEL.into(), pc: 1 },
        });
        let applied = apply(&registry, &mut actor, &target(Some("attacking"), None));
        assert!(applied.cancelled_latent);
        assert!(actor.pending_latent.is_none());
        assert_eq!(actor.state.as_deref(), Some("attacking"));
        assert_eq!(actor.continuation, Continuation::At { label: ENTRY_LABEL.into(), pc: 0 });
    }

    #[test]
    fn no_state_target_halts() {
        let registry = registry();
        let mut actor = actor_in(&registry, "idle");
        let applied = apply(&registry, &mut actor, &target(None, None));
        assert_eq!(applied.exited.as_deref(), Some("idle"));
        assert_eq!(applied.entered, None);
        assert_eq!(actor.state, None);
        assert_eq!(actor.continuation, Continuation::Halted);
    }

    #[test]
    fn apply_leaves_hook_recorded_requests_queued() {
        let registry = registry();
        let mut actor = actor_in(&registry, "idle");
        actor.pending_transition = Some(target(Some("attacking"), None));
        apply(&registry, &mut actor, &target(Some("idle"), None));
        assert_eq!(actor.pending_transition, Some(target(Some("attacking"), None)));
    }

    #[test]
    fn same_state_target_resets_continuation() {
        let registry = registry();
        let mut actor = actor_in(&registry, "idle");
        actor.continuation = Continuation::Halted;
        let applied = apply(&registry, &mut actor, &target(Some("idle"), None));
        assert_eq!(applied.exited.as_deref(), Some("idle"));
        assert_eq!(applied.entered.as_deref(), Some("idle"));
        assert_eq!(actor.continuation, Continuation::At { label: ENTRY_LABEL.into(), pc: 0 });
    }
}
