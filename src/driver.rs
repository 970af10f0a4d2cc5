use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::actor::{ActorHandle, ActorInstance, ActorStore, Continuation, PendingTransition};
use crate::dispatch::{self, DispatchMode, Resolution, Scope};
use crate::error::Fault;
use crate::events::{EventLog, RuntimeEvent};
use crate::latent::{LatentPredicate, LatentRequest};
use crate::registry::{ClassId, ClassRegistry};
use crate::script::{CallModeSpec, Expr, FunctionFlags, Op, ENTRY_LABEL, STATE_BEGIN, STATE_END};
use crate::transition;
use crate::value::Value;

type Args = SmallVec<[Value; 4]>;

/// An external-signal report from the engine, consumed by the latent
/// scheduler on the next tick. `target: None` broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub target: Option<ActorHandle>,
    pub tag: String,
}

impl SignalDelivery {
    fn applies_to(&self, handle: ActorHandle) -> bool {
        self.target.map_or(true, |t| t == handle)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub turns: usize,
    pub resumed: usize,
    pub faults: Vec<Fault>,
}

/// The tick driver: owns the actor population and drives every actor's
/// state code cooperatively, one deterministic turn at a time.
#[derive(Debug)]
pub struct Runtime {
    pub(crate) registry: Arc<ClassRegistry>,
    pub(crate) actors: ActorStore,
    pub(crate) events: EventLog,
    pub(crate) signals: Vec<SignalDelivery>,
    pub(crate) in_turn: bool,
    fault_sink: Vec<Fault>,
}

impl Runtime {
    pub fn new(registry: Arc<ClassRegistry>) -> Self {
        Self {
            registry,
            actors: ActorStore::new(),
            events: EventLog::default(),
            signals: Vec::new(),
            in_turn: false,
            fault_sink: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    // ---------- actor lifecycle ----------

    pub fn spawn(
        &mut self,
        class_name: &str,
        initial: BTreeMap<String, Value>,
    ) -> Result<ActorHandle, Fault> {
        let class_id = self
            .registry
            .find(class_name)
            .ok_or_else(|| Fault::UnknownClass(class_name.to_string()))?;
        let class = self.registry.class(class_id);
        let mut vars = class.defaults.clone();
        vars.extend(initial);
        let auto_state = class.auto_state.clone();

        let mut instance = ActorInstance::new(class_id, vars);
        if let Some(state) = &auto_state {
            instance.state = Some(state.clone());
            instance.continuation = Continuation::AtStart;
        }
        let handle = self.actors.insert(instance);
        self.events.push(RuntimeEvent::ActorSpawned { actor: handle, class: class_name.to_string() });
        if let Some(state) = auto_state {
            self.events.push(RuntimeEvent::StateEntered { actor: handle, state });
            self.invoke_hook(handle, STATE_BEGIN);
            self.flush_deferred(handle);
        }
        Ok(handle)
    }

    pub fn destroy(&mut self, handle: ActorHandle) -> bool {
        match self.actors.remove(handle) {
            Some(_) => {
                self.events.push(RuntimeEvent::ActorDestroyed { actor: handle });
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, handle: ActorHandle) -> bool {
        self.actors.is_live(handle)
    }

    pub fn handles(&self) -> Vec<ActorHandle> {
        self.actors.order().to_vec()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    // ---------- engine-facing calls ----------

    /// Raises a call on an actor the way the engine raises intrinsic
    /// events. A dead/null handle is a no-op yielding `Nil`; a missing
    /// implementation is a dispatch fault surfaced to the caller and
    /// isolated to this one call.
    pub fn invoke(
        &mut self,
        handle: ActorHandle,
        name: &str,
        args: &[Value],
        mode: DispatchMode,
    ) -> Result<Value, Fault> {
        if !self.actors.is_live(handle) {
            return Ok(Value::Nil);
        }
        let result = self.invoke_internal(handle, name, args, mode, Scope::Global);
        // The call chain has unwound; the actor is back at its
        // state-code frame, so deferred transitions apply now.
        self.flush_deferred(handle);
        if let Err(fault) = &result {
            self.events.push(RuntimeEvent::Fault { fault: fault.clone() });
        }
        result
    }

    /// Engine-side transition request. The actor holds no call frames
    /// between ticks, so this applies immediately, exactly like a
    /// request made directly from state code.
    pub fn request_transition(
        &mut self,
        handle: ActorHandle,
        state: Option<&str>,
        label: Option<&str>,
    ) -> Result<(), Fault> {
        if !self.actors.is_live(handle) {
            return Ok(());
        }
        let target = PendingTransition {
            state: state.map(str::to_string),
            label: label.map(str::to_string),
        };
        self.apply_transition(handle, target)?;
        self.flush_deferred(handle);
        Ok(())
    }

    pub fn post_signal(&mut self, handle: ActorHandle, tag: &str) {
        self.signals.push(SignalDelivery { target: Some(handle), tag: tag.to_string() });
    }

    pub fn broadcast_signal(&mut self, tag: &str) {
        self.signals.push(SignalDelivery { target: None, tag: tag.to_string() });
    }

    pub fn drain_events(&mut self) -> Vec<RuntimeEvent> {
        self.events.drain()
    }

    // ---------- introspection ----------

    pub fn state_of(&self, handle: ActorHandle) -> Option<String> {
        self.actors.resolve(handle).and_then(|actor| actor.state.clone())
    }

    pub fn class_of(&self, handle: ActorHandle) -> Option<String> {
        self.actors.resolve(handle).map(|actor| self.registry.class(actor.class).name.clone())
    }

    pub fn vars_of(&self, handle: ActorHandle) -> BTreeMap<String, Value> {
        self.actors.resolve(handle).map(|actor| actor.vars.clone()).unwrap_or_default()
    }

    pub fn continuation_of(&self, handle: ActorHandle) -> Option<Continuation> {
        self.actors.resolve(handle).map(|actor| actor.continuation.clone())
    }

    pub fn pending_latent_of(&self, handle: ActorHandle) -> Option<LatentPredicate> {
        self.actors
            .resolve(handle)
            .and_then(|actor| actor.pending_latent.as_ref())
            .map(|latent| latent.predicate.clone())
    }

    /// Reads an actor variable; dead handles read as `Nil`.
    pub fn var(&self, handle: ActorHandle, name: &str) -> Value {
        self.actors.resolve(handle).map(|actor| actor.var(name)).unwrap_or(Value::Nil)
    }

    // ---------- tick driver ----------

    /// Advances the whole population by one tick of `dt` simulated
    /// seconds, in spawn order. Per-actor faults are recorded in the
    /// report and the event log; only driver invariant violations
    /// propagate.
    pub fn advance_tick(&mut self, dt: f64) -> Result<TickReport, Fault> {
        if self.in_turn {
            return Err(Fault::SnapshotMidTurn);
        }
        self.in_turn = true;
        // Faults raised at the engine edge were already surfaced to
        // their callers; the report covers this tick only.
        self.fault_sink.clear();
        let signals = std::mem::take(&mut self.signals);
        let order = self.actors.order().to_vec();
        let mut report = TickReport::default();
        for handle in order {
            if !self.actors.is_live(handle) {
                continue;
            }
            report.turns += 1;
            self.run_turn(handle, dt, &signals, &mut report);
            report.faults.append(&mut self.fault_sink);
        }
        self.in_turn = false;
        Ok(report)
    }

    fn run_turn(&mut self, handle: ActorHandle, dt: f64, signals: &[SignalDelivery], report: &mut TickReport) {
        // The latent predicate advances at most once per turn.
        let mut resumed = false;
        if let Some(actor) = self.actors.resolve_mut(handle) {
            if let Some(latent) = actor.pending_latent.as_mut() {
                let fired = latent.advance(dt)
                    || signals.iter().any(|s| s.applies_to(handle) && latent.matches_signal(&s.tag));
                if fired {
                    let resume = actor.pending_latent.take().expect("latent present").resume;
                    actor.continuation = resume;
                    self.events.push(RuntimeEvent::LatentResumed { actor: handle });
                    resumed = true;
                }
            }
        }
        if resumed {
            report.resumed += 1;
            self.run_state_code(handle);
        }

        // Back at the state-code frame: apply transitions deferred
        // during this or a prior turn, then keep running until the
        // actor suspends, halts, or exhausts its code.
        loop {
            let Some(actor) = self.actors.resolve(handle) else { return };
            if actor.pending_transition.is_some() {
                if let Some(target) = self.take_pending(handle) {
                    if let Err(fault) = self.apply_transition(handle, target) {
                        self.record_fault(fault);
                    }
                }
                self.run_state_code(handle);
                continue;
            }
            let runnable = actor.pending_latent.is_none()
                && matches!(actor.continuation, Continuation::AtStart | Continuation::At { .. });
            if runnable {
                self.run_state_code(handle);
                let Some(actor) = self.actors.resolve(handle) else { return };
                if actor.pending_transition.is_some() {
                    continue;
                }
            }
            return;
        }
    }

    // ---------- state-code interpreter (depth 0) ----------

    fn run_state_code(&mut self, handle: ActorHandle) {
        let registry = self.registry.clone();
        'outer: loop {
            while let Some(target) = self.take_pending(handle) {
                if let Err(fault) = self.apply_transition(handle, target) {
                    self.record_fault(fault);
                }
            }
            let Some(actor) = self.actors.resolve(handle) else { return };
            let Some(state_name) = actor.state.clone() else { return };
            let (label, start_pc) = match &actor.continuation {
                Continuation::AtStart => (ENTRY_LABEL.to_string(), 0),
                Continuation::At { label, pc } => (label.clone(), *pc),
                Continuation::Halted => return,
            };
            let Some(state) = registry.state(actor.class, &state_name) else { return };
            let Some(block) = state.labels.get(&label) else {
                self.halt(handle);
                return;
            };
            let ops = block.ops.clone();
            let defining = block.class;

            let mut pc = start_pc;
            while pc < ops.len() {
                match self.actors.resolve(handle) {
                    Some(actor) if actor.pending_transition.is_none() => {}
                    Some(_) => {
                        // A nested call deferred a transition; park the
                        // position so a failed application resumes here
                        // instead of re-running earlier ops.
                        if let Some(actor) = self.actors.resolve_mut(handle) {
                            actor.continuation = Continuation::At { label: label.clone(), pc };
                        }
                        continue 'outer;
                    }
                    None => return,
                }
                match &ops[pc] {
                    Op::Log(expr) => {
                        let message = self.eval(handle, &[], expr).to_string();
                        self.events.push(RuntimeEvent::ScriptLog { actor: handle, message });
                    }
                    Op::Set { var, value } => {
                        let value = self.eval(handle, &[], value);
                        if let Some(actor) = self.actors.resolve_mut(handle) {
                            actor.vars.insert(var.clone(), value);
                        }
                    }
                    Op::Call { name, mode, args, store } => {
                        let mode = dispatch_mode(*mode, defining);
                        let vals: Args = args.iter().map(|e| self.eval(handle, &[], e)).collect();
                        match self.invoke_internal(handle, name, &vals, mode, Scope::State) {
                            Ok(value) => self.store_result(handle, store.as_deref(), value),
                            Err(fault @ Fault::Dispatch { .. }) => {
                                self.record_fault(fault);
                                self.store_result(handle, store.as_deref(), Value::Nil);
                            }
                            Err(fault) => {
                                self.record_fault(fault);
                                self.halt(handle);
                                return;
                            }
                        }
                    }
                    Op::CallOn { target, name, args, store } => {
                        let vals: Args = args.iter().map(|e| self.eval(handle, &[], e)).collect();
                        let receiver = self.eval(handle, &[], target);
                        let value = match receiver.as_handle() {
                            Some(other) if self.actors.is_live(other) => {
                                match self.invoke_internal(other, name, &vals, DispatchMode::Normal, Scope::Global) {
                                    Ok(value) => value,
                                    Err(fault @ Fault::Dispatch { .. }) => {
                                        self.record_fault(fault);
                                        Value::Nil
                                    }
                                    Err(fault) => {
                                        self.record_fault(fault);
                                        self.halt(handle);
                                        return;
                                    }
                                }
                            }
                            // Destroyed or absent receivers no-op with
                            // the zero value.
                            _ => Value::Nil,
                        };
                        self.store_result(handle, store.as_deref(), value);
                    }
                    Op::GotoState { state, label } => {
                        // Direct state-code transitions apply
                        // immediately and execution continues in the
                        // new state this same turn.
                        let target = PendingTransition { state: state.clone(), label: label.clone() };
                        match self.apply_transition(handle, target) {
                            Ok(()) => continue 'outer,
                            Err(fault) => self.record_fault(fault),
                        }
                    }
                    Op::Sleep { seconds } => {
                        let remaining = self.eval(handle, &[], seconds).as_float();
                        self.suspend(
                            handle,
                            LatentPredicate::ElapsedTime { remaining },
                            &label,
                            pc + 1,
                        );
                        return;
                    }
                    Op::AwaitSignal { tag } => {
                        self.suspend(
                            handle,
                            LatentPredicate::ExternalSignal { tag: tag.clone() },
                            &label,
                            pc + 1,
                        );
                        return;
                    }
                    Op::Return(_) | Op::Stop => {
                        self.halt(handle);
                        return;
                    }
                }
                pc += 1;
            }
            // Ran off the end of the label block: state code stops
            // until the next transition.
            self.halt(handle);
            return;
        }
    }

    fn suspend(&mut self, handle: ActorHandle, predicate: LatentPredicate, label: &str, pc: usize) {
        let resume = Continuation::At { label: label.to_string(), pc };
        if let Some(actor) = self.actors.resolve_mut(handle) {
            actor.continuation = resume.clone();
            actor.pending_latent = Some(LatentRequest { predicate: predicate.clone(), resume });
            self.events.push(RuntimeEvent::LatentStarted { actor: handle, predicate });
        }
    }

    fn halt(&mut self, handle: ActorHandle) {
        if let Some(actor) = self.actors.resolve_mut(handle) {
            actor.continuation = Continuation::Halted;
        }
    }

    // ---------- function interpreter (inside a call chain) ----------

    fn invoke_internal(
        &mut self,
        handle: ActorHandle,
        name: &str,
        args: &[Value],
        mode: DispatchMode,
        caller_scope: Scope,
    ) -> Result<Value, Fault> {
        let Some(actor) = self.actors.resolve(handle) else { return Ok(Value::Nil) };
        match dispatch::resolve(&self.registry, actor, name, mode, caller_scope) {
            Resolution::Ignored => {
                self.events.push(RuntimeEvent::IgnoredCall { actor: handle, function: name.to_string() });
                Ok(Value::Nil)
            }
            Resolution::NotFound => {
                Err(Fault::Dispatch { actor: handle, function: name.to_string() })
            }
            Resolution::Found(resolved) => {
                let def = resolved.target.def.clone();
                let non_reentrant = def.flags.contains(FunctionFlags::NON_REENTRANT);
                if non_reentrant {
                    let Some(actor) = self.actors.resolve_mut(handle) else { return Ok(Value::Nil) };
                    if !actor.reentrancy_guard.insert(name.to_string()) {
                        self.events.push(RuntimeEvent::ReentrantSkipped {
                            actor: handle,
                            function: name.to_string(),
                        });
                        return Ok(Value::Nil);
                    }
                }
                let result =
                    self.execute_body(handle, &def.body, resolved.target.class, resolved.scope, args);
                if non_reentrant {
                    if let Some(actor) = self.actors.resolve_mut(handle) {
                        actor.reentrancy_guard.remove(name);
                    }
                }
                result
            }
        }
    }

    fn execute_body(
        &mut self,
        handle: ActorHandle,
        ops: &[Op],
        defining: ClassId,
        scope: Scope,
        args: &[Value],
    ) -> Result<Value, Fault> {
        for op in ops {
            if !self.actors.is_live(handle) {
                return Ok(Value::Nil);
            }
            match op {
                Op::Log(expr) => {
                    let message = self.eval(handle, args, expr).to_string();
                    self.events.push(RuntimeEvent::ScriptLog { actor: handle, message });
                }
                Op::Set { var, value } => {
                    let value = self.eval(handle, args, value);
                    if let Some(actor) = self.actors.resolve_mut(handle) {
                        actor.vars.insert(var.clone(), value);
                    }
                }
                Op::Call { name, mode, args: exprs, store } => {
                    let mode = dispatch_mode(*mode, defining);
                    let vals: Args = exprs.iter().map(|e| self.eval(handle, args, e)).collect();
                    match self.invoke_internal(handle, name, &vals, mode, scope) {
                        Ok(value) => self.store_result(handle, store.as_deref(), value),
                        Err(fault @ Fault::Dispatch { .. }) => {
                            self.record_fault(fault);
                            self.store_result(handle, store.as_deref(), Value::Nil);
                        }
                        Err(fault) => return Err(fault),
                    }
                }
                Op::CallOn { target, name, args: exprs, store } => {
                    let vals: Args = exprs.iter().map(|e| self.eval(handle, args, e)).collect();
                    let receiver = self.eval(handle, args, target);
                    let value = match receiver.as_handle() {
                        Some(other) if self.actors.is_live(other) => {
                            match self.invoke_internal(other, name, &vals, DispatchMode::Normal, Scope::Global) {
                                Ok(value) => value,
                                Err(fault @ Fault::Dispatch { .. }) => {
                                    self.record_fault(fault);
                                    Value::Nil
                                }
                                Err(fault) => return Err(fault),
                            }
                        }
                        _ => Value::Nil,
                    };
                    self.store_result(handle, store.as_deref(), value);
                }
                Op::GotoState { state, label } => {
                    // Inside a call chain the transition is deferred;
                    // it lands once control is back at state code.
                    if let Some(actor) = self.actors.resolve_mut(handle) {
                        actor.pending_transition =
                            Some(PendingTransition { state: state.clone(), label: label.clone() });
                        self.events.push(RuntimeEvent::TransitionDeferred {
                            actor: handle,
                            state: state.clone(),
                        });
                    }
                }
                Op::Sleep { .. } => {
                    return Err(Fault::LatentContract { actor: handle, op: "sleep".to_string() });
                }
                Op::AwaitSignal { .. } => {
                    return Err(Fault::LatentContract { actor: handle, op: "await_signal".to_string() });
                }
                Op::Return(expr) => {
                    return Ok(expr.as_ref().map(|e| self.eval(handle, args, e)).unwrap_or(Value::Nil));
                }
                // Meaningful only in state code.
                Op::Stop => {}
            }
        }
        Ok(Value::Nil)
    }

    // ---------- transitions ----------

    fn apply_transition(&mut self, handle: ActorHandle, target: PendingTransition) -> Result<(), Fault> {
        let registry = self.registry.clone();
        let Some(actor) = self.actors.resolve(handle) else { return Ok(()) };
        transition::validate(&registry, actor, &target)?;
        let had_state = actor.state.is_some();
        if had_state {
            self.invoke_hook(handle, STATE_END);
        }
        let Some(actor) = self.actors.resolve_mut(handle) else { return Ok(()) };
        let applied = transition::apply(&registry, actor, &target);
        if applied.cancelled_latent {
            self.events.push(RuntimeEvent::LatentCancelled { actor: handle });
        }
        if let Some(state) = applied.exited {
            self.events.push(RuntimeEvent::StateExited { actor: handle, state });
        }
        if let Some(state) = applied.entered {
            self.events.push(RuntimeEvent::StateEntered { actor: handle, state });
            self.invoke_hook(handle, STATE_BEGIN);
        }
        Ok(())
    }

    /// Entry/exit hooks are ordinary functions and entirely optional.
    fn invoke_hook(&mut self, handle: ActorHandle, name: &str) {
        match self.invoke_internal(handle, name, &[], DispatchMode::Normal, Scope::State) {
            Ok(_) | Err(Fault::Dispatch { .. }) => {}
            Err(fault) => self.record_fault(fault),
        }
    }

    fn take_pending(&mut self, handle: ActorHandle) -> Option<PendingTransition> {
        self.actors.resolve_mut(handle).and_then(|actor| actor.pending_transition.take())
    }

    fn flush_deferred(&mut self, handle: ActorHandle) {
        while let Some(target) = self.take_pending(handle) {
            if let Err(fault) = self.apply_transition(handle, target) {
                self.record_fault(fault);
            }
        }
    }

    // ---------- shared helpers ----------

    fn eval(&self, handle: ActorHandle, args: &[Value], expr: &Expr) -> Value {
        match expr {
            Expr::Const(value) => value.clone(),
            Expr::Var(name) => {
                self.actors.resolve(handle).map(|actor| actor.var(name)).unwrap_or(Value::Nil)
            }
            Expr::Arg(index) => args.get(*index).cloned().unwrap_or(Value::Nil),
            Expr::SelfHandle => Value::Handle(handle),
            Expr::Add(lhs, rhs) => self.eval(handle, args, lhs).add(&self.eval(handle, args, rhs)),
        }
    }

    fn store_result(&mut self, handle: ActorHandle, store: Option<&str>, value: Value) {
        if let Some(var) = store {
            if let Some(actor) = self.actors.resolve_mut(handle) {
                actor.vars.insert(var.to_string(), value);
            }
        }
    }

    fn record_fault(&mut self, fault: Fault) {
        self.events.push(RuntimeEvent::Fault { fault: fault.clone() });
        self.fault_sink.push(fault);
    }
}

fn dispatch_mode(selector: CallModeSpec, defining: ClassId) -> DispatchMode {
    match selector {
        CallModeSpec::Normal => DispatchMode::Normal,
        CallModeSpec::Global => DispatchMode::Global,
        CallModeSpec::Super => DispatchMode::SuperFrom(defining),
    }
}
