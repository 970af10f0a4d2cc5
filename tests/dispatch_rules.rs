use std::collections::BTreeMap;
use std::sync::Arc;

use shrike_runtime::dispatch::DispatchMode;
use shrike_runtime::driver::Runtime;
use shrike_runtime::error::Fault;
use shrike_runtime::events::RuntimeEvent;
use shrike_runtime::registry::RegistryBuilder;
use shrike_runtime::script::{CallModeSpec, ClassDef, Expr, FunctionDef, FunctionFlags, Op, StateDef};
use shrike_runtime::value::Value;

fn runtime(classes: Vec<ClassDef>) -> Runtime {
    let mut builder = RegistryBuilder::new();
    builder.declare_all(classes);
    Runtime::new(Arc::new(builder.link().expect("classes should link")))
}

fn class(name: &str, parent: Option<&str>) -> ClassDef {
    ClassDef {
        name: name.to_string(),
        parent: parent.map(str::to_string),
        defaults: BTreeMap::new(),
        functions: Vec::new(),
        states: Vec::new(),
    }
}

fn function(name: &str, body: Vec<Op>) -> FunctionDef {
    FunctionDef { name: name.to_string(), flags: FunctionFlags::empty(), body }
}

fn state(name: &str, auto: bool) -> StateDef {
    StateDef {
        name: name.to_string(),
        expands: None,
        auto,
        ignores: Vec::new(),
        functions: Vec::new(),
        labels: BTreeMap::new(),
    }
}

fn set(var: &str, value: Value) -> Op {
    Op::Set { var: var.to_string(), value: Expr::Const(value) }
}

fn log(message: &str) -> Op {
    Op::Log(Expr::Const(Value::Str(message.to_string())))
}

fn call(name: &str, mode: CallModeSpec) -> Op {
    Op::Call { name: name.to_string(), mode, args: Vec::new(), store: None }
}

fn script_logs(events: &[RuntimeEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RuntimeEvent::ScriptLog { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Base pawn with a global `touch` plus an auto state that overrides it.
fn pawn_with_state_override() -> ClassDef {
    let mut pawn = class("pawn", None);
    pawn.functions.push(function("touch", vec![set("src", Value::Str("global".into()))]));
    let mut wandering = state("wandering", true);
    wandering.functions.push(function("touch", vec![set("src", Value::Str("state".into()))]));
    pawn.states.push(wandering);
    pawn
}

#[test]
fn state_override_wins_then_global_after_leaving_state() {
    let mut runtime = runtime(vec![pawn_with_state_override()]);
    let pawn = runtime.spawn("pawn", BTreeMap::new()).expect("spawn pawn");
    assert_eq!(runtime.state_of(pawn).as_deref(), Some("wandering"));

    runtime.invoke(pawn, "touch", &[], DispatchMode::Normal).expect("invoke in state");
    assert_eq!(runtime.var(pawn, "src"), Value::Str("state".into()));

    runtime.request_transition(pawn, None, None).expect("drop to no state");
    runtime.invoke(pawn, "touch", &[], DispatchMode::Normal).expect("invoke without state");
    assert_eq!(runtime.var(pawn, "src"), Value::Str("global".into()));
}

#[test]
fn global_mode_bypasses_state_override() {
    let mut runtime = runtime(vec![pawn_with_state_override()]);
    let pawn = runtime.spawn("pawn", BTreeMap::new()).expect("spawn pawn");

    runtime.invoke(pawn, "touch", &[], DispatchMode::Global).expect("global invoke");
    assert_eq!(runtime.var(pawn, "src"), Value::Str("global".into()));
}

#[test]
fn global_chain_resolves_most_derived_override() {
    let mut base = class("pawn", None);
    base.functions.push(function("touch", vec![set("src", Value::Str("pawn".into()))]));
    let mut derived = class("guard", Some("pawn"));
    derived.functions.push(function("touch", vec![set("src", Value::Str("guard".into()))]));
    // watching defines no touch, so the call falls back to globals.
    derived.states.push(state("watching", true));

    let mut runtime = runtime(vec![base, derived]);
    let guard = runtime.spawn("guard", BTreeMap::new()).expect("spawn guard");
    runtime.invoke(guard, "touch", &[], DispatchMode::Normal).expect("invoke touch");
    assert_eq!(runtime.var(guard, "src"), Value::Str("guard".into()));
}

#[test]
fn expanded_state_inherits_and_overrides_in_order() {
    let mut base = class("pawn", None);
    let mut base_patrolling = state("patrolling", false);
    base_patrolling
        .functions
        .push(function("report", vec![set("who", Value::Str("base".into()))]));
    base_patrolling
        .functions
        .push(function("alarm", vec![set("alarm_src", Value::Str("base".into()))]));
    base.states.push(base_patrolling);

    let mut scout = class("scout", Some("pawn"));
    let mut wandering = state("wandering", false);
    wandering.functions.push(function("report", vec![set("who", Value::Str("wandering".into()))]));
    wandering.functions.push(function("touch", vec![set("src", Value::Str("wandering".into()))]));
    wandering.labels.insert("begin".to_string(), vec![log("roaming"), Op::Stop]);
    scout.states.push(wandering);
    let mut patrolling = state("patrolling", true);
    patrolling.expands = Some("wandering".to_string());
    patrolling.functions.push(function("touch", vec![set("src", Value::Str("patrolling".into()))]));
    scout.states.push(patrolling);

    let mut runtime = runtime(vec![base, scout]);
    let scout = runtime.spawn("scout", BTreeMap::new()).expect("spawn scout");
    assert_eq!(runtime.state_of(scout).as_deref(), Some("patrolling"));
    runtime.drain_events();

    // Own declaration beats the expands target.
    runtime.invoke(scout, "touch", &[], DispatchMode::Normal).expect("invoke touch");
    assert_eq!(runtime.var(scout, "src"), Value::Str("patrolling".into()));

    // The expands target beats the same-named ancestor state.
    runtime.invoke(scout, "report", &[], DispatchMode::Normal).expect("invoke report");
    assert_eq!(runtime.var(scout, "who"), Value::Str("wandering".into()));

    // Functions only the ancestor state declares remain reachable.
    runtime.invoke(scout, "alarm", &[], DispatchMode::Normal).expect("invoke alarm");
    assert_eq!(runtime.var(scout, "alarm_src"), Value::Str("base".into()));

    // The entry label is inherited from the expands target too.
    runtime.advance_tick(0.1).expect("tick");
    assert_eq!(script_logs(&runtime.drain_events()), vec!["roaming".to_string()]);
}

#[test]
fn super_call_skips_to_base_implementation() {
    let mut base = class("pawn", None);
    base.functions.push(function("greet", vec![log("pawn")]));
    let mut derived = class("guard", Some("pawn"));
    derived
        .functions
        .push(function("greet", vec![log("guard"), call("greet", CallModeSpec::Super)]));

    let mut runtime = runtime(vec![base, derived]);
    let guard = runtime.spawn("guard", BTreeMap::new()).expect("spawn guard");
    runtime.drain_events();
    runtime.invoke(guard, "greet", &[], DispatchMode::Normal).expect("invoke greet");

    let logs = script_logs(&runtime.drain_events());
    assert_eq!(logs, vec!["guard".to_string(), "pawn".to_string()]);
}

#[test]
fn ignored_call_is_swallowed_without_global_fallback() {
    let mut pawn = class("pawn", None);
    pawn.functions.push(function("touch", vec![set("hit", Value::Bool(true))]));
    let mut deaf = state("deaf", true);
    deaf.ignores.push("touch".to_string());
    pawn.states.push(deaf);

    let mut runtime = runtime(vec![pawn]);
    let pawn = runtime.spawn("pawn", BTreeMap::new()).expect("spawn pawn");
    runtime.drain_events();

    let result = runtime.invoke(pawn, "touch", &[], DispatchMode::Normal).expect("ignored invoke");
    assert_eq!(result, Value::Nil);
    assert_eq!(runtime.var(pawn, "hit"), Value::Nil, "ignored call must not run the global");
    let events = runtime.drain_events();
    assert!(
        events.iter().any(|e| matches!(e, RuntimeEvent::IgnoredCall { .. })),
        "expected IgnoredCall event, got {events:?}"
    );

    // Outside the state the same call works again.
    runtime.request_transition(pawn, None, None).expect("leave deaf state");
    runtime.invoke(pawn, "touch", &[], DispatchMode::Normal).expect("invoke after leaving");
    assert_eq!(runtime.var(pawn, "hit"), Value::Bool(true));
}

#[test]
fn non_reentrant_function_skips_nested_call() {
    let mut pawn = class("pawn", None);
    let mut ping = function("ping", vec![log("enter"), call("ping", CallModeSpec::Normal)]);
    ping.flags = FunctionFlags::NON_REENTRANT;
    pawn.functions.push(ping);

    let mut runtime = runtime(vec![pawn]);
    let pawn = runtime.spawn("pawn", BTreeMap::new()).expect("spawn pawn");
    runtime.drain_events();
    runtime.invoke(pawn, "ping", &[], DispatchMode::Normal).expect("invoke ping");

    let events = runtime.drain_events();
    assert_eq!(script_logs(&events), vec!["enter".to_string()], "body must run exactly once");
    assert!(
        events.iter().any(|e| matches!(e, RuntimeEvent::ReentrantSkipped { .. })),
        "expected ReentrantSkipped event, got {events:?}"
    );

    // The guard clears once the call chain unwinds.
    runtime.invoke(pawn, "ping", &[], DispatchMode::Normal).expect("invoke ping again");
    assert_eq!(script_logs(&runtime.drain_events()), vec!["enter".to_string()]);
}

#[test]
fn unknown_function_is_a_dispatch_fault() {
    let mut runtime = runtime(vec![class("pawn", None)]);
    let pawn = runtime.spawn("pawn", BTreeMap::new()).expect("spawn pawn");
    let err = runtime.invoke(pawn, "nonesuch", &[], DispatchMode::Normal).unwrap_err();
    assert!(matches!(err, Fault::Dispatch { .. }), "got {err:?}");
}

#[test]
fn invoking_a_destroyed_actor_yields_nil() {
    let mut pawn = class("pawn", None);
    pawn.functions.push(function("touch", vec![set("hit", Value::Bool(true))]));
    let mut runtime = runtime(vec![pawn]);
    let pawn = runtime.spawn("pawn", BTreeMap::new()).expect("spawn pawn");
    assert!(runtime.destroy(pawn));

    let result = runtime.invoke(pawn, "touch", &[], DispatchMode::Normal).expect("dead invoke");
    assert_eq!(result, Value::Nil);
    assert!(!runtime.is_live(pawn));
}

#[test]
fn cross_actor_call_on_dead_receiver_stores_nil() {
    let mut beacon = class("beacon", None);
    beacon
        .functions
        .push(function("poke", vec![Op::Return(Some(Expr::Const(Value::Int(7))))]));

    let mut pawn = class("pawn", None);
    let mut idle = state("idle", true);
    idle.labels.insert(
        "begin".to_string(),
        vec![
            Op::CallOn {
                target: Expr::Var("buddy".to_string()),
                name: "poke".to_string(),
                args: Vec::new(),
                store: Some("out".to_string()),
            },
            set("ran", Value::Bool(true)),
            Op::Stop,
        ],
    );
    pawn.states.push(idle);

    // Live receiver: the call lands and the result is stored.
    let mut live = runtime(vec![beacon.clone(), pawn.clone()]);
    let target = live.spawn("beacon", BTreeMap::new()).expect("spawn beacon");
    let mut vars = BTreeMap::new();
    vars.insert("buddy".to_string(), Value::Handle(target));
    let caller = live.spawn("pawn", vars).expect("spawn pawn");
    live.advance_tick(0.1).expect("tick");
    assert_eq!(live.var(caller, "out"), Value::Int(7));
    assert_eq!(live.var(caller, "ran"), Value::Bool(true));

    // Dead receiver: the call no-ops with the zero value.
    let mut dead = runtime(vec![beacon, pawn]);
    let target = dead.spawn("beacon", BTreeMap::new()).expect("spawn beacon");
    let mut vars = BTreeMap::new();
    vars.insert("buddy".to_string(), Value::Handle(target));
    let caller = dead.spawn("pawn", vars).expect("spawn pawn");
    dead.destroy(target);
    dead.advance_tick(0.1).expect("tick");
    assert_eq!(dead.var(caller, "out"), Value::Nil);
    assert_eq!(dead.var(caller, "ran"), Value::Bool(true), "state code continues past the no-op");
}
