use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::Value;

/// Label every state enters through unless a transition names another.
pub const ENTRY_LABEL: &str = "begin";
/// Hook invoked (if defined) right after a state becomes active.
pub const STATE_BEGIN: &str = "state_begin";
/// Hook invoked (if defined) right before a state is left.
pub const STATE_END: &str = "state_end";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct FunctionFlags: u8 {
        /// Calls are skipped while an invocation is already in flight
        /// for the same actor.
        const NON_REENTRANT = 1 << 0;
        /// May not be overridden by subclasses or states (link error).
        const FINAL = 1 << 1;
    }
}

/// Dispatch selector as it appears in compiled code. `Super` is
/// resolved against the class that defined the calling body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallModeSpec {
    #[default]
    Normal,
    Global,
    Super,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Const(Value),
    /// Read an actor variable; unknown names read as `Nil`.
    Var(String),
    /// Positional argument of the enclosing function; out of range
    /// reads as `Nil`.
    Arg(usize),
    /// Handle of the executing actor.
    SelfHandle,
    Add(Box<Expr>, Box<Expr>),
}

/// One instruction of a compiled body. This is the contract the
/// external compiler delivers; the runtime never sees source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Log(Expr),
    Set {
        var: String,
        value: Expr,
    },
    /// Call on the executing actor through the resolver.
    Call {
        name: String,
        #[serde(default)]
        mode: CallModeSpec,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        store: Option<String>,
    },
    /// Call on another actor; a `Nil`/dead target makes the call a
    /// no-op that stores `Nil`.
    CallOn {
        target: Expr,
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        store: Option<String>,
    },
    /// `state: None` targets NoState. Immediate at state-code depth,
    /// deferred otherwise.
    GotoState {
        state: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    /// Latent: suspend until `seconds` of simulated time have passed.
    Sleep {
        seconds: Expr,
    },
    /// Latent: suspend until the engine reports `tag`.
    AwaitSignal {
        tag: String,
    },
    Return(Option<Expr>),
    /// Halt state code until the next transition.
    Stop,
}

impl Op {
    pub fn is_latent(&self) -> bool {
        matches!(self, Op::Sleep { .. } | Op::AwaitSignal { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub flags: FunctionFlags,
    #[serde(default)]
    pub body: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub expands: Option<String>,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub ignores: Vec<String>,
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<Op>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
    #[serde(default)]
    pub states: Vec<StateDef>,
}
