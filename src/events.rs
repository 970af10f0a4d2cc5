use std::fmt;

use crate::actor::ActorHandle;
use crate::error::Fault;
use crate::latent::LatentPredicate;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    ActorSpawned { actor: ActorHandle, class: String },
    ActorDestroyed { actor: ActorHandle },
    StateEntered { actor: ActorHandle, state: String },
    StateExited { actor: ActorHandle, state: String },
    TransitionDeferred { actor: ActorHandle, state: Option<String> },
    LatentStarted { actor: ActorHandle, predicate: LatentPredicate },
    LatentResumed { actor: ActorHandle },
    LatentCancelled { actor: ActorHandle },
    ReentrantSkipped { actor: ActorHandle, function: String },
    IgnoredCall { actor: ActorHandle, function: String },
    ScriptLog { actor: ActorHandle, message: String },
    Fault { fault: Fault },
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEvent::ActorSpawned { actor, class } => {
                write!(f, "ActorSpawned {actor} class={class}")
            }
            RuntimeEvent::ActorDestroyed { actor } => write!(f, "ActorDestroyed {actor}"),
            RuntimeEvent::StateEntered { actor, state } => {
                write!(f, "StateEntered {actor} state={state}")
            }
            RuntimeEvent::StateExited { actor, state } => {
                write!(f, "StateExited {actor} state={state}")
            }
            RuntimeEvent::TransitionDeferred { actor, state } => {
                write!(f, "TransitionDeferred {actor} state={}", state.as_deref().unwrap_or("<none>"))
            }
            RuntimeEvent::LatentStarted { actor, predicate } => {
                write!(f, "LatentStarted {actor} predicate={predicate}")
            }
            RuntimeEvent::LatentResumed { actor } => write!(f, "LatentResumed {actor}"),
            RuntimeEvent::LatentCancelled { actor } => write!(f, "LatentCancelled {actor}"),
            RuntimeEvent::ReentrantSkipped { actor, function } => {
                write!(f, "ReentrantSkipped {actor} function={function}")
            }
            RuntimeEvent::IgnoredCall { actor, function } => {
                write!(f, "IgnoredCall {actor} function={function}")
            }
            RuntimeEvent::ScriptLog { actor, message } => write!(f, "ScriptLog {actor} {message}"),
            RuntimeEvent::Fault { fault } => write!(f, "Fault {fault}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RuntimeEvent>,
}

impl EventLog {
    pub fn push(&mut self, event: RuntimeEvent) {
        self.events.push(event);
    }

    pub fn drain(&mut self) -> Vec<RuntimeEvent> {
        self.events.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
