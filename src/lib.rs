pub mod actor;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod harness;
pub mod latent;
pub mod registry;
pub mod script;
pub mod snapshot;
pub mod transition;
pub mod value;

pub use actor::{ActorHandle, Continuation, PendingTransition};
pub use dispatch::DispatchMode;
pub use driver::{Runtime, SignalDelivery, TickReport};
pub use error::Fault;
pub use events::{EventLog, RuntimeEvent};
pub use latent::{LatentPredicate, LatentRequest};
pub use registry::{ClassRegistry, RegistryBuilder};
pub use script::{ClassDef, FunctionDef, Op, StateDef};
pub use value::{Value, ValueKind};
