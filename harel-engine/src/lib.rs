//! Deterministic run-to-completion execution of hierarchical machines.
//!
//! The engine consumes validated [`harel_model::Machine`] definitions and
//! drives instances through discrete RTC steps: transition selection, LCA
//! exit/entry, history recording, deferral, logical-clock timers, and
//! bounded completion cascades. All nondeterminism is resolved by total
//! tie-break orders, so identical inputs always produce identical traces.
//!
//! Transition selection sits behind the [`Selector`] trait so the default
//! ancestor-walk strategy and precomputed-table strategies stay trace
//! equivalent by construction.

pub mod deferral;
pub mod error;
pub mod eval;
pub mod event;
pub mod history;
pub mod host;
pub mod instance;
pub mod queue;
pub mod selector;
pub mod timer;
pub mod trace;

pub use error::{EngineError, EvalError};
pub use eval::{ContextEvaluator, Evaluator};
pub use event::{Event, EventKind};
pub use host::{Host, InstanceSnapshot};
pub use instance::{MachineInstance, Phase};
pub use selector::{Selector, WalkSelector};
pub use trace::{StepOutcome, TraceEvent};
