//! Runtime fault types.
//!
//! Every runtime condition surfaces as a distinct, named fault; nothing is
//! left as unspecified behavior and no guard/action failure is coerced to a
//! default value.

use thiserror::Error;

/// Faults raised while driving a machine instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("event queue overflow: capacity {capacity}")]
    QueueOverflow { capacity: usize },

    #[error("instance poisoned by earlier fatal fault: {reason}")]
    InstancePoisoned { reason: String },

    #[error("completion cascade exceeded limit {limit}")]
    CascadeLimitExceeded { limit: u32 },

    #[error("ambiguous selection in state '{state}' on '{trigger}': transitions at equal priority are simultaneously enabled")]
    AmbiguousSelection { state: String, trigger: String },

    #[error("guard evaluation failed on transition '{from}' -> '{target}': {reason}")]
    GuardEvaluation {
        from: String,
        target: String,
        reason: String,
    },

    #[error("action '{action}' failed: {reason}")]
    ActionEvaluation { action: String, reason: String },

    #[error("instance not initialized; call init() first")]
    NotInitialized,

    #[error("instance already initialized")]
    AlreadyInitialized,

    #[error("machine not found: {machine} v{version}")]
    MachineNotFound { machine: String, version: u32 },

    #[error("machine version already exists with a different definition: {machine} v{version}")]
    MachineVersionExists { machine: String, version: u32 },

    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("instance already exists: {instance_id}")]
    InstanceExists { instance_id: String },

    #[error(transparent)]
    Model(#[from] harel_model::ModelError),
}

impl EngineError {
    /// Returns a stable error code for diagnostics output.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::QueueOverflow { .. } => "QUEUE_OVERFLOW",
            EngineError::InstancePoisoned { .. } => "INSTANCE_POISONED",
            EngineError::CascadeLimitExceeded { .. } => "CASCADE_LIMIT",
            EngineError::AmbiguousSelection { .. } => "AMBIGUOUS_SELECTION",
            EngineError::GuardEvaluation { .. } => "GUARD_EVAL_FAILED",
            EngineError::ActionEvaluation { .. } => "ACTION_EVAL_FAILED",
            EngineError::NotInitialized => "NOT_INITIALIZED",
            EngineError::AlreadyInitialized => "ALREADY_INITIALIZED",
            EngineError::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            EngineError::MachineVersionExists { .. } => "MACHINE_VERSION_EXISTS",
            EngineError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            EngineError::InstanceExists { .. } => "INSTANCE_EXISTS",
            EngineError::Model(_) => "BAD_DEFINITION",
        }
    }
}

/// Failure inside an injected guard/action evaluator.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct EvalError {
    pub reason: String,
}

impl EvalError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
