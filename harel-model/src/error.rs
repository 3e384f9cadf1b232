//! Model construction error types.
//!
//! Every fault here is detected at construction time, before any instance of
//! the machine runs. Nothing is auto-resolved.

use thiserror::Error;

/// Errors from machine definition parsing and validation.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("duplicate state name: '{name}'")]
    DuplicateState { name: String },

    #[error("unknown state: '{name}' referenced by {referrer}")]
    UnknownState { name: String, referrer: String },

    #[error("composite '{state}' declares no initial child")]
    MissingInitial { state: String },

    #[error("history pseudostate '{state}' has no default target")]
    MissingHistoryDefault { state: String },

    #[error("ambiguous transitions from '{state}' on '{trigger}' at priority {priority}")]
    AmbiguousTransitions {
        state: String,
        trigger: String,
        priority: u32,
    },

    #[error("cross-region transition from '{from}' to '{target}'")]
    CrossRegionTransition { from: String, target: String },

    #[error("unreachable state: '{name}'")]
    UnreachableState { name: String },

    #[error("unknown timer: '{name}' referenced by transition from '{from}'")]
    UnknownTimer { name: String, from: String },

    #[error("duplicate timer name: '{name}'")]
    DuplicateTimer { name: String },

    #[error("periodic timer '{name}' must have a non-zero interval")]
    ZeroIntervalTimer { name: String },

    #[error("completion trigger on leaf state '{state}'")]
    CompletionOnLeaf { state: String },

    #[error("local transition from '{from}' targets '{target}', which is not a descendant")]
    LocalTargetOutsideSource { from: String, target: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Returns a stable error code for diagnostics output.
    pub fn error_code(&self) -> &'static str {
        match self {
            ModelError::InvalidDefinition { .. } => "BAD_DEFINITION",
            ModelError::DuplicateState { .. } => "DUPLICATE_STATE",
            ModelError::UnknownState { .. } => "UNKNOWN_STATE",
            ModelError::MissingInitial { .. } => "MISSING_INITIAL",
            ModelError::MissingHistoryDefault { .. } => "MISSING_HISTORY_DEFAULT",
            ModelError::AmbiguousTransitions { .. } => "AMBIGUOUS_TRANSITIONS",
            ModelError::CrossRegionTransition { .. } => "CROSS_REGION_TRANSITION",
            ModelError::UnreachableState { .. } => "UNREACHABLE_STATE",
            ModelError::UnknownTimer { .. } => "UNKNOWN_TIMER",
            ModelError::DuplicateTimer { .. } => "DUPLICATE_TIMER",
            ModelError::ZeroIntervalTimer { .. } => "ZERO_INTERVAL_TIMER",
            ModelError::CompletionOnLeaf { .. } => "COMPLETION_ON_LEAF",
            ModelError::LocalTargetOutsideSource { .. } => "LOCAL_TARGET_OUTSIDE_SOURCE",
            ModelError::Json(_) => "BAD_DEFINITION",
        }
    }
}
