//! Code generation and verification fault types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodegenError {
    /// The flat dispatch table would exceed the row budget; the ancestor-walk
    /// strategy must be used instead.
    #[error("dispatch table too large: {rows} rows exceed limit {limit}")]
    TableTooLarge { rows: usize, limit: usize },

    /// A model index does not fit the emitted integer width.
    #[error("model too large for emission: {what} count {count} exceeds {max}")]
    IndexOverflow {
        what: &'static str,
        count: usize,
        max: usize,
    },

    /// The two dispatch strategies produced different observable behavior.
    #[error("strategy divergence at script step {step}: {detail}")]
    Divergence { step: usize, detail: String },

    #[error(transparent)]
    Engine(#[from] harel_engine::EngineError),

    #[error(transparent)]
    Model(#[from] harel_model::ModelError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl CodegenError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CodegenError::TableTooLarge { .. } => "TABLE_TOO_LARGE",
            CodegenError::IndexOverflow { .. } => "INDEX_OVERFLOW",
            CodegenError::Divergence { .. } => "STRATEGY_DIVERGENCE",
            CodegenError::Engine(e) => e.error_code(),
            CodegenError::Model(e) => e.error_code(),
            CodegenError::Io(_) => "IO_ERROR",
        }
    }
}
