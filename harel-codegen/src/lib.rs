//! Dispatch-table generation and strategy verification.
//!
//! Three concerns live here: precomputing flat dispatch tables from a
//! validated machine ([`table`]), emitting those tables as dependency-free
//! `no_std` Rust source ([`emit`]), and differentially verifying that the
//! table strategy is trace-equivalent to the interpreting ancestor walk
//! ([`equivalence`]).

pub mod emit;
pub mod equivalence;
pub mod error;
pub mod table;

pub use emit::{emit_module, write_module};
pub use equivalence::{verify_equivalence, EquivalenceReport, ScriptStep};
pub use error::CodegenError;
pub use table::{
    choose_strategy, selector_for, DispatchTable, Strategy, TableSelector,
    DEFAULT_TABLE_ROW_LIMIT,
};
