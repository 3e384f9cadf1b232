//! # harel-model
//!
//! Validated hierarchical state machine model for harel.
//!
//! This crate provides:
//! - The raw JSON definition DSL
//! - A flat, index-addressed state tree arena
//! - Construction-time validation (ambiguity, history defaults, regions,
//!   reachability)
//! - Derived capacities for fixed-memory code generation

pub mod analysis;
pub mod arena;
pub mod error;
pub mod machine;
pub mod raw;

pub use analysis::Capacities;
pub use arena::{StateArena, StateId, StateKind, StateNode};
pub use error::ModelError;
pub use machine::{Machine, TimerDef, TimerId, TransitionDef, TransitionId, Trigger};
pub use raw::{OverflowPolicy, RawMachine, RawState, RawTransition, TransitionKind};
