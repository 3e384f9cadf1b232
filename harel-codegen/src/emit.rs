//! Emission of dependency-free Rust dispatch tables.
//!
//! The emitted module is a single `#![no_std]` source file holding the
//! state tree, transition table, timer table, and precomputed dispatch
//! chains as `const` data, with two lookup functions and no heap use.
//! Guards and actions stay as string tables; evaluating them is the
//! embedding host's concern.

use crate::error::CodegenError;
use harel_engine::selector::match_level;
use harel_engine::EventKind;
use harel_model::{Machine, StateKind, TransitionKind};
use std::path::Path;

/// Index value meaning "no state" in emitted tables.
const NONE: u16 = u16::MAX;
/// Separator between fall-through levels inside a candidate row.
const LEVEL_BREAK: u16 = u16::MAX;

/// Renders a machine as a self-contained `no_std` Rust module.
pub fn emit_module(machine: &Machine) -> Result<String, CodegenError> {
    let state_count = machine.arena().iter().count();
    check_width("states", state_count, NONE as usize)?;
    check_width("transitions", machine.transitions().len(), LEVEL_BREAK as usize)?;
    check_width("timers", machine.timers().len(), u16::MAX as usize)?;

    let arena = machine.arena();
    let alphabet = &machine.caps.event_alphabet;
    let mut out = String::new();

    out.push_str(&format!(
        "// Generated from machine '{}' v{} (checksum {}). Do not edit.\n",
        machine.name, machine.version, machine.checksum
    ));
    out.push_str("#![no_std]\n#![allow(dead_code)]\n\n");

    out.push_str(&format!("pub const MACHINE_NAME: &str = {:?};\n", machine.name));
    out.push_str(&format!("pub const MACHINE_VERSION: u32 = {};\n", machine.version));
    out.push_str(&format!(
        "pub const DEFINITION_CHECKSUM: &str = {:?};\n\n",
        machine.checksum
    ));

    out.push_str(&format!(
        "pub const QUEUE_CAPACITY: usize = {};\n",
        machine.caps.queue_capacity
    ));
    out.push_str(&format!(
        "pub const CASCADE_LIMIT: u32 = {};\n",
        machine.caps.cascade_limit
    ));
    out.push_str(&format!(
        "pub const MAX_ACTIVE_LEAVES: usize = {};\n\n",
        machine.caps.max_regions
    ));

    out.push_str("/// Index value meaning \"none\".\npub const NONE: u16 = u16::MAX;\n");
    out.push_str("/// Separator between fall-through levels in a candidate row.\n");
    out.push_str("pub const LEVEL_BREAK: u16 = u16::MAX;\n\n");

    // State tree.
    out.push_str(&format!("pub const STATE_COUNT: usize = {state_count};\n"));
    emit_str_array(
        &mut out,
        "STATE_NAMES",
        arena.iter().map(|n| n.name.as_str()),
        state_count,
    );
    emit_num_array(
        &mut out,
        "PARENT",
        "u16",
        arena.iter().map(|n| match n.parent {
            Some(p) => p.index() as u64,
            None => NONE as u64,
        }),
    );
    emit_num_array(&mut out, "DEPTH", "u8", arena.iter().map(|n| n.depth as u64));
    emit_num_array(
        &mut out,
        "KIND",
        "u8",
        arena.iter().map(|n| kind_code(n.kind) as u64),
    );
    emit_num_array(
        &mut out,
        "INITIAL",
        "u16",
        arena.iter().map(|n| match n.initial {
            Some(i) => i.index() as u64,
            None => NONE as u64,
        }),
    );
    emit_num_array(
        &mut out,
        "HISTORY_DEFAULT",
        "u16",
        arena.iter().map(|n| match n.history_default {
            Some(d) => d.index() as u64,
            None => NONE as u64,
        }),
    );
    out.push_str(
        "\npub mod kind {\n    pub const SIMPLE: u8 = 0;\n    pub const COMPOSITE: u8 = 1;\n    pub const PARALLEL: u8 = 2;\n    pub const FINAL: u8 = 3;\n    pub const SHALLOW_HISTORY: u8 = 4;\n    pub const DEEP_HISTORY: u8 = 5;\n}\n\n",
    );

    // Event alphabet.
    out.push_str(&format!("pub const EVENT_COUNT: usize = {};\n", alphabet.len()));
    emit_str_array(
        &mut out,
        "EVENT_ALPHABET",
        alphabet.iter().map(String::as_str),
        alphabet.len(),
    );
    out.push('\n');

    // Transition table.
    let transitions = machine.transitions();
    out.push_str(&format!(
        "pub const TRANSITION_COUNT: usize = {};\n",
        transitions.len()
    ));
    emit_num_array(
        &mut out,
        "T_SOURCE",
        "u16",
        transitions.iter().map(|t| t.source.index() as u64),
    );
    emit_num_array(
        &mut out,
        "T_TARGET",
        "u16",
        transitions.iter().map(|t| t.target.index() as u64),
    );
    emit_num_array(
        &mut out,
        "T_KIND",
        "u8",
        transitions.iter().map(|t| transition_kind_code(t.kind) as u64),
    );
    emit_num_array(
        &mut out,
        "T_PRIORITY",
        "u32",
        transitions.iter().map(|t| t.priority as u64),
    );

    out.push_str(&format!(
        "pub const T_GUARD: [Option<&str>; {}] = [",
        transitions.len()
    ));
    for (i, t) in transitions.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match &t.guard {
            Some(g) => out.push_str(&format!("Some({g:?})")),
            None => out.push_str("None"),
        }
    }
    out.push_str("];\n");

    out.push_str(&format!(
        "pub const T_ACTIONS: [&[&str]; {}] = [",
        transitions.len()
    ));
    for (i, t) in transitions.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str("&[");
        for (j, a) in t.actions.iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("{a:?}"));
        }
        out.push(']');
    }
    out.push_str("];\n\n");

    // Timer table.
    let timers = machine.timers();
    out.push_str(&format!("pub const TIMER_COUNT: usize = {};\n", timers.len()));
    emit_str_array(
        &mut out,
        "TIMER_NAMES",
        timers.iter().map(|t| t.name.as_str()),
        timers.len(),
    );
    emit_num_array(
        &mut out,
        "TIMER_OWNER",
        "u16",
        timers.iter().map(|t| t.owner.index() as u64),
    );
    emit_num_array(&mut out, "TIMER_AFTER_MS", "u64", timers.iter().map(|t| t.after_ms));
    out.push_str(&format!("pub const TIMER_PERIODIC: [bool; {}] = [", timers.len()));
    for (i, t) in timers.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(if t.periodic { "true" } else { "false" });
    }
    out.push_str("];\n\n");

    // Dispatch chains: one row per (state, column), columns are external
    // events then timers. Rows hold the walk's candidate levels innermost
    // first, separated by LEVEL_BREAK.
    let mut columns: Vec<EventKind> = alphabet
        .iter()
        .map(|name| EventKind::Signal(name.clone()))
        .collect();
    for timer in timers {
        columns.push(EventKind::Timer {
            timer: timer.id,
            generation: 0,
        });
    }

    let mut offsets: Vec<u32> = Vec::with_capacity(state_count * columns.len() + 1);
    let mut candidates: Vec<u16> = Vec::new();
    for node in arena.iter() {
        for column in &columns {
            offsets.push(candidates.len() as u32);
            let mut first_level = true;
            for level in arena.ancestors_and_self(node.id) {
                let level_candidates = match_level(machine, level, column);
                if level_candidates.is_empty() {
                    continue;
                }
                if !first_level {
                    candidates.push(LEVEL_BREAK);
                }
                first_level = false;
                candidates.extend(level_candidates.iter().map(|t| t.index() as u16));
            }
        }
    }
    offsets.push(candidates.len() as u32);

    out.push_str(&format!("pub const COLUMN_COUNT: usize = {};\n", columns.len()));
    emit_num_array(
        &mut out,
        "ROW_OFFSETS",
        "u32",
        offsets.iter().map(|&o| o as u64),
    );
    emit_num_array(
        &mut out,
        "CANDIDATES",
        "u16",
        candidates.iter().map(|&c| c as u64),
    );

    out.push_str(
        "\n/// Candidate transitions for an active leaf and trigger column,\n\
         /// innermost level first with LEVEL_BREAK separators.\n\
         pub fn candidates(state: u16, column: u16) -> &'static [u16] {\n\
         \x20   let row = state as usize * COLUMN_COUNT + column as usize;\n\
         \x20   &CANDIDATES[ROW_OFFSETS[row] as usize..ROW_OFFSETS[row + 1] as usize]\n\
         }\n\n\
         /// Column index of an external event name, if it is in the alphabet.\n\
         pub fn event_column(name: &str) -> Option<u16> {\n\
         \x20   let mut i = 0;\n\
         \x20   while i < EVENT_COUNT {\n\
         \x20       if EVENT_ALPHABET[i].as_bytes() == name.as_bytes() {\n\
         \x20           return Some(i as u16);\n\
         \x20       }\n\
         \x20       i += 1;\n\
         \x20   }\n\
         \x20   None\n\
         }\n",
    );

    Ok(out)
}

/// Emits the module to a file.
pub fn write_module(machine: &Machine, path: &Path) -> Result<(), CodegenError> {
    let source = emit_module(machine)?;
    std::fs::write(path, source)?;
    tracing::info!(machine = %machine.name, path = %path.display(), "module emitted");
    Ok(())
}

fn check_width(what: &'static str, count: usize, max: usize) -> Result<(), CodegenError> {
    if count >= max {
        return Err(CodegenError::IndexOverflow { what, count, max });
    }
    Ok(())
}

fn kind_code(kind: StateKind) -> u8 {
    match kind {
        StateKind::Simple => 0,
        StateKind::Composite => 1,
        StateKind::Parallel => 2,
        StateKind::Final => 3,
        StateKind::ShallowHistory => 4,
        StateKind::DeepHistory => 5,
    }
}

fn transition_kind_code(kind: TransitionKind) -> u8 {
    match kind {
        TransitionKind::External => 0,
        TransitionKind::Local => 1,
        TransitionKind::Internal => 2,
    }
}

fn emit_str_array<'a>(
    out: &mut String,
    name: &str,
    values: impl Iterator<Item = &'a str>,
    len: usize,
) {
    out.push_str(&format!("pub const {name}: [&str; {len}] = ["));
    for (i, v) in values.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("{v:?}"));
    }
    out.push_str("];\n");
}

fn emit_num_array(out: &mut String, name: &str, ty: &str, values: impl Iterator<Item = u64>) {
    let values: Vec<u64> = values.collect();
    out.push_str(&format!("pub const {name}: [{ty}; {}] = [", values.len()));
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if *v == NONE as u64 && ty == "u16" {
            out.push_str("u16::MAX");
        } else {
            out.push_str(&v.to_string());
        }
    }
    out.push_str("];\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine() -> Machine {
        Machine::from_json(&json!({
            "name": "door",
            "version": 2,
            "initial": "closed",
            "states": [
                {"name": "closed", "timers": [{"name": "auto", "after_ms": 30000}]},
                {"name": "open"}
            ],
            "transitions": [
                {"from": "closed", "event": "OPEN", "to": "open", "guard": "ctx.unlocked"},
                {"from": "open", "event": "CLOSE", "to": "closed", "actions": ["ctx.count = evt.count"]},
                {"from": "closed", "timer": "auto", "to": "closed", "kind": "internal"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_emitted_module_shape() {
        let source = emit_module(&machine()).unwrap();
        assert!(source.starts_with("// Generated from machine 'door' v2"));
        assert!(source.contains("#![no_std]"));
        assert!(source.contains("pub const MACHINE_NAME: &str = \"door\";"));
        assert!(source.contains("pub const TRANSITION_COUNT: usize = 3;"));
        assert!(source.contains("Some(\"ctx.unlocked\")"));
        assert!(source.contains("\"ctx.count = evt.count\""));
        assert!(source.contains("pub const TIMER_AFTER_MS: [u64; 1] = [30000];"));
        assert!(source.contains("pub fn candidates(state: u16, column: u16)"));
        // No runtime dependencies in the emitted module.
        assert!(!source.contains("use "));
        assert!(!source.contains("std::"));
    }

    #[test]
    fn test_row_offsets_cover_all_rows() {
        let m = machine();
        let source = emit_module(&m).unwrap();
        let states = m.arena().iter().count();
        let columns = m.caps.event_alphabet.len() + m.timers().len();
        assert!(source.contains(&format!(
            "pub const ROW_OFFSETS: [u32; {}]",
            states * columns + 1
        )));
    }

    #[test]
    fn test_write_module_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("door_tables.rs");
        write_module(&machine(), &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("pub const STATE_COUNT"));
    }
}
