//! Differential verification of dispatch strategies.
//!
//! Two instances of the same machine, one per strategy, are driven through
//! the same script. Their serialized step outcomes must be byte-identical;
//! faults must also match by error code. Any difference is a divergence
//! fault pointing at the first offending script step.

use crate::error::CodegenError;
use crate::table::TableSelector;
use harel_engine::{Event, MachineInstance, Selector, WalkSelector};
use harel_model::Machine;
use serde_json::Value;
use std::sync::Arc;

/// One scripted stimulus.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Dispatch(Event),
    AdvanceClock(u64),
}

/// Summary of a passed verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivalenceReport {
    pub steps: usize,
    pub trace_bytes: usize,
}

/// Runs `script` under both strategies and checks the traces match.
pub fn verify_equivalence(
    machine: &Arc<Machine>,
    initial_ctx: &Value,
    script: &[ScriptStep],
) -> Result<EquivalenceReport, CodegenError> {
    verify_against(
        machine,
        initial_ctx,
        script,
        Box::new(TableSelector::build(machine)),
    )
}

/// Verification core, parameterized over the candidate strategy so tests
/// can inject a deliberately wrong one.
pub fn verify_against(
    machine: &Arc<Machine>,
    initial_ctx: &Value,
    script: &[ScriptStep],
    candidate: Box<dyn Selector>,
) -> Result<EquivalenceReport, CodegenError> {
    let mut walk = MachineInstance::new("verify-walk", Arc::clone(machine), initial_ctx.clone())
        .with_selector(Box::new(WalkSelector));
    let mut table =
        MachineInstance::new("verify-table", Arc::clone(machine), initial_ctx.clone())
            .with_selector(candidate);

    let mut trace_bytes = 0usize;
    compare_step(0, "init", walk.init(), table.init(), &mut trace_bytes)?;

    for (i, step) in script.iter().enumerate() {
        let step_no = i + 1;
        match step {
            ScriptStep::Dispatch(event) => {
                let label = format!("dispatch {}", event_label(event));
                compare_step(
                    step_no,
                    &label,
                    walk.dispatch(event.clone()),
                    table.dispatch(event.clone()),
                    &mut trace_bytes,
                )?;
            }
            ScriptStep::AdvanceClock(delta) => {
                let label = format!("advance {delta}ms");
                compare_step(
                    step_no,
                    &label,
                    walk.advance_clock(*delta),
                    table.advance_clock(*delta),
                    &mut trace_bytes,
                )?;
            }
        }
        // A fault poisons both instances identically, so the comparison can
        // keep going only while both stay healthy.
        if walk.ctx() != table.ctx() {
            return Err(CodegenError::Divergence {
                step: step_no,
                detail: format!("context diverged after {}", label_of(step)),
            });
        }
    }

    Ok(EquivalenceReport {
        steps: script.len() + 1,
        trace_bytes,
    })
}

fn compare_step(
    step: usize,
    label: &str,
    walk: Result<harel_engine::StepOutcome, harel_engine::EngineError>,
    table: Result<harel_engine::StepOutcome, harel_engine::EngineError>,
    trace_bytes: &mut usize,
) -> Result<(), CodegenError> {
    match (walk, table) {
        (Ok(w), Ok(t)) => {
            let wj = serde_json::to_vec(&w).map_err(|e| CodegenError::Divergence {
                step,
                detail: format!("walk outcome not serializable: {e}"),
            })?;
            let tj = serde_json::to_vec(&t).map_err(|e| CodegenError::Divergence {
                step,
                detail: format!("table outcome not serializable: {e}"),
            })?;
            if wj != tj {
                return Err(CodegenError::Divergence {
                    step,
                    detail: format!(
                        "{label}: walk ended in {:?}, table in {:?}",
                        w.configuration, t.configuration
                    ),
                });
            }
            *trace_bytes += wj.len();
            Ok(())
        }
        (Err(w), Err(t)) => {
            if w.error_code() != t.error_code() {
                return Err(CodegenError::Divergence {
                    step,
                    detail: format!(
                        "{label}: walk faulted with {} but table with {}",
                        w.error_code(),
                        t.error_code()
                    ),
                });
            }
            Ok(())
        }
        (Ok(w), Err(t)) => Err(CodegenError::Divergence {
            step,
            detail: format!(
                "{label}: walk succeeded into {:?} but table faulted with {}",
                w.configuration,
                t.error_code()
            ),
        }),
        (Err(w), Ok(t)) => Err(CodegenError::Divergence {
            step,
            detail: format!(
                "{label}: table succeeded into {:?} but walk faulted with {}",
                t.configuration,
                w.error_code()
            ),
        }),
    }
}

fn label_of(step: &ScriptStep) -> String {
    match step {
        ScriptStep::Dispatch(event) => format!("dispatch {}", event_label(event)),
        ScriptStep::AdvanceClock(delta) => format!("advance {delta}ms"),
    }
}

fn event_label(event: &Event) -> String {
    event.signal_name().unwrap_or("<timer>").to_string()
}
