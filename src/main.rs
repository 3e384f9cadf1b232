//! harel - hierarchical state machine toolchain
//!
//! Validates machine definitions, runs them interactively under the RTC
//! interpreter, verifies dispatch-strategy equivalence, and emits
//! dependency-free dispatch tables.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use harel_codegen::{choose_strategy, ScriptStep, Strategy, TableSelector};
use harel_engine::{Event, Host, TraceEvent, WalkSelector};
use harel_model::Machine;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harel")]
#[command(about = "Hierarchical state machine toolchain")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    /// Pick by table footprint.
    Auto,
    /// Interpreting ancestor walk.
    Walk,
    /// Precomputed dispatch table.
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a machine definition and print its summary
    Check {
        /// Definition JSON file
        definition: PathBuf,
    },

    /// Run a script of events against a fresh instance
    Run {
        /// Definition JSON file
        definition: PathBuf,

        /// Initial context JSON
        #[arg(short, long)]
        ctx: Option<String>,

        /// Dispatch strategy
        #[arg(short, long, value_enum, default_value_t = StrategyArg::Auto)]
        strategy: StrategyArg,

        /// Script steps: EVENT, EVENT={json payload}, or +MS to advance
        /// the clock
        #[arg(required = true)]
        steps: Vec<String>,
    },

    /// Verify walk/table trace equivalence over a script
    Verify {
        /// Definition JSON file
        definition: PathBuf,

        /// Initial context JSON
        #[arg(short, long)]
        ctx: Option<String>,

        /// Script steps: EVENT, EVENT={json payload}, or +MS to advance
        /// the clock
        steps: Vec<String>,
    },

    /// Emit a no_std Rust module with precomputed dispatch tables
    Emit {
        /// Definition JSON file
        definition: PathBuf,

        /// Output path for the generated module
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn execute(cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Check { definition } => {
            let machine = load_machine(&definition)?;
            let strategy = choose_strategy(&machine, harel_codegen::DEFAULT_TABLE_ROW_LIMIT);
            let mut out = format!(
                "{} machine {} v{} (checksum: {})\n",
                "Valid".green(),
                machine.name.cyan(),
                machine.version,
                machine.checksum
            );
            out.push_str(&format!(
                "  states: {}  transitions: {}  timers: {}\n",
                machine.arena().iter().count(),
                machine.transitions().len(),
                machine.timers().len()
            ));
            out.push_str(&format!(
                "  queue capacity: {}  cascade limit: {}  max active leaves: {}\n",
                machine.caps.queue_capacity, machine.caps.cascade_limit, machine.caps.max_regions
            ));
            out.push_str(&format!(
                "  event alphabet: [{}]\n",
                machine.caps.event_alphabet.join(", ")
            ));
            out.push_str(&format!("  dispatch strategy: {}", strategy_name(strategy)));
            Ok(out)
        }

        Commands::Run {
            definition,
            ctx,
            strategy,
            steps,
        } => {
            let machine = load_machine(&definition)?;
            let initial_ctx = parse_ctx(ctx.as_deref())?;
            let script = parse_script(&steps)?;

            let host = Host::new();
            host.put_machine(&machine.to_json())?;
            let selector: Box<dyn harel_engine::Selector> = match strategy {
                StrategyArg::Auto => harel_codegen::selector_for(&machine),
                StrategyArg::Walk => Box::new(WalkSelector),
                StrategyArg::Table => Box::new(TableSelector::build(&machine)),
            };
            let (id, outcome) = host.create_instance_with(
                &machine.name,
                machine.version,
                None,
                initial_ctx,
                selector,
            )?;

            let mut out = format!("{} instance {}\n", "Started".green(), id.cyan());
            out.push_str(&format_outcome("init", &outcome));
            for step in script {
                let (label, outcome) = match step {
                    ScriptStep::Dispatch(event) => {
                        let label = event.signal_name().unwrap_or("<timer>").to_string();
                        (label, host.dispatch(&id, event)?)
                    }
                    ScriptStep::AdvanceClock(delta) => {
                        (format!("+{delta}ms"), host.advance_clock(&id, delta)?)
                    }
                };
                out.push_str(&format_outcome(&label, &outcome));
            }
            let snapshot = host.inspect(&id)?;
            out.push_str(&format!(
                "{} [{}]",
                "Final configuration:".bold(),
                snapshot.configuration.join(", ")
            ));
            Ok(out)
        }

        Commands::Verify {
            definition,
            ctx,
            steps,
        } => {
            let machine = Arc::new(load_machine(&definition)?);
            let initial_ctx = parse_ctx(ctx.as_deref())?;
            let script = parse_script(&steps)?;
            let report = harel_codegen::verify_equivalence(&machine, &initial_ctx, &script)?;
            Ok(format!(
                "{} walk and table strategies agree over {} steps ({} trace bytes)",
                "Equivalent:".green(),
                report.steps,
                report.trace_bytes
            ))
        }

        Commands::Emit { definition, out } => {
            let machine = load_machine(&definition)?;
            harel_codegen::write_module(&machine, &out)?;
            Ok(format!(
                "{} dispatch tables for {} v{} to {}",
                "Emitted".green(),
                machine.name.cyan(),
                machine.version,
                out.display()
            ))
        }
    }
}

fn load_machine(path: &PathBuf) -> Result<Machine, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let json: Value = serde_json::from_str(&text)?;
    Ok(Machine::from_json(&json)?)
}

fn parse_ctx(ctx: Option<&str>) -> Result<Value, Box<dyn std::error::Error>> {
    match ctx {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(Value::Object(serde_json::Map::new())),
    }
}

/// Parses `EVENT`, `EVENT={json}`, and `+MS` script steps.
fn parse_script(steps: &[String]) -> Result<Vec<ScriptStep>, Box<dyn std::error::Error>> {
    let mut script = Vec::with_capacity(steps.len());
    for step in steps {
        if let Some(ms) = step.strip_prefix('+') {
            let delta: u64 = ms
                .strip_suffix("ms")
                .unwrap_or(ms)
                .parse()
                .map_err(|_| format!("bad clock step '{step}': expected +MS"))?;
            script.push(ScriptStep::AdvanceClock(delta));
        } else if let Some((name, payload)) = step.split_once('=') {
            let payload: Value = serde_json::from_str(payload)
                .map_err(|e| format!("bad payload in '{step}': {e}"))?;
            script.push(ScriptStep::Dispatch(Event::signal(name, payload)));
        } else {
            script.push(ScriptStep::Dispatch(Event::named(step.as_str())));
        }
    }
    Ok(script)
}

fn format_outcome(label: &str, outcome: &harel_engine::StepOutcome) -> String {
    let mut out = format!("{} {}\n", "==".bold(), label.cyan());
    for event in &outcome.trace {
        out.push_str("  ");
        out.push_str(&format_trace_event(event));
        out.push('\n');
    }
    out.push_str(&format!("  -> [{}]\n", outcome.configuration.join(", ")));
    out
}

fn format_trace_event(event: &TraceEvent) -> String {
    match event {
        TraceEvent::Dispatched { event } => format!("{} {event}", "dispatch".blue()),
        TraceEvent::Exited { state } => format!("{} {state}", "exit".yellow()),
        TraceEvent::Entered { state } => format!("{} {state}", "enter".green()),
        TraceEvent::Action { name } => format!("{} {name}", "action".magenta()),
        TraceEvent::Fired {
            source,
            target,
            trigger,
        } => format!("{} {source} -> {target} on {trigger}", "fire".bold()),
        TraceEvent::Deferred { event, state } => {
            format!("{} {event} in {state}", "defer".yellow())
        }
        TraceEvent::Dropped { event } => format!("{} {event}", "drop".dimmed()),
        TraceEvent::Completed { state } => format!("{} {state}", "complete".green().bold()),
        TraceEvent::TimerFired { timer } => format!("{} {timer}", "timer".blue()),
        TraceEvent::StaleTimerDiscarded { timer } => {
            format!("{} {timer}", "stale-timer".dimmed())
        }
    }
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Walk => "ancestor walk",
        Strategy::Table => "precomputed table",
    }
}
