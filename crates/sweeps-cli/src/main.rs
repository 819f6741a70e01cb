use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use sweeps_core::{ProjectLayout, StatusTable, SweepChange, SweepError};
use sweeps_runner::{
    AutoApprove, Confirm, Coordinator, Progress, RfOutcome, StdinPrompt, SweepOutcome,
    SweepReport, SweepRequest, WorkerReport,
};

#[derive(Parser)]
#[command(
    name = "sweeps",
    version = "0.3.0",
    about = "Utility for managing parameter sweeps"
)]
struct Cli {
    /// Project directory
    project: PathBuf,
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create rfs from a sweep file
    Create {
        /// JSON or YAML file specifying the sweep, relative to PROJECT
        sweep_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Delete rfs from a sweep file
    Delete {
        sweep_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run a parameter sweep over existing rfs
    Run {
        /// Interpreter for SCRIPT
        program: String,
        /// Script location relative to PROJECT/bin
        script: String,
        /// Number of worker processes
        #[arg(long)]
        procs: Option<usize>,
        /// Restrict to rfs produced by this sweep file, relative to PROJECT
        #[arg(long = "sweep-file")]
        sweep_file: Option<PathBuf>,
        /// Rerun failed rfs
        #[arg(long)]
        rerun_failed: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the sweep summary for a script
    Query {
        script: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(&cli.project, cli.command);
    match result {
        Ok((payload, code)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&failure_envelope(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Logs each rf as it completes.
struct LogProgress;

impl Progress for LogProgress {
    fn completed(&mut self, report: &WorkerReport) {
        match &report.outcome {
            RfOutcome::Finished => tracing::info!(rf = %report.rf, slot = report.slot, "finished"),
            RfOutcome::Failed { code } => {
                tracing::warn!(rf = %report.rf, code = ?code, "failed")
            }
            RfOutcome::Skipped { reason } => tracing::warn!(rf = %report.rf, %reason, "skipped"),
            RfOutcome::Error { message } => tracing::warn!(rf = %report.rf, %message, "error"),
        }
    }
}

fn run_command(project: &Path, command: Commands) -> Result<(Option<Value>, i32)> {
    let layout = ProjectLayout::new(project);
    match command {
        Commands::Create { sweep_file, json } => {
            let change = sweeps_core::create_rfs(&layout, &sweep_file)?;
            if json {
                return Ok((Some(change_to_json("create", &change)), 0));
            }
            println!("created: {}", change.changed);
            println!("existing: {}", change.unchanged);
            println!("archived: {}", change.archived.display());
        }
        Commands::Delete { sweep_file, json } => {
            let change = sweeps_core::delete_rfs(&layout, &sweep_file)?;
            if json {
                return Ok((Some(change_to_json("delete", &change)), 0));
            }
            println!("deleted: {}", change.changed);
            println!("missing: {}", change.unchanged);
            println!("archived: {}", change.archived.display());
        }
        Commands::Run {
            program,
            script,
            procs,
            sweep_file,
            rerun_failed,
            yes,
            json,
        } => {
            let workers = procs.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
            let request = SweepRequest {
                project: project.to_path_buf(),
                interpreter: program,
                script,
                workers,
                restrict_to: sweep_file,
                rerun_failed,
            };
            let coordinator = Coordinator::new(request).with_signal_handling(true);
            let mut confirm: Box<dyn Confirm> = if yes {
                Box::new(AutoApprove)
            } else {
                Box::new(StdinPrompt)
            };
            let report = coordinator.run(confirm.as_mut(), &mut LogProgress)?;
            let code = report.outcome.exit_code();
            if json {
                return Ok((Some(report_to_json(&report)), code));
            }
            print_report(&report);
            return Ok((None, code));
        }
        Commands::Query { script, json } => {
            let (identity, table) = sweeps_runner::query_status(project, &script)?;
            if json {
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "query",
                        "script_id": identity.to_string(),
                        "total": table.total(),
                        "counts": table_to_json(&table),
                    })),
                    0,
                ));
            }
            print!("{}", sweeps_runner::render_histogram(&identity, &table));
        }
    }
    Ok((None, 0))
}

fn print_report(report: &SweepReport) {
    match &report.outcome {
        SweepOutcome::Aborted => println!("Aborting sweep."),
        SweepOutcome::Completed(tally) => {
            println!("Sweep completed.");
            println!("finished: {}", tally.finished);
            println!("failed: {}", tally.failed);
            if tally.skipped > 0 {
                println!("skipped: {}", tally.skipped);
            }
            if tally.errors > 0 {
                println!("errors: {}", tally.errors);
            }
        }
        SweepOutcome::Cancelled { signal, tally } => {
            println!("Sweep cancelled by signal {}.", signal);
            println!("finished: {}", tally.finished);
            println!("failed: {}", tally.failed);
        }
    }
    println!("run_file: {}", report.manifest_path.display());
}

fn emit_json(value: &Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|err| {
        failure_envelope(&anyhow::anyhow!("unserializable result: {}", err)).to_string()
    });
    println!("{}", line);
}

/// `{"ok": false, "error": {"code", "message", "chain"}}`, with a code a
/// caller can branch on.
fn failure_envelope(err: &anyhow::Error) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": error_code(err),
            "message": err.to_string(),
            "chain": err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>(),
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::Locked(_)) => "operation_in_progress",
        Some(SweepError::ScriptUnreadable { .. }) => "script_unreadable",
        Some(SweepError::InvalidSweep { .. } | SweepError::Json(_) | SweepError::Yaml(_)) => {
            "invalid_sweep"
        }
        Some(SweepError::Io { .. }) => "io_error",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Create { json, .. }
        | Commands::Delete { json, .. }
        | Commands::Run { json, .. }
        | Commands::Query { json, .. } => *json,
    }
}

fn change_to_json(command: &str, change: &SweepChange) -> Value {
    json!({
        "ok": true,
        "command": command,
        "changed": change.changed,
        "unchanged": change.unchanged,
        "archived": change.archived.display().to_string(),
    })
}

fn table_to_json(table: &StatusTable) -> Value {
    let mut counts = serde_json::Map::new();
    for (status, rfs) in table.iter() {
        counts.insert(status.as_str().to_string(), json!(rfs.len()));
    }
    Value::Object(counts)
}

fn report_to_json(report: &SweepReport) -> Value {
    let tally = match &report.outcome {
        SweepOutcome::Aborted => None,
        SweepOutcome::Completed(tally) | SweepOutcome::Cancelled { tally, .. } => Some(tally),
    };
    json!({
        "ok": true,
        "command": "run",
        "outcome": report.outcome.as_str(),
        "exit_code": report.outcome.exit_code(),
        "run_file": report.manifest_path.display().to_string(),
        "script_id": report.manifest.script_id,
        "queued": report.manifest.queued,
        "invalid": report.manifest.invalid,
        "active": report.manifest.active,
        "finished": tally.map(|t| t.finished),
        "failed": tally.map(|t| t.failed),
        "skipped": tally.map(|t| t.skipped),
    })
}
