//! One pool slot's work: run the script against one rf and record the outcome
//! in that rf's status log. Outcomes never propagate as errors; a bad rf must
//! not stop its siblings.

use anyhow::Result;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sweeps_core::{banner, read_script, timestamp, Action, ProjectLayout, ScriptIdentity};

use crate::cancel::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Job {
    pub layout: ProjectLayout,
    pub interpreter: String,
    pub script: String,
    pub rf: String,
    /// Identity the rf was queued under.
    pub queued_as: ScriptIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfOutcome {
    Finished,
    /// Nonzero exit, death by signal, or a child that could not be spawned.
    Failed { code: Option<i32> },
    /// Not run: the script changed or vanished after queueing. Rolled back
    /// with `KILLED` under the queued identity.
    Skipped { reason: String },
    /// The rf's own files could not be written.
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub slot: usize,
    pub rf: String,
    pub outcome: RfOutcome,
}

pub fn execute(slot: usize, job: &Job, cancel: &CancellationToken) -> WorkerReport {
    let outcome = match execute_inner(job, cancel) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(rf = %job.rf, error = %err, "rf execution error");
            RfOutcome::Error {
                message: err.to_string(),
            }
        }
    };
    WorkerReport {
        slot,
        rf: job.rf.clone(),
        outcome,
    }
}

fn write_line(log: &mut File, line: &str) -> Result<()> {
    log.write_all(format!("{}\n", line).as_bytes())?;
    log.flush()?;
    Ok(())
}

/// Run-log lines are diagnostics; losing one never changes an rf's outcome.
fn note(log: &mut File, line: &str) {
    if let Err(err) = write_line(log, line) {
        tracing::warn!(error = %err, "run log write failed");
    }
}

fn execute_inner(job: &Job, cancel: &CancellationToken) -> Result<RfOutcome> {
    let rf = job.layout.run_folder(&job.rf);
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(rf.run_log_path())?;
    let mut status = rf.status_log().open_writer()?;
    note(&mut log, &banner(&format!("LOG FILE OPENED {}", timestamp()), ""));

    let current = match read_script(&job.layout, &job.script) {
        Ok(snapshot) => Ok(snapshot.identity),
        Err(err) => Err(err.to_string()),
    };
    let skip_reason = match &current {
        Ok(id) if *id == job.queued_as => None,
        Ok(id) => Some(format!(
            "SCRIPT CHANGED SINCE QUEUED ({} -> {}): NOT RUN",
            job.queued_as, id
        )),
        Err(err) => Some(format!("SCRIPT UNREADABLE ({}): NOT RUN", err)),
    };
    if let Some(reason) = skip_reason {
        note(&mut log, &reason);
        status.append(Action::Killed, &job.queued_as)?;
        note(&mut log, &banner(&format!("LOG FILE CLOSED {}", timestamp()), ""));
        tracing::warn!(rf = %job.rf, %reason, "rf skipped");
        return Ok(RfOutcome::Skipped { reason });
    }

    let script_path = job.layout.script_path(&job.script);
    let spawned = log.try_clone().and_then(|out| {
        let err = log.try_clone()?;
        Command::new(&job.interpreter)
            .arg(&script_path)
            .arg(rf.dir())
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .process_group(0)
            .spawn()
    });
    if let Err(err) = status.append(Action::Started, &job.queued_as) {
        if let Ok(child) = spawned {
            kill_group(child);
        }
        return Err(err.into());
    }
    tracing::info!(rf = %job.rf, script_id = %job.queued_as, "started");

    // From here every path records FAILED or FINISHED.
    let outcome = match spawned {
        Ok(child) => match wait_or_terminate(child, &mut log, cancel) {
            Ok(exit) if exit.success() => RfOutcome::Finished,
            Ok(exit) => {
                let code = exit.code().or_else(|| exit.signal().map(|s| -s));
                let shown = code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
                note(&mut log, &format!("SCRIPT RETURNED WITH EXIT CODE {}", shown));
                RfOutcome::Failed { code }
            }
            Err(err) => {
                tracing::warn!(rf = %job.rf, error = %err, "lost track of script");
                note(&mut log, &format!("SCRIPT LOST: {}", err));
                RfOutcome::Failed { code: None }
            }
        },
        Err(err) => {
            note(&mut log, &format!("SCRIPT COULD NOT BE STARTED: {}", err));
            RfOutcome::Failed { code: None }
        }
    };
    let recorded = match outcome {
        RfOutcome::Finished => Action::Finished,
        _ => Action::Failed,
    };
    status.append(recorded, &job.queued_as)?;
    note(&mut log, &banner(&format!("LOG FILE CLOSED {}", timestamp()), ""));
    tracing::info!(rf = %job.rf, outcome = ?outcome, "done");
    Ok(outcome)
}

/// SIGKILL to the child's whole process group, then reap it.
fn kill_group(mut child: Child) {
    let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

/// Waits for the child. On cancellation the child's process group gets
/// SIGTERM, then SIGKILL once the grace period runs out. The child is dead
/// whenever this returns.
fn wait_or_terminate(
    mut child: Child,
    log: &mut File,
    cancel: &CancellationToken,
) -> Result<ExitStatus> {
    let pgid = Pid::from_raw(child.id() as i32);
    let mut terminate_sent: Option<Instant> = None;
    loop {
        match child.try_wait() {
            Ok(Some(exit)) => return Ok(exit),
            Ok(None) => {}
            Err(err) => {
                kill_group(child);
                return Err(err.into());
            }
        }
        if cancel.is_cancelled() {
            match terminate_sent {
                None => {
                    if let Err(err) = killpg(pgid, Signal::SIGTERM) {
                        tracing::debug!(error = %err, "SIGTERM to process group failed");
                        let _ = child.kill();
                    }
                    terminate_sent = Some(Instant::now());
                    let signal = cancel.signal().unwrap_or(Signal::SIGTERM as i32);
                    note(log, &format!("SIGNAL {} RECEIVED: TERMINATING SCRIPT", signal));
                }
                Some(sent) if sent.elapsed() >= TERMINATE_GRACE => {
                    let _ = killpg(pgid, Signal::SIGKILL);
                    let _ = child.kill();
                    return Ok(child.wait()?);
                }
                Some(_) => {}
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}
