use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::cancel::CancellationToken;

const ANSWER_POLL: Duration = Duration::from_millis(100);

/// What the operator is asked to approve.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub manifest_path: PathBuf,
    pub queued: usize,
    pub invalid: usize,
    pub active: usize,
    /// Fires when a signal arrives while the question is open.
    pub cancel: CancellationToken,
}

pub trait Confirm {
    fn confirm(&mut self, request: &ConfirmRequest) -> Result<bool>;
}

/// Interactive `Proceed (y/N)?` on stdin. Only `y` approves; a signal while
/// waiting declines.
pub struct StdinPrompt;

impl Confirm for StdinPrompt {
    fn confirm(&mut self, request: &ConfirmRequest) -> Result<bool> {
        if request.invalid > 0 {
            println!("Warning: Found rfs with status INVALID (ignored)");
        }
        if request.active > 0 {
            println!("Warning: Found rfs with status QUEUED or RUNNING (ignored)");
        }
        print!(
            "Run file written to {} ({} rfs queued to run).\nProceed (y/N)? ",
            request.manifest_path.display(),
            request.queued
        );
        io::stdout().flush()?;

        let (tx, rx) = mpsc::channel();
        // Detached: a reader stuck on a silent terminal must not hold up the abort.
        thread::Builder::new()
            .name("sweep-prompt".to_string())
            .spawn(move || {
                let mut answer = String::new();
                let line = io::stdin().lock().read_line(&mut answer).map(|_| answer);
                let _ = tx.send(line);
            })?;
        let approved = match await_answer(&rx, &request.cancel)? {
            Some(answer) => answer.trim_end_matches(['\r', '\n']) == "y",
            None => {
                println!();
                false
            }
        };
        if approved {
            println!("Sweep started. Press CTRL+C to interrupt.");
        }
        Ok(approved)
    }
}

/// The answer line, or `None` once cancellation wins the race.
fn await_answer(
    answers: &Receiver<io::Result<String>>,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match answers.recv_timeout(ANSWER_POLL) {
            Ok(line) => return Ok(Some(line?)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(None),
        }
    }
}

/// Approves without asking, for `--yes` and tests.
pub struct AutoApprove;

impl Confirm for AutoApprove {
    fn confirm(&mut self, request: &ConfirmRequest) -> Result<bool> {
        tracing::info!(
            manifest = %request.manifest_path.display(),
            queued = request.queued,
            "auto-approved sweep"
        );
        Ok(true)
    }
}

/// Refuses every sweep.
pub struct Decline;

impl Confirm for Decline {
    fn confirm(&mut self, _request: &ConfirmRequest) -> Result<bool> {
        Ok(false)
    }
}
