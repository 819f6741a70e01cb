//! The coordinator: select eligible rfs, write and approve the manifest,
//! queue the work set, and drive a bounded pool of worker threads.

use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use sweeps_core::{
    collect_rf_status, read_script, timestamp, Action, ProjectLayout, QueueLock, ScriptIdentity,
    ScriptSnapshot, Status, StatusTable, SweepDefinition,
};

use crate::cancel::CancellationToken;
use crate::confirm::{Confirm, ConfirmRequest};
use crate::manifest::RunManifest;
use crate::signals::SignalAdapter;
use crate::worker::{execute, Job, RfOutcome, WorkerReport};

/// Reported when cancellation came from a caller rather than a signal.
const DEFAULT_CANCEL_SIGNAL: i32 = 15;

#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub project: PathBuf,
    pub interpreter: String,
    /// Script name, relative to the project's `bin/`.
    pub script: String,
    pub workers: usize,
    /// Sweep definition, relative to the project, limiting which rfs run.
    pub restrict_to: Option<PathBuf>,
    pub rerun_failed: bool,
}

/// Status classes after restriction, and the work set derived from them.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub script: ScriptSnapshot,
    pub table: StatusTable,
    pub work: BTreeSet<String>,
}

impl SweepPlan {
    pub fn invalid(&self) -> &BTreeSet<String> {
        self.table.get(Status::Invalid)
    }

    pub fn active(&self) -> BTreeSet<String> {
        self.table
            .get(Status::Queued)
            .union(self.table.get(Status::Running))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepTally {
    pub finished: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl SweepTally {
    fn record(&mut self, outcome: &RfOutcome) {
        match outcome {
            RfOutcome::Finished => self.finished += 1,
            RfOutcome::Failed { .. } => self.failed += 1,
            RfOutcome::Skipped { .. } => self.skipped += 1,
            RfOutcome::Error { .. } => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The operator declined; only the manifest was written.
    Aborted,
    Completed(SweepTally),
    Cancelled { signal: i32, tally: SweepTally },
}

impl SweepOutcome {
    /// Process exit status: `128 + signal` after cancellation, else 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            SweepOutcome::Cancelled { signal, .. } => 128 + signal,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SweepOutcome::Aborted => "aborted",
            SweepOutcome::Completed(_) => "completed",
            SweepOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub manifest: RunManifest,
    pub manifest_path: PathBuf,
    pub outcome: SweepOutcome,
}

/// Notified on the coordinator thread as each rf completes, in arrival order.
pub trait Progress {
    fn completed(&mut self, _report: &WorkerReport) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

pub struct Coordinator {
    layout: ProjectLayout,
    request: SweepRequest,
    cancel: CancellationToken,
    handle_signals: bool,
}

impl Coordinator {
    pub fn new(request: SweepRequest) -> Self {
        Self {
            layout: ProjectLayout::new(&request.project),
            request,
            cancel: CancellationToken::new(),
            handle_signals: false,
        }
    }

    /// Installs the signal adapter once the sweep is approved.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops dispatching, terminates in-flight children, and rolls the work
    /// set back with `KILLED` once the pool has drained.
    pub fn cancel(&self, signal: i32) {
        self.cancel.cancel(signal);
    }

    /// Selection only; touches nothing on disk.
    pub fn plan(&self) -> Result<SweepPlan> {
        let script = read_script(&self.layout, &self.request.script)?;
        let mut table = collect_rf_status(&self.layout, &script.identity)?;
        if let Some(restrict) = &self.request.restrict_to {
            let sweep = SweepDefinition::load(&self.layout.resolve(restrict))?;
            table.restrict_to(&sweep.rf_ids()?);
        }
        let mut work = table.get(Status::New).clone();
        if self.request.rerun_failed {
            work.extend(table.get(Status::Failed).iter().cloned());
        }
        Ok(SweepPlan {
            script,
            table,
            work,
        })
    }

    pub fn run(&self, confirm: &mut dyn Confirm, progress: &mut dyn Progress) -> Result<SweepReport> {
        // Before the lock, so a signal at the prompt unwinds through its Drop.
        if self.handle_signals {
            SignalAdapter::install(self.cancel_handle())?;
        }
        let lock = QueueLock::acquire(&self.layout)?;
        let plan = self.plan()?;
        let identity = plan.script.identity.clone();

        let manifest = RunManifest {
            stamp: self.layout.history_stamp()?,
            timestamp: timestamp(),
            script_id: identity.to_string(),
            rerun_failed: self.request.rerun_failed,
            restrict_to: self
                .request
                .restrict_to
                .as_ref()
                .map(|p| p.display().to_string()),
            queued: plan.work.clone(),
            invalid: plan.invalid().clone(),
            active: plan.active(),
        };
        let manifest_path = manifest.write(&self.layout)?;
        if !manifest.invalid.is_empty() {
            tracing::warn!(count = manifest.invalid.len(), "rfs with status INVALID ignored");
        }
        if !manifest.active.is_empty() {
            tracing::warn!(count = manifest.active.len(), "rfs with status QUEUED or RUNNING ignored");
        }

        let request = ConfirmRequest {
            manifest_path: manifest_path.clone(),
            queued: manifest.queued.len(),
            invalid: manifest.invalid.len(),
            active: manifest.active.len(),
            cancel: self.cancel_handle(),
        };
        let approved = confirm.confirm(&request)?;
        if self.cancel.is_cancelled() {
            let signal = self.cancel.signal().unwrap_or(DEFAULT_CANCEL_SIGNAL);
            tracing::info!(signal, manifest = %manifest_path.display(), "sweep cancelled before queueing");
            return Ok(SweepReport {
                manifest,
                manifest_path,
                outcome: SweepOutcome::Cancelled {
                    signal,
                    tally: SweepTally::default(),
                },
            });
        }
        if !approved {
            tracing::info!(manifest = %manifest_path.display(), "sweep aborted by operator");
            return Ok(SweepReport {
                manifest,
                manifest_path,
                outcome: SweepOutcome::Aborted,
            });
        }

        let manifest_path = self.archive(&manifest, &manifest_path, &plan.script)?;
        self.queue(&plan)?;
        drop(lock);
        tracing::info!(rfs = plan.work.len(), workers = self.request.workers, script_id = %identity, "sweep started");

        let mut pool = PoolState::default();
        if let Err(err) = self.drive_pool(&plan, progress, &mut pool) {
            self.roll_back(plan.work.difference(&pool.rolled_back), &identity);
            return Err(err);
        }
        let outcome = if self.cancel.is_cancelled() {
            self.roll_back(plan.work.difference(&pool.rolled_back), &identity);
            let signal = self.cancel.signal().unwrap_or(DEFAULT_CANCEL_SIGNAL);
            SweepOutcome::Cancelled {
                signal,
                tally: pool.tally,
            }
        } else {
            SweepOutcome::Completed(pool.tally)
        };
        tracing::info!(outcome = outcome.as_str(), "sweep finished");
        Ok(SweepReport {
            manifest,
            manifest_path,
            outcome,
        })
    }

    fn archive(
        &self,
        manifest: &RunManifest,
        manifest_path: &Path,
        script: &ScriptSnapshot,
    ) -> Result<PathBuf> {
        let archived = self
            .layout
            .archive_move(manifest_path, &manifest.file_name())?;
        if let Some(restrict) = &self.request.restrict_to {
            let source = self.layout.resolve(restrict);
            let name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("sweep file has no file name: {}", source.display()))?;
            self.layout
                .archive_copy(&source, &format!("{}.run.{}", manifest.stamp, name))?;
        }
        self.layout
            .archive_bytes(&script.bytes, &format!("{}.script", manifest.stamp))?;
        Ok(archived)
    }

    /// Eager `QUEUED` over the work set. A failure part way through takes
    /// back what was already queued before reporting.
    fn queue(&self, plan: &SweepPlan) -> Result<()> {
        let identity = &plan.script.identity;
        let mut queued = BTreeSet::new();
        for rf in &plan.work {
            let written = self
                .layout
                .run_folder(rf)
                .status_log()
                .append(Action::Queued, identity);
            if let Err(err) = written {
                tracing::warn!(rf = %rf, error = %err, rolled_back = queued.len(), "queueing failed");
                self.roll_back(&queued, identity);
                return Err(err.into());
            }
            queued.insert(rf.clone());
        }
        Ok(())
    }

    /// `KILLED` over `rfs`: queued rfs return to `NEW`, rfs that already
    /// finished or failed keep their outcome.
    fn roll_back<'a>(&self, rfs: impl IntoIterator<Item = &'a String>, identity: &ScriptIdentity) {
        for rf in rfs {
            let log = self.layout.run_folder(rf).status_log();
            if let Err(err) = log.append(Action::Killed, identity) {
                tracing::warn!(rf = %rf, error = %err, "failed to record KILLED");
            }
        }
    }

    fn drive_pool(
        &self,
        plan: &SweepPlan,
        progress: &mut dyn Progress,
        pool: &mut PoolState,
    ) -> Result<()> {
        let slots = self.request.workers.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, done_rx) = mpsc::channel::<WorkerReport>();

        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            handles.push(spawn_worker(
                slot,
                Arc::clone(&job_rx),
                done_tx.clone(),
                self.cancel.clone(),
            )?);
        }
        drop(done_tx);

        let mut pending: VecDeque<Job> = plan
            .work
            .iter()
            .map(|rf| Job {
                layout: self.layout.clone(),
                interpreter: self.request.interpreter.clone(),
                script: self.request.script.clone(),
                rf: rf.clone(),
                queued_as: plan.script.identity.clone(),
            })
            .collect();

        let mut in_flight = 0usize;
        while in_flight < slots && !self.cancel.is_cancelled() {
            match pending.pop_front() {
                Some(job) => {
                    job_tx.send(job)?;
                    in_flight += 1;
                }
                None => break,
            }
        }
        while in_flight > 0 {
            let report = match done_rx.recv() {
                Ok(report) => report,
                Err(_) => {
                    tracing::warn!(in_flight, "every worker exited with rfs still in flight");
                    break;
                }
            };
            in_flight -= 1;
            pool.tally.record(&report.outcome);
            if matches!(report.outcome, RfOutcome::Skipped { .. }) {
                pool.rolled_back.insert(report.rf.clone());
            }
            progress.completed(&report);
            if !self.cancel.is_cancelled() {
                if let Some(job) = pending.pop_front() {
                    job_tx.send(job)?;
                    in_flight += 1;
                }
            }
        }
        drop(job_tx);
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
        if !pending.is_empty() {
            tracing::info!(undispatched = pending.len(), "sweep stopped before dispatching all rfs");
        }
        Ok(())
    }
}

/// What the pool has settled so far, kept by the caller so an aborted pool
/// still reports which rfs a worker already rolled back.
#[derive(Debug, Default)]
struct PoolState {
    tally: SweepTally,
    rolled_back: BTreeSet<String>,
}

fn spawn_worker(
    slot: usize,
    jobs: Arc<Mutex<Receiver<Job>>>,
    done: Sender<WorkerReport>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("sweep-worker-{}", slot))
        .spawn(move || loop {
            let next = match jobs.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => break,
            };
            let job = match next {
                Ok(job) => job,
                Err(_) => break,
            };
            tracing::debug!(slot, rf = %job.rf, "dispatched");
            let report = execute(slot, &job, &cancel);
            if done.send(report).is_err() {
                break;
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{AutoApprove, Decline};
    use std::fs;

    /// Stands in for a signal delivered while the operator is being asked.
    struct SignalAtPrompt;

    impl Confirm for SignalAtPrompt {
        fn confirm(&mut self, request: &ConfirmRequest) -> Result<bool> {
            request.cancel.cancel(2);
            Ok(true)
        }
    }

    /// Approves, then makes rf `b`'s status log unwritable.
    struct BreakStatusLog(ProjectLayout);

    impl Confirm for BreakStatusLog {
        fn confirm(&mut self, _request: &ConfirmRequest) -> Result<bool> {
            fs::create_dir(self.0.run_folder("b").status_log().path())?;
            Ok(true)
        }
    }

    fn project() -> (tempfile::TempDir, SweepRequest) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        fs::create_dir_all(layout.bin_dir()).unwrap();
        fs::write(layout.script_path("ok.sh"), "exit 0\n").unwrap();
        for id in ["a", "b", "c"] {
            layout.run_folder(id).create("{}").unwrap();
        }
        let request = SweepRequest {
            project: dir.path().to_path_buf(),
            interpreter: "sh".to_string(),
            script: "ok.sh".to_string(),
            workers: 2,
            restrict_to: None,
            rerun_failed: false,
        };
        (dir, request)
    }

    #[test]
    fn plan_excludes_invalid_and_active_rfs() {
        let (_dir, request) = project();
        let coordinator = Coordinator::new(request);
        let layout = coordinator.layout().clone();
        let id = read_script(&layout, "ok.sh").unwrap().identity;
        layout.run_folder("b").status_log().append(Action::Queued, &id).unwrap();
        layout.run_folder("c").status_log().append(Action::Finished, &id).unwrap();

        let plan = coordinator.plan().unwrap();
        assert_eq!(plan.work, BTreeSet::from(["a".to_string()]));
        assert!(plan.invalid().contains("c"));
        assert!(plan.active().contains("b"));
    }

    #[test]
    fn declined_sweep_only_writes_manifest() {
        let (dir, request) = project();
        let coordinator = Coordinator::new(request);
        let report = coordinator.run(&mut Decline, &mut NoProgress).unwrap();
        assert_eq!(report.outcome, SweepOutcome::Aborted);
        assert!(report.manifest_path.starts_with(dir.path()));
        assert!(report.manifest_path.exists());
        assert!(!coordinator.layout().history_dir().exists());
        assert!(!coordinator.layout().lock_path().exists());

        let plan = coordinator.plan().unwrap();
        assert_eq!(plan.work.len(), 3);
    }

    #[test]
    fn missing_script_fails_before_any_side_effect() {
        let (dir, mut request) = project();
        request.script = "absent.sh".to_string();
        let err = Coordinator::new(request)
            .run(&mut AutoApprove, &mut NoProgress)
            .expect_err("unreadable script");
        assert!(err.to_string().contains("script unreadable"));
        let runs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".run"))
            .collect();
        assert!(runs.is_empty());
    }

    #[test]
    fn concurrent_coordinator_is_refused_while_lock_held() {
        let (_dir, request) = project();
        let coordinator = Coordinator::new(request);
        let _held = QueueLock::acquire(coordinator.layout()).unwrap();
        let err = coordinator
            .run(&mut AutoApprove, &mut NoProgress)
            .expect_err("locked");
        assert!(err.to_string().contains("operation_in_progress"));
    }

    #[test]
    fn exit_code_follows_signal_convention() {
        assert_eq!(SweepOutcome::Aborted.exit_code(), 0);
        assert_eq!(SweepOutcome::Completed(SweepTally::default()).exit_code(), 0);
        let cancelled = SweepOutcome::Cancelled {
            signal: 2,
            tally: SweepTally::default(),
        };
        assert_eq!(cancelled.exit_code(), 130);
    }

    #[test]
    fn signal_at_prompt_releases_lock_and_queues_nothing() {
        let (_dir, request) = project();
        let coordinator = Coordinator::new(request.clone());
        let report = coordinator.run(&mut SignalAtPrompt, &mut NoProgress).unwrap();
        assert_eq!(
            report.outcome,
            SweepOutcome::Cancelled {
                signal: 2,
                tally: SweepTally::default()
            }
        );
        assert_eq!(report.outcome.exit_code(), 130);
        assert!(!coordinator.layout().lock_path().exists());
        assert!(!coordinator.layout().history_dir().exists());
        assert_eq!(coordinator.plan().unwrap().work.len(), 3);

        let next = Coordinator::new(request)
            .run(&mut AutoApprove, &mut NoProgress)
            .expect("lock must be free for the next sweep");
        assert_ne!(next.manifest.stamp, report.manifest.stamp);
        assert_eq!(
            next.outcome,
            SweepOutcome::Completed(SweepTally {
                finished: 3,
                ..SweepTally::default()
            })
        );
    }

    #[test]
    fn failed_queueing_rolls_back_rfs_already_queued() {
        let (_dir, request) = project();
        let coordinator = Coordinator::new(request);
        let layout = coordinator.layout().clone();
        let err = coordinator
            .run(&mut BreakStatusLog(layout.clone()), &mut NoProgress)
            .expect_err("unwritable status log");
        assert!(err.to_string().contains("status.txt"), "unexpected error: {}", err);

        let id = read_script(&layout, "ok.sh").unwrap().identity;
        for rf in ["a", "c"] {
            assert_eq!(layout.run_folder(rf).status(&id).unwrap(), Status::New, "rf {}", rf);
        }
        let log = fs::read_to_string(layout.run_folder("a").status_log().path()).unwrap();
        assert!(log.contains("QUEUED") && log.contains("KILLED"));
        assert!(!layout.run_folder("c").status_log().path().exists());
        assert!(!layout.lock_path().exists());
    }
}
