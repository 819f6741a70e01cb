use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SweepError};
use crate::identity::ScriptIdentity;
use crate::status::{Status, StatusLog};
use crate::{ensure_dir, timestamp, write_new_atomic};

pub const PARAMS_FILE: &str = "params.json";
pub const STATUS_FILE: &str = "status.txt";
pub const RUN_LOG_FILE: &str = "log.txt";
const LOCK_FILE: &str = ".sweeps.lock";

/// Paths of one sweep project: scripts under `bin/`, run folders under
/// `rfs/`, audit copies under `history/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn script_path(&self, script: &str) -> PathBuf {
        self.bin_dir().join(script)
    }

    pub fn rfs_dir(&self) -> PathBuf {
        self.root.join("rfs")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Paths given relative to the project resolve against its root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    pub fn run_folder(&self, id: &str) -> RunFolder {
        RunFolder {
            id: id.to_string(),
            dir: self.rfs_dir().join(id),
        }
    }

    /// Every directory directly under `rfs/`, sorted by id. A project
    /// without `rfs/` has no run folders.
    pub fn run_folders(&self) -> Result<Vec<RunFolder>> {
        let rfs_dir = self.rfs_dir();
        if !rfs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&rfs_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&rfs_dir).to_path_buf();
                SweepError::io(&path, e.into())
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str() {
                out.push(self.run_folder(id));
            }
        }
        Ok(out)
    }

    /// Current timestamp, suffixed `-1`, `-2`, ... until no file in the
    /// project root or `history/` is named after it.
    pub fn history_stamp(&self) -> Result<String> {
        self.unique_stamp(&timestamp())
    }

    pub fn unique_stamp(&self, base: &str) -> Result<String> {
        let mut taken = BTreeSet::new();
        for dir in [self.root.clone(), self.history_dir()] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(SweepError::io(&dir, e)),
            };
            for entry in entries.flatten() {
                if let Some((stamp, _)) = entry.file_name().to_str().and_then(|n| n.split_once('.')) {
                    taken.insert(stamp.to_string());
                }
            }
        }
        let mut stamp = base.to_string();
        let mut n = 1;
        while taken.contains(&stamp) {
            stamp = format!("{}-{}", base, n);
            n += 1;
        }
        Ok(stamp)
    }

    /// Copies `src` into `history/` as `name`. Never replaces an archive.
    pub fn archive_copy(&self, src: &Path, name: &str) -> Result<PathBuf> {
        let bytes = fs::read(src).map_err(|e| SweepError::io(src, e))?;
        self.archive_bytes(&bytes, name)
    }

    /// Moves `src` into `history/` as `name`. Never replaces an archive.
    pub fn archive_move(&self, src: &Path, name: &str) -> Result<PathBuf> {
        let history = self.history_dir();
        ensure_dir(&history)?;
        let dest = history.join(name);
        fs::hard_link(src, &dest).map_err(|e| SweepError::io(&dest, e))?;
        fs::remove_file(src).map_err(|e| SweepError::io(src, e))?;
        Ok(dest)
    }

    pub fn archive_bytes(&self, bytes: &[u8], name: &str) -> Result<PathBuf> {
        let dest = self.history_dir().join(name);
        write_new_atomic(&dest, bytes)?;
        Ok(dest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFolder {
    id: String,
    dir: PathBuf,
}

impl RunFolder {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params_path(&self) -> PathBuf {
        self.dir.join(PARAMS_FILE)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.dir.join(RUN_LOG_FILE)
    }

    pub fn status_log(&self) -> StatusLog {
        StatusLog::new(self.dir.join(STATUS_FILE))
    }

    pub fn status(&self, script: &ScriptIdentity) -> Result<Status> {
        self.status_log().status(script)
    }

    /// Creates the folder with its `params.json` unless it already exists.
    /// An existing rf is never rewritten. Returns whether it was created.
    pub fn create(&self, canonical_params: &str) -> Result<bool> {
        match fs::create_dir(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                ensure_dir(&self.dir)?;
            }
            Err(e) => return Err(SweepError::io(&self.dir, e)),
        }
        let path = self.params_path();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| SweepError::io(&path, e))?;
        file.write_all(canonical_params.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| SweepError::io(&path, e))?;
        Ok(true)
    }

    pub fn remove(&self) -> Result<bool> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SweepError::io(&self.dir, e)),
        }
    }
}

/// rf ids grouped by their current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTable {
    classes: BTreeMap<Status, BTreeSet<String>>,
}

impl Default for StatusTable {
    fn default() -> Self {
        Self {
            classes: Status::ALL
                .iter()
                .map(|status| (*status, BTreeSet::new()))
                .collect(),
        }
    }
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, status: Status, rf: impl Into<String>) {
        self.classes.entry(status).or_default().insert(rf.into());
    }

    pub fn get(&self, status: Status) -> &BTreeSet<String> {
        &self.classes[&status]
    }

    pub fn count(&self, status: Status) -> usize {
        self.get(status).len()
    }

    pub fn total(&self) -> usize {
        self.classes.values().map(BTreeSet::len).sum()
    }

    /// Keeps only rfs in `allowed`, across every class.
    pub fn restrict_to(&mut self, allowed: &BTreeSet<String>) {
        for rfs in self.classes.values_mut() {
            rfs.retain(|rf| allowed.contains(rf));
        }
    }

    /// Rows in display order: RUNNING, QUEUED, FINISHED, FAILED, NEW, INVALID.
    pub fn iter(&self) -> impl Iterator<Item = (Status, &BTreeSet<String>)> {
        Status::ALL.iter().map(move |status| (*status, self.get(*status)))
    }
}

/// Replays the status log of every rf in the project under `script`.
pub fn collect_rf_status(layout: &ProjectLayout, script: &ScriptIdentity) -> Result<StatusTable> {
    let mut table = StatusTable::new();
    for rf in layout.run_folders()? {
        let status = rf.status(script)?;
        tracing::debug!(rf = rf.id(), %status, "replayed status log");
        table.insert(status, rf.id());
    }
    Ok(table)
}

/// Who holds `.sweeps.lock`. Written whole, so a lock file is never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: String,
}

impl LockHolder {
    fn is_alive(&self) -> bool {
        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }
}

/// Exclusive project lock, held from status collection until the eager
/// `QUEUED` writes are on disk. Removed on drop. A lock left behind by a
/// process that no longer exists is reclaimed.
#[derive(Debug)]
pub struct QueueLock {
    path: PathBuf,
}

impl QueueLock {
    pub fn acquire(layout: &ProjectLayout) -> Result<QueueLock> {
        let path = layout.lock_path();
        ensure_dir(layout.root())?;
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: timestamp(),
        };
        let payload = serde_json::to_vec(&holder)?;
        match write_new_atomic(&path, &payload) {
            Ok(()) => return Ok(QueueLock { path }),
            Err(e) if !already_exists(&e) => return Err(e),
            Err(_) => {}
        }
        if !reclaim_if_stale(&path)? {
            return Err(SweepError::Locked(path));
        }
        match write_new_atomic(&path, &payload) {
            Ok(()) => Ok(QueueLock { path }),
            Err(e) if already_exists(&e) => Err(SweepError::Locked(path)),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn already_exists(err: &SweepError) -> bool {
    matches!(err, SweepError::Io { source, .. } if source.kind() == ErrorKind::AlreadyExists)
}

/// Removes the lock when its recorded holder is gone. An unreadable holder
/// is treated as alive.
fn reclaim_if_stale(path: &Path) -> Result<bool> {
    let text = match fs::read(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(SweepError::io(path, e)),
    };
    let holder: LockHolder = match serde_json::from_slice(&text) {
        Ok(holder) => holder,
        Err(err) => {
            tracing::warn!(lock = %path.display(), error = %err, "lock holder unreadable");
            return Ok(false);
        }
    };
    if holder.is_alive() {
        return Ok(false);
    }
    tracing::warn!(
        lock = %path.display(),
        pid = holder.pid,
        acquired_at = %holder.acquired_at,
        "reclaiming lock of exited coordinator"
    );
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(SweepError::io(path, e)),
    }
}
