//! Append-only status events and their replay into a current status.
//!
//! Status is never stored. It is recomputed from `status.txt` every time it
//! is asked for, considering only events written under the script identity
//! being queried.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SweepError};
use crate::identity::ScriptIdentity;
use crate::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Queued,
    Started,
    Finished,
    Failed,
    Killed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Queued => "QUEUED",
            Action::Started => "STARTED",
            Action::Finished => "FINISHED",
            Action::Failed => "FAILED",
            Action::Killed => "KILLED",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Action::Queued),
            "STARTED" => Ok(Action::Started),
            "FINISHED" => Ok(Action::Finished),
            "FAILED" => Ok(Action::Failed),
            "KILLED" => Ok(Action::Killed),
            other => Err(format!("unknown status action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    New,
    Queued,
    Running,
    Finished,
    Failed,
    Invalid,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Running,
        Status::Queued,
        Status::Finished,
        Status::Failed,
        Status::New,
        Status::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Finished => "FINISHED",
            Status::Failed => "FAILED",
            Status::Invalid => "INVALID",
        }
    }

    /// One transition of the replay. `Invalid` absorbs everything after it.
    pub fn apply(self, action: Action) -> Status {
        use Action as A;
        use Status as S;
        match (self, action) {
            (S::New, A::Queued) => S::Queued,
            (S::Queued, A::Started) => S::Running,
            (S::Queued, A::Killed) => S::New,
            (S::Running, A::Finished) => S::Finished,
            (S::Running, A::Failed) => S::Failed,
            (S::Finished | S::Failed, A::Queued) => S::Queued,
            (S::Finished, A::Killed) => S::Finished,
            (S::Failed, A::Killed) => S::Failed,
            _ => S::Invalid,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub action: Action,
    pub timestamp: String,
    pub script_id: String,
}

impl StatusEvent {
    pub fn now(action: Action, script: &ScriptIdentity) -> Self {
        Self {
            action,
            timestamp: timestamp(),
            script_id: script.to_string(),
        }
    }

    /// `ACTION | TIMESTAMP | SCRIPT_ID`, action right-aligned for readability.
    pub fn to_line(&self) -> String {
        format!(
            "{:>8} | {} | {}",
            self.action.as_str(),
            self.timestamp,
            self.script_id
        )
    }

    pub fn parse_line(line: &str) -> Option<StatusEvent> {
        let mut fields = line.split('|').map(str::trim);
        let action = fields.next()?.parse().ok()?;
        let timestamp = fields.next()?.to_string();
        let script_id = fields.next()?.to_string();
        if fields.next().is_some() || script_id.is_empty() {
            return None;
        }
        Some(StatusEvent {
            action,
            timestamp,
            script_id,
        })
    }
}

/// Replays raw log bytes as a fold over their lines. A line that is not
/// UTF-8 or cannot be parsed counts as corruption unless its third field
/// names some other script, in which case it is skipped like any foreign
/// event.
pub fn replay_log(bytes: &[u8], script: &ScriptIdentity) -> Status {
    bytes
        .split(|b| *b == b'\n')
        .fold(Status::New, |status, raw| match classify_line(raw, script) {
            LogLine::Own(action) => status.apply(action),
            LogLine::Skipped => status,
            LogLine::Malformed => Status::Invalid,
        })
}

enum LogLine {
    Own(Action),
    Skipped,
    Malformed,
}

fn classify_line(raw: &[u8], script: &ScriptIdentity) -> LogLine {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(_) => {
            let lossy = String::from_utf8_lossy(raw);
            return if names_other_script(&lossy, script) {
                LogLine::Skipped
            } else {
                LogLine::Malformed
            };
        }
    };
    if line.trim().is_empty() {
        return LogLine::Skipped;
    }
    match StatusEvent::parse_line(line) {
        Some(event) if script.matches(&event.script_id) => LogLine::Own(event.action),
        Some(_) => LogLine::Skipped,
        None if names_other_script(line, script) => LogLine::Skipped,
        None => LogLine::Malformed,
    }
}

fn names_other_script(line: &str, script: &ScriptIdentity) -> bool {
    line.split('|')
        .nth(2)
        .map(str::trim)
        .map(|id| !id.is_empty() && id.contains('@') && !script.matches(id))
        .unwrap_or(false)
}

/// Handle on one rf's `status.txt`.
#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing log replays as `NEW`. Unreadable content is absorbed by the
    /// replay; only I/O failures surface as errors.
    pub fn status(&self, script: &ScriptIdentity) -> Result<Status> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(replay_log(&bytes, script)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Status::New),
            Err(e) => Err(SweepError::io(&self.path, e)),
        }
    }

    pub fn open_writer(&self) -> Result<StatusWriter> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SweepError::io(&self.path, e))?;
        Ok(StatusWriter {
            path: self.path.clone(),
            file,
        })
    }

    /// Opens, appends one event, closes.
    pub fn append(&self, action: Action, script: &ScriptIdentity) -> Result<StatusEvent> {
        self.open_writer()?.append(action, script)
    }
}

/// An open append handle, held by a worker for the length of one execution.
#[derive(Debug)]
pub struct StatusWriter {
    path: PathBuf,
    file: File,
}

impl StatusWriter {
    pub fn append(&mut self, action: Action, script: &ScriptIdentity) -> Result<StatusEvent> {
        let event = StatusEvent::now(action, script);
        // One write per line keeps concurrent appenders from interleaving.
        let line = format!("{}\n", event.to_line());
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| SweepError::io(&self.path, e))?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> ScriptIdentity {
        ScriptIdentity::from_bytes("sim.py", b"print('hello')")
    }

    fn log_text(actions: &[Action], script: &ScriptIdentity) -> String {
        actions
            .iter()
            .map(|a| format!("{}\n", StatusEvent::now(*a, script).to_line()))
            .collect()
    }

    fn run(actions: &[Action]) -> Status {
        let s = script();
        replay_log(log_text(actions, &s).as_bytes(), &s)
    }

    #[test]
    fn empty_and_foreign_logs_are_new() {
        let s = script();
        assert_eq!(replay_log(b"", &s), Status::New);
        let other = ScriptIdentity::from_bytes("sim.py", b"print('edited')");
        let foreign = log_text(&[Action::Queued, Action::Started, Action::Finished], &other);
        assert_eq!(replay_log(foreign.as_bytes(), &s), Status::New);
        assert_eq!(replay_log(foreign.as_bytes(), &other), Status::Finished);
    }

    #[test]
    fn valid_sequences_reach_expected_state() {
        use Action::*;
        assert_eq!(run(&[Queued]), Status::Queued);
        assert_eq!(run(&[Queued, Started]), Status::Running);
        assert_eq!(run(&[Queued, Started, Finished]), Status::Finished);
        assert_eq!(run(&[Queued, Started, Failed]), Status::Failed);
        assert_eq!(
            run(&[Queued, Started, Failed, Queued, Started, Finished]),
            Status::Finished
        );
        assert_eq!(run(&[Queued, Started, Finished, Queued]), Status::Queued);
    }

    #[test]
    fn killed_rolls_back_queued_and_is_noop_on_outcomes() {
        use Action::*;
        assert_eq!(run(&[Queued, Killed]), Status::New);
        assert_eq!(run(&[Queued, Started, Finished, Killed]), Status::Finished);
        assert_eq!(run(&[Queued, Started, Failed, Killed]), Status::Failed);
        assert_eq!(run(&[Queued, Killed, Queued, Started]), Status::Running);
    }

    #[test]
    fn illegal_transitions_are_invalid_and_sticky() {
        use Action::*;
        assert_eq!(run(&[Started]), Status::Invalid);
        assert_eq!(run(&[Killed]), Status::Invalid);
        assert_eq!(run(&[Queued, Queued]), Status::Invalid);
        assert_eq!(run(&[Queued, Started, Killed]), Status::Invalid);
        assert_eq!(run(&[Queued, Started, Started]), Status::Invalid);
        assert_eq!(run(&[Queued, Started, Finished, Finished]), Status::Invalid);
        assert_eq!(
            run(&[Queued, Queued, Killed, Queued, Started, Finished]),
            Status::Invalid
        );
    }

    #[test]
    fn transition_table_is_exhaustive() {
        use Action::*;
        let table = [
            (Status::New, [Status::Queued, Status::Invalid, Status::Invalid, Status::Invalid, Status::Invalid]),
            (Status::Queued, [Status::Invalid, Status::Running, Status::Invalid, Status::Invalid, Status::New]),
            (Status::Running, [Status::Invalid, Status::Invalid, Status::Finished, Status::Failed, Status::Invalid]),
            (Status::Finished, [Status::Queued, Status::Invalid, Status::Invalid, Status::Invalid, Status::Finished]),
            (Status::Failed, [Status::Queued, Status::Invalid, Status::Invalid, Status::Invalid, Status::Failed]),
            (Status::Invalid, [Status::Invalid; 5]),
        ];
        for (from, expected) in table {
            for (action, to) in [Queued, Started, Finished, Failed, Killed].iter().zip(expected) {
                assert_eq!(from.apply(*action), to, "{} x {}", from, action);
            }
        }
    }

    #[test]
    fn line_format_round_trips() {
        let s = script();
        let event = StatusEvent::now(Action::Queued, &s);
        let line = event.to_line();
        assert!(line.starts_with("  QUEUED | "));
        assert!(line.ends_with(&format!(" | {}", s)));
        assert_eq!(StatusEvent::parse_line(&line), Some(event));
        assert_eq!(StatusEvent::parse_line("DONE | t | x@y"), None);
        assert_eq!(StatusEvent::parse_line("QUEUED | t"), None);
        assert_eq!(StatusEvent::parse_line("QUEUED | t | x@y | extra"), None);
    }

    #[test]
    fn replay_log_handles_corruption() {
        let s = script();
        let other = ScriptIdentity::from_bytes("sim.py", b"older");
        let text = format!(
            "  QUEUED | t1 | {s}\n\n garbage | t2 | {other}\n STARTED | t3 | {s}\n"
        );
        assert_eq!(replay_log(text.as_bytes(), &s), Status::Running);

        let corrupt = format!("  QUEUED | t1 | {s}\nnot an event\n");
        assert_eq!(replay_log(corrupt.as_bytes(), &s), Status::Invalid);

        let own_garbage = format!("  QUEUED | t1 | {s}\n  BOGUS | t2 | {s}\n");
        assert_eq!(replay_log(own_garbage.as_bytes(), &s), Status::Invalid);
    }

    #[test]
    fn non_utf8_lines_are_corruption_not_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = StatusLog::new(dir.path().join("status.txt"));
        let s = script();
        let mut bytes = format!("  QUEUED | t1 | {s}\n").into_bytes();
        bytes.extend_from_slice(b"\xff\xfe garbage\n");
        fs::write(log.path(), &bytes).unwrap();
        assert_eq!(log.status(&s).unwrap(), Status::Invalid);

        let other = ScriptIdentity::from_bytes("sim.py", b"older");
        let mut foreign = format!("  QUEUED | t1 | {s}\n").into_bytes();
        foreign.push(0xff);
        foreign.extend_from_slice(format!(" | t2 | {other}\n").as_bytes());
        assert_eq!(replay_log(&foreign, &s), Status::Queued);
    }

    #[test]
    fn status_log_appends_and_replays_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = StatusLog::new(dir.path().join("status.txt"));
        let s = script();
        assert_eq!(log.status(&s).unwrap(), Status::New);

        let written = log.append(Action::Queued, &s).unwrap();
        assert_eq!(log.status(&s).unwrap(), Status::Queued);
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, format!("{}\n", written.to_line()));

        let mut writer = log.open_writer().unwrap();
        writer.append(Action::Started, &s).unwrap();
        writer.append(Action::Finished, &s).unwrap();
        drop(writer);
        log.append(Action::Killed, &s).unwrap();
        assert_eq!(log.status(&s).unwrap(), Status::Finished);
        assert_eq!(fs::read_to_string(log.path()).unwrap().lines().count(), 4);
    }
}
