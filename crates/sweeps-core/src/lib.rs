use chrono::Local;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod error;
pub mod identity;
pub mod project;
pub mod status;
pub mod sweep;

pub use error::{Result, SweepError};
pub use identity::{
    canonical_params, read_script, rf_identity, rf_identity_for_canonical, script_identity,
    ScriptIdentity, ScriptSnapshot, RF_ID_LEN,
};
pub use project::{collect_rf_status, ProjectLayout, QueueLock, RunFolder, StatusTable};
pub use status::{replay_log, Action, Status, StatusEvent, StatusLog, StatusWriter};
pub use sweep::{create_rfs, delete_rfs, linspace, read_sweep, ExpandedRf, SweepChange, SweepDefinition};

const BANNER_WIDTH: usize = 80;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| SweepError::io(path, e))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Publishes `bytes` at `path` without ever replacing an existing file.
/// The content is staged in a hidden sibling and hard-linked into place, so
/// `path` either does not exist or is complete.
pub fn write_new_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("staged");
    let staged = parent.join(format!(".{}.{}.partial", name, std::process::id()));
    let written = fs::File::create(&staged)
        .and_then(|mut file| file.write_all(bytes).and_then(|_| file.sync_all()))
        .map_err(|e| SweepError::io(&staged, e));
    let published = written.and_then(|_| {
        fs::hard_link(&staged, path).map_err(|e| SweepError::io(path, e))
    });
    let _ = fs::remove_file(&staged);
    published
}

/// Sortable local-time stamp used in status events, banners and history names.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Centres `message` in an 80-column rule of dashes, after `prefix`.
pub fn banner(message: &str, prefix: &str) -> String {
    let used = prefix.chars().count() + message.chars().count();
    let spaces = BANNER_WIDTH.saturating_sub(used);
    let left = spaces / 2;
    format!(
        "{}{}{}{}",
        prefix,
        "-".repeat(left),
        message,
        "-".repeat(spaces - left)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_centres_message_in_eighty_columns() {
        let line = banner("LOG FILE OPENED", "");
        assert_eq!(line.len(), 80);
        assert!(line.starts_with("------"));
        assert!(line.contains("LOG FILE OPENED"));

        let prefixed = banner("QUEUED", "## ");
        assert_eq!(prefixed.len(), 80);
        assert!(prefixed.starts_with("## ---"));
    }

    #[test]
    fn banner_never_truncates_long_messages() {
        let long = "x".repeat(100);
        assert_eq!(banner(&long, "# "), format!("# {}", long));
    }

    #[test]
    fn sha256_bytes_is_lowercase_hex() {
        let digest = sha256_bytes(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn write_new_atomic_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("file.txt");
        write_new_atomic(&path, b"one").expect("first write");
        let err = write_new_atomic(&path, b"two").expect_err("second write must fail");
        assert!(matches!(
            err,
            SweepError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists
        ));
        assert_eq!(fs::read(&path).expect("read"), b"one");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn timestamp_is_sortable_format() {
        let ts = timestamp();
        assert_eq!(ts.len(), "2024-01-01_10-00-00".len());
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "_");
    }
}
