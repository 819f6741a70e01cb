use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use sweeps_core::{banner, ProjectLayout};

/// Snapshot of what a sweep is about to do, written before approval and
/// archived afterwards. Never read back by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunManifest {
    /// Unique name of this sweep's files: `<stamp>.run`, `<stamp>.script`.
    pub stamp: String,
    pub timestamp: String,
    pub script_id: String,
    pub rerun_failed: bool,
    pub restrict_to: Option<String>,
    pub queued: BTreeSet<String>,
    pub invalid: BTreeSet<String>,
    pub active: BTreeSet<String>,
}

impl RunManifest {
    pub fn file_name(&self) -> String {
        format!("{}.run", self.stamp)
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("# RUN FILE FOR SWEEP GENERATED AT {}", self.timestamp),
            format!("# script: {}", self.script_id),
            format!("# rerun_failed: {}", self.rerun_failed),
            format!("# rfs: {}", self.restrict_to.as_deref().unwrap_or("All")),
            banner("REQUESTED RFs QUEUED TO RUN", "# "),
        ];
        lines.extend(self.queued.iter().cloned());
        lines.push(banner("REQUESTED RFs WITH INVALID STATUS", "## "));
        lines.extend(self.invalid.iter().map(|rf| format!("## {}", rf)));
        lines.push(banner("REQUESTED RFs QUEUED OR RUNNING", "### "));
        lines.extend(self.active.iter().map(|rf| format!("### {}", rf)));
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    /// Written to the project root; moved to history once approved. An
    /// existing manifest is never reopened.
    pub fn write(&self, layout: &ProjectLayout) -> Result<PathBuf> {
        let path = layout.root().join(self.file_name());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("run file {} already exists", path.display()))?;
        file.write_all(self.render().as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn render_lists_each_partition_under_its_banner() {
        let manifest = RunManifest {
            stamp: "2024-01-01_10-00-00".to_string(),
            timestamp: "2024-01-01_10-00-00".to_string(),
            script_id: "sim.py@abc".to_string(),
            rerun_failed: true,
            restrict_to: Some("sub.json".to_string()),
            queued: set(&["b", "a"]),
            invalid: set(&["bad"]),
            active: set(&["busy"]),
        };
        let text = manifest.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# RUN FILE FOR SWEEP GENERATED AT 2024-01-01_10-00-00");
        assert_eq!(lines[1], "# script: sim.py@abc");
        assert_eq!(lines[2], "# rerun_failed: true");
        assert_eq!(lines[3], "# rfs: sub.json");
        assert!(lines[4].starts_with("# ---") && lines[4].contains("QUEUED TO RUN"));
        assert_eq!(&lines[5..7], &["a", "b"]);
        assert!(lines[7].starts_with("## ---"));
        assert_eq!(lines[8], "## bad");
        assert!(lines[9].starts_with("### ---"));
        assert_eq!(lines[10], "### busy");
        assert_eq!(lines.len(), 11);
        assert_eq!(manifest.file_name(), "2024-01-01_10-00-00.run");
    }

    #[test]
    fn write_places_manifest_in_project_root_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        let manifest = RunManifest {
            stamp: "2024-01-01_10-00-00-1".to_string(),
            timestamp: "2024-01-01_10-00-00".to_string(),
            script_id: "sim.py@abc".to_string(),
            rerun_failed: false,
            restrict_to: None,
            queued: set(&["a"]),
            invalid: BTreeSet::new(),
            active: BTreeSet::new(),
        };
        let path = manifest.write(&layout).expect("write");
        assert_eq!(path, dir.path().join("2024-01-01_10-00-00-1.run"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# rfs: All"));
        assert!(text.contains("GENERATED AT 2024-01-01_10-00-00\n"));

        assert!(manifest.write(&layout).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }
}
