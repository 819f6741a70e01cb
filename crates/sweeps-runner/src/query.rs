use anyhow::Result;
use std::path::Path;

use sweeps_core::{collect_rf_status, script_identity, ProjectLayout, ScriptIdentity, StatusTable};

/// Current status histogram of every rf under `script`.
pub fn query_status(project: &Path, script: &str) -> Result<(ScriptIdentity, StatusTable)> {
    let layout = ProjectLayout::new(project);
    let identity = script_identity(&layout, script)?;
    let table = collect_rf_status(&layout, &identity)?;
    Ok((identity, table))
}

pub fn render_histogram(identity: &ScriptIdentity, table: &StatusTable) -> String {
    let mut out = format!("SWEEP SUMMARY: {}\n", identity);
    for (status, rfs) in table.iter() {
        let count = if rfs.is_empty() {
            "----".to_string()
        } else {
            rfs.len().to_string()
        };
        out.push_str(&format!("{:>13}: {:>4}\n", status.as_str(), count));
    }
    out
}
