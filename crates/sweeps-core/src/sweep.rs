//! Sweep definitions and their expansion into run folders.
//!
//! A definition maps each variable to `{"sweep_type": ..., "value": ...}`.
//! `constant` variables appear unchanged in every rf, `manual` variables
//! enumerate their values, `linspace` variables take `[start, stop, num]`.
//! The rf set is the cartesian product of the swept variables.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SweepError};
use crate::identity::{canonical_params, rf_identity_for_canonical};
use crate::project::ProjectLayout;

#[derive(Debug, Deserialize)]
struct VariableSpec {
    sweep_type: String,
    value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepVariable {
    Constant(Value),
    Manual(Vec<Value>),
    Linspace { start: f64, stop: f64, num: usize },
}

impl SweepVariable {
    fn values(&self) -> Vec<Value> {
        match self {
            SweepVariable::Constant(v) => vec![v.clone()],
            SweepVariable::Manual(values) => values.clone(),
            SweepVariable::Linspace { start, stop, num } => linspace(*start, *stop, *num)
                .into_iter()
                .map(Value::from)
                .collect(),
        }
    }
}

/// One expanded parameter set: its id and the exact `params.json` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedRf {
    pub id: String,
    pub params: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepDefinition {
    variables: BTreeMap<String, SweepVariable>,
}

impl SweepDefinition {
    /// Reads JSON, or YAML when the extension says so.
    pub fn load(path: &Path) -> Result<SweepDefinition> {
        let raw = fs::read_to_string(path).map_err(|e| SweepError::io(path, e))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let value: Value = if is_yaml {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
            serde_json::to_value(yaml)?
        } else {
            serde_json::from_str(&raw)?
        };
        Self::from_value(path, &value)
    }

    pub fn from_value(source: &Path, value: &Value) -> Result<SweepDefinition> {
        let object = value
            .as_object()
            .ok_or_else(|| SweepError::invalid_sweep(source, "top level must be an object"))?;
        let mut variables = BTreeMap::new();
        for (name, raw) in object {
            let spec: VariableSpec = serde_json::from_value(raw.clone()).map_err(|e| {
                SweepError::invalid_sweep(source, format!("variable {}: {}", name, e))
            })?;
            let variable = match spec.sweep_type.as_str() {
                "constant" => SweepVariable::Constant(spec.value),
                "manual" => match spec.value {
                    Value::Array(values) => SweepVariable::Manual(values),
                    _ => {
                        return Err(SweepError::invalid_sweep(
                            source,
                            format!("variable {}: manual value must be an array", name),
                        ))
                    }
                },
                "linspace" => parse_linspace(source, name, &spec.value)?,
                other => {
                    tracing::warn!(variable = %name, sweep_type = other, "sweep variable ignored");
                    continue;
                }
            };
            variables.insert(name.clone(), variable);
        }
        Ok(SweepDefinition { variables })
    }

    pub fn variables(&self) -> &BTreeMap<String, SweepVariable> {
        &self.variables
    }

    /// Cartesian product of swept variables, merged with the constants.
    pub fn expand(&self) -> Result<Vec<ExpandedRf>> {
        let mut combos: Vec<Map<String, Value>> = vec![Map::new()];
        for (name, variable) in &self.variables {
            let values = variable.values();
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in &values {
                    let mut extended = combo.clone();
                    extended.insert(name.clone(), value.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }
        combos
            .iter()
            .map(|params| {
                let canonical = canonical_params(params)?;
                Ok(ExpandedRf {
                    id: rf_identity_for_canonical(&canonical),
                    params: canonical,
                })
            })
            .collect()
    }

    pub fn rf_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.expand()?.into_iter().map(|rf| rf.id).collect())
    }
}

fn parse_linspace(source: &Path, name: &str, value: &Value) -> Result<SweepVariable> {
    let bad = || {
        SweepError::invalid_sweep(
            source,
            format!("variable {}: linspace value must be [start, stop, num]", name),
        )
    };
    let parts = value.as_array().filter(|a| a.len() == 3).ok_or_else(bad)?;
    let start = parts[0].as_f64().ok_or_else(bad)?;
    let stop = parts[1].as_f64().ok_or_else(bad)?;
    let num = parts[2].as_u64().ok_or_else(bad)? as usize;
    Ok(SweepVariable::Linspace { start, stop, num })
}

/// `num` evenly spaced values over `[start, stop]`, endpoints included.
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| if i == num - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

pub fn read_sweep(path: &Path) -> Result<Vec<ExpandedRf>> {
    SweepDefinition::load(path)?.expand()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepChange {
    /// Folders created or removed.
    pub changed: usize,
    /// Folders that already existed (create) or were already gone (delete).
    pub unchanged: usize,
    pub archived: PathBuf,
}

/// `history/<stamp>.<verb>.<ext>`, with a stamp no earlier archive uses.
fn archive_sweep_file(layout: &ProjectLayout, sweep_file: &Path, verb: &str) -> Result<PathBuf> {
    let ext = sweep_file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("json");
    let stamp = layout.history_stamp()?;
    layout.archive_copy(sweep_file, &format!("{}.{}.{}", stamp, verb, ext))
}

/// Creates every rf the sweep expands to. Existing rfs are left untouched.
pub fn create_rfs(layout: &ProjectLayout, sweep_file: &Path) -> Result<SweepChange> {
    let sweep_file = layout.resolve(sweep_file);
    let mut change = SweepChange {
        changed: 0,
        unchanged: 0,
        archived: PathBuf::new(),
    };
    for rf in read_sweep(&sweep_file)? {
        if layout.run_folder(&rf.id).create(&rf.params)? {
            tracing::debug!(rf = %rf.id, "created run folder");
            change.changed += 1;
        } else {
            change.unchanged += 1;
        }
    }
    change.archived = archive_sweep_file(layout, &sweep_file, "create")?;
    tracing::info!(created = change.changed, existing = change.unchanged, "sweep created");
    Ok(change)
}

/// Removes every rf the sweep expands to, with its logs and artifacts.
pub fn delete_rfs(layout: &ProjectLayout, sweep_file: &Path) -> Result<SweepChange> {
    let sweep_file = layout.resolve(sweep_file);
    let mut change = SweepChange {
        changed: 0,
        unchanged: 0,
        archived: PathBuf::new(),
    };
    for rf in read_sweep(&sweep_file)? {
        if layout.run_folder(&rf.id).remove()? {
            change.changed += 1;
        } else {
            change.unchanged += 1;
        }
    }
    change.archived = archive_sweep_file(layout, &sweep_file, "delete")?;
    tracing::info!(deleted = change.changed, missing = change.unchanged, "sweep deleted");
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> SweepDefinition {
        SweepDefinition::from_value(Path::new("sweep.json"), &value).expect("valid sweep")
    }

    #[test]
    fn linspace_includes_endpoints() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(0.1, 0.3, 3).last(), Some(&0.3));
    }

    #[test]
    fn expansion_is_cartesian_product_with_constants() {
        let sweep = definition(json!({
            "a": {"sweep_type": "manual", "value": [1, 2, 3]},
            "b": {"sweep_type": "linspace", "value": [0, 1, 2]},
            "c": {"sweep_type": "constant", "value": "fixed"},
        }));
        let rfs = sweep.expand().expect("expand");
        assert_eq!(rfs.len(), 6);
        let ids: BTreeSet<_> = rfs.iter().map(|rf| rf.id.clone()).collect();
        assert_eq!(ids.len(), 6);
        for rf in &rfs {
            let params: Value = serde_json::from_str(&rf.params).unwrap();
            assert_eq!(params["c"], "fixed");
            assert_eq!(rf.id, rf_identity_for_canonical(&rf.params));
        }
    }

    #[test]
    fn constants_only_yield_one_rf() {
        let sweep = definition(json!({"x": {"sweep_type": "constant", "value": 3}}));
        let rfs = sweep.expand().unwrap();
        assert_eq!(rfs.len(), 1);
        assert_eq!(rfs[0].params, "{\n    \"x\": 3\n}");
    }

    #[test]
    fn repeated_definitions_collide_to_same_ids() {
        let one = definition(json!({
            "x": {"sweep_type": "manual", "value": [1, 2]},
            "y": {"sweep_type": "constant", "value": true},
        }));
        let two = definition(json!({
            "y": {"sweep_type": "constant", "value": true},
            "x": {"sweep_type": "manual", "value": [2, 1]},
        }));
        assert_eq!(one.rf_ids().unwrap(), two.rf_ids().unwrap());
    }

    #[test]
    fn unknown_types_are_ignored_and_malformed_rejected() {
        let sweep = definition(json!({
            "x": {"sweep_type": "manual", "value": [1]},
            "z": {"sweep_type": "logspace", "value": [1, 2, 3]},
        }));
        assert_eq!(sweep.variables().len(), 1);

        let bad = SweepDefinition::from_value(
            Path::new("bad.json"),
            &json!({"x": {"sweep_type": "linspace", "value": [0, 1]}}),
        );
        assert!(matches!(bad, Err(SweepError::InvalidSweep { .. })));
        let bad = SweepDefinition::from_value(Path::new("bad.json"), &json!([1, 2]));
        assert!(matches!(bad, Err(SweepError::InvalidSweep { .. })));
    }

    #[test]
    fn yaml_and_json_definitions_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_path = dir.path().join("s.json");
        let yaml_path = dir.path().join("s.yaml");
        fs::write(
            &json_path,
            r#"{"x": {"sweep_type": "manual", "value": [1, 2]}, "name": {"sweep_type": "constant", "value": "a"}}"#,
        )
        .unwrap();
        fs::write(
            &yaml_path,
            "x:\n  sweep_type: manual\n  value: [1, 2]\nname:\n  sweep_type: constant\n  value: a\n",
        )
        .unwrap();
        assert_eq!(read_sweep(&json_path).unwrap(), read_sweep(&yaml_path).unwrap());
    }

    #[test]
    fn create_and_delete_round_trip_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        fs::write(
            dir.path().join("sweep.json"),
            r#"{"x": {"sweep_type": "manual", "value": [1, 2, 3]}}"#,
        )
        .unwrap();

        let created = create_rfs(&layout, Path::new("sweep.json")).expect("create");
        assert_eq!(created.changed, 3);
        assert!(created.archived.starts_with(layout.history_dir()));
        assert!(created.archived.to_string_lossy().ends_with(".create.json"));

        let again = create_rfs(&layout, Path::new("sweep.json")).expect("recreate");
        assert_eq!((again.changed, again.unchanged), (0, 3));
        assert_ne!(again.archived, created.archived);
        assert!(created.archived.exists() && again.archived.exists());
        assert_eq!(layout.run_folders().unwrap().len(), 3);

        let deleted = delete_rfs(&layout, Path::new("sweep.json")).expect("delete");
        assert_eq!(deleted.changed, 3);
        assert!(layout.run_folders().unwrap().is_empty());
    }
}
