//! Content-addressed identities for scripts and parameter sets.
//!
//! A script is identified by its logical name plus the SHA-256 of the bytes
//! currently on disk; nothing here caches, so an edited script yields a new
//! identity on the next call. A run folder is identified by a truncated hash
//! of its canonical `params.json` serialization.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;

use crate::error::{Result, SweepError};
use crate::project::ProjectLayout;
use crate::sha256_bytes;

/// Hex characters kept from the parameter hash.
pub const RF_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptIdentity {
    name: String,
    hash: String,
}

impl ScriptIdentity {
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            hash: sha256_bytes(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// True when a serialized `name@hash` refers to this identity.
    pub fn matches(&self, script_id: &str) -> bool {
        match script_id.rsplit_once('@') {
            Some((name, hash)) => name == self.name && hash == self.hash,
            None => false,
        }
    }
}

impl fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.hash)
    }
}

/// The exact bytes that were hashed, kept together with their identity so a
/// history snapshot is byte-for-byte what the sweep was queued under.
#[derive(Debug, Clone)]
pub struct ScriptSnapshot {
    pub identity: ScriptIdentity,
    pub bytes: Vec<u8>,
}

pub fn read_script(layout: &ProjectLayout, script: &str) -> Result<ScriptSnapshot> {
    let path = layout.script_path(script);
    let bytes = fs::read(&path).map_err(|source| SweepError::ScriptUnreadable {
        path: path.clone(),
        source,
    })?;
    Ok(ScriptSnapshot {
        identity: ScriptIdentity::from_bytes(script, &bytes),
        bytes,
    })
}

pub fn script_identity(layout: &ProjectLayout, script: &str) -> Result<ScriptIdentity> {
    read_script(layout, script).map(|snapshot| snapshot.identity)
}

fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted_value(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

/// Key-sorted, 4-space indented JSON. This is both the `params.json` body
/// and the preimage of the run folder id.
pub fn canonical_params(params: &Map<String, Value>) -> Result<String> {
    let value = sorted_value(&Value::Object(params.clone()));
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn rf_identity_for_canonical(canonical: &str) -> String {
    let mut digest = sha256_bytes(canonical.as_bytes());
    digest.truncate(RF_ID_LEN);
    digest
}

pub fn rf_identity(params: &Map<String, Value>) -> Result<String> {
    Ok(rf_identity_for_canonical(&canonical_params(params)?))
}
