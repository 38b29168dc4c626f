//! JSON sidecar load / patch / save.
//!
//! Key order is preserved (serde_json `preserve_order`): existing keys keep
//! their position, new keys are appended, renamed keys stay where they were.

use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error on {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Invalid JSON in {path}: {source}")]
    Json { path: String, source: serde_json::Error },
    #[error("{0} is not a JSON object")]
    NotAnObject(String),
}

pub type Result<T> = std::result::Result<T, SidecarError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Sidecar {
    pub path: PathBuf,
    pub fields: Map<String, Value>,
}

impl Sidecar {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SidecarError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| SidecarError::Json {
            path: path.display().to_string(),
            source,
        })?;
        match value {
            Value::Object(fields) => Ok(Self {
                path: path.to_path_buf(),
                fields,
            }),
            _ => Err(SidecarError::NotAnObject(path.display().to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Set a key. Returns true if the stored value changed.
    pub fn set(&mut self, key: &str, value: Value) -> bool {
        if self.fields.get(key) == Some(&value) {
            return false;
        }
        self.fields.insert(key.to_string(), value);
        true
    }

    /// Remove a key, keeping the order of the others.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    /// Rename a key in place. Returns false if `from` is absent.
    pub fn rename_key(&mut self, from: &str, to: &str) -> bool {
        if !self.fields.contains_key(from) || from == to {
            return false;
        }
        let old = std::mem::take(&mut self.fields);
        for (k, v) in old {
            if k == from {
                self.fields.insert(to.to_string(), v);
            } else if k != to {
                self.fields.insert(k, v);
            }
        }
        true
    }

    /// Write back with 4-space indentation and a trailing newline.
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.fields
            .serialize(&mut ser)
            .map_err(|source| SidecarError::Json {
                path: path.display().to_string(),
                source,
            })?;
        buf.push(b'\n');
        std::fs::write(path, buf).map_err(|source| SidecarError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// A set of key edits applied to one sidecar.
#[derive(Debug, Clone, Default)]
pub struct SidecarPatch {
    pub set: Vec<(String, Value)>,
    pub remove: Vec<String>,
    /// Leave keys that already exist alone.
    pub only_if_missing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Changed,
    Unchanged,
}

impl SidecarPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set.push((key.to_string(), value.into()));
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.remove.push(key.to_string());
        self
    }

    pub fn only_if_missing(mut self) -> Self {
        self.only_if_missing = true;
        self
    }

    pub fn apply(&self, sidecar: &mut Sidecar) -> PatchOutcome {
        let mut changed = false;
        for key in &self.remove {
            changed |= sidecar.remove(key).is_some();
        }
        for (key, value) in &self.set {
            if self.only_if_missing && sidecar.contains(key) {
                continue;
            }
            changed |= sidecar.set(key, value.clone());
        }
        if changed { PatchOutcome::Changed } else { PatchOutcome::Unchanged }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub changed: u64,
    pub unchanged: u64,
    pub errors: u64,
}

/// Apply `patch` to every file. Errors are logged per file and counted.
pub fn patch_files(files: &[PathBuf], patch: &SidecarPatch, dry_run: bool) -> PatchSummary {
    let mut summary = PatchSummary::default();
    for path in files {
        match patch_one(path, patch, dry_run) {
            Ok(PatchOutcome::Changed) => summary.changed += 1,
            Ok(PatchOutcome::Unchanged) => summary.unchanged += 1,
            Err(e) => {
                log::warn!("Error updating {}: {}", path.display(), e);
                summary.errors += 1;
            }
        }
    }
    summary
}

fn patch_one(path: &Path, patch: &SidecarPatch, dry_run: bool) -> Result<PatchOutcome> {
    let mut sidecar = Sidecar::load(path)?;
    let outcome = patch.apply(&mut sidecar);
    match outcome {
        PatchOutcome::Changed if dry_run => {
            log::info!("[dry run] would update {}", path.display());
        }
        PatchOutcome::Changed => {
            sidecar.save()?;
            log::info!("Updated {}", path.display());
        }
        PatchOutcome::Unchanged => {
            log::debug!("Already up to date: {}", path.display());
        }
    }
    Ok(outcome)
}
