//! BIDS curation recipes: sidecar patches, renames, sessions/scans tables.
//!
//! Every recipe walks a BIDS root, takes a `dry_run` flag and reports what it
//! changed. Per-file failures are logged and counted; only an unusable root
//! aborts a recipe.

pub mod rename;
pub mod sessions;
pub mod sidecars;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CurateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sidecar error: {0}")]
    Sidecar(#[from] crate::sidecar::SidecarError),
    #[error("Table error: {0}")]
    Table(#[from] crate::table::TableError),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CurateError>;

/// Outcome counts for one curation recipe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CurateResult {
    pub changed: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl CurateResult {
    pub fn summary(&self, what: &str) -> String {
        format!(
            "{}: {} changed, {} unchanged, {} skipped, {} errors",
            what, self.changed, self.unchanged, self.skipped, self.errors
        )
    }
}

impl From<crate::sidecar::PatchSummary> for CurateResult {
    fn from(s: crate::sidecar::PatchSummary) -> Self {
        Self {
            changed: s.changed,
            unchanged: s.unchanged,
            skipped: 0,
            errors: s.errors,
        }
    }
}
