//! Sidecar recipes: fill in keys the converter left out or got wrong.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde_json::Value;
use walkdir::WalkDir;

use super::{CurateResult, Result};
use crate::entities;
use crate::fsutil;
use crate::sidecar::{self, Sidecar, SidecarPatch};

/// ASL sidecars: replace the misspelled `Background Suppression` key and add
/// the labeling fields ASLPrep requires.
pub fn asl_keys(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::datatype_files(root, "perf", |n| n.ends_with("asl.json"))?;
    let patch = SidecarPatch::new()
        .remove("Background Suppression")
        .set("BackgroundSuppression", true)
        .set("LabelingDuration", 1.5)
        .set("M0Type", "Separate");
    Ok(sidecar::patch_files(&files, &patch, dry_run).into())
}

/// Point each M0 scan's `IntendedFor` at the ASL series with the same run.
pub fn intended_for(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    let perf_dirs: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name() == "perf")
        .map(|e| e.into_path())
        .collect();

    for perf in perf_dirs {
        let mut m0scans: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut asls: BTreeMap<String, PathBuf> = BTreeMap::new();

        for file in fsutil::files_where(&perf, |n| n.contains("run-"))? {
            let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(run) = entities::parse_filename(name).entity("run").map(str::to_string) else {
                continue;
            };
            if name.ends_with("m0scan.json") {
                m0scans.insert(run, file);
            } else if name.ends_with("asl.nii.gz") {
                asls.insert(run, file);
            }
        }

        // perf/ → ses-*/ → sub-*/
        let Some(subject_dir) = perf.parent().and_then(|p| p.parent()) else {
            continue;
        };

        for (run, m0) in &m0scans {
            let Some(asl) = asls.get(run) else {
                log::warn!(
                    "No matching ASL file for {} (run {}) in {}",
                    m0.display(),
                    run,
                    perf.display()
                );
                result.skipped += 1;
                continue;
            };
            let rel = match asl.strip_prefix(subject_dir) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => {
                    result.skipped += 1;
                    continue;
                }
            };
            let patch = SidecarPatch::new().set("IntendedFor", rel.clone());
            let summary = sidecar::patch_files(std::slice::from_ref(m0), &patch, dry_run);
            log::info!("{} IntendedFor → {}", m0.display(), rel);
            result.changed += summary.changed;
            result.unchanged += summary.unchanged;
            result.errors += summary.errors;
        }
    }

    Ok(result)
}

/// Field maps: add `B0FieldIdentifier` (from the filename) plus the
/// acceleration keys the scanner export omitted.
pub fn fmap_keys(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::datatype_files(root, "fmap", |n| n.ends_with(".json"))?;
    let mut result = CurateResult::default();

    for file in files {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let Some(b0) = entities::b0_field_identifier(name) else {
            log::warn!("Could not parse B0FieldIdentifier for {}", name);
            result.skipped += 1;
            continue;
        };
        let patch = SidecarPatch::new()
            .set("ParallelReductionFactorInPlane", 1)
            .set("PartialFourierDirection", "y")
            .set("B0FieldIdentifier", b0);
        let summary = sidecar::patch_files(std::slice::from_ref(&file), &patch, dry_run);
        result.changed += summary.changed;
        result.unchanged += summary.unchanged;
        result.errors += summary.errors;
    }

    Ok(result)
}

/// DWI sidecars: `PartialFourierDirection = "y"`.
pub fn dwi_partial_fourier(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::datatype_files(root, "dwi", |n| n.ends_with("_dwi.json"))?;
    let patch = SidecarPatch::new().set("PartialFourierDirection", "y");
    Ok(sidecar::patch_files(&files, &patch, dry_run).into())
}

/// M0 scans: `RepetitionTimePreparation = 5`.
pub fn m0_repetition_time(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::datatype_files(root, "perf", |n| n.ends_with("m0scan.json"))?;
    let patch = SidecarPatch::new().set("RepetitionTimePreparation", 5);
    Ok(sidecar::patch_files(&files, &patch, dry_run).into())
}

static MEGRE_PHASE: LazyLock<glob::Pattern> =
    LazyLock::new(|| glob::Pattern::new("sub-*_ses-*_echo-*_part-phase_MEGRE.json").unwrap());

/// MEGRE phase sidecars: add `Units = "arbitrary"` where no unit is recorded.
pub fn megre_phase_units(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::datatype_files(root, "anat", |n| MEGRE_PHASE.matches(n))?;
    log::info!(
        "Found {} MEGRE phase sidecar(s). Mode: {}",
        files.len(),
        if dry_run { "DRY-RUN" } else { "APPLY" }
    );
    let patch = SidecarPatch::new().set("Units", "arbitrary").only_if_missing();
    Ok(sidecar::patch_files(&files, &patch, dry_run).into())
}

/// First volume of an ASL series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    Label,
    Control,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Control => "control",
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Label => Self::Control,
            Self::Control => Self::Label,
        }
    }
}

/// `volume_type` column body: `n` rows alternating from `first`.
pub fn aslcontext_body(n: usize, first: VolumeType) -> String {
    let mut out = String::from("volume_type\n");
    let mut current = first;
    for _ in 0..n {
        out.push_str(current.as_str());
        out.push('\n');
        current = current.other();
    }
    out
}

fn num_volumes(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as usize).or_else(|| {
            n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as usize)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Write `<stem>_aslcontext.tsv` next to every ASL sidecar that records `NumVolumes`.
pub fn aslcontext(root: &Path, first: VolumeType, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::datatype_files(root, "perf", |n| n.ends_with("_asl.json"))?;
    let mut result = CurateResult::default();

    for file in files {
        let sidecar = match Sidecar::load(&file) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("{}", e);
                result.errors += 1;
                continue;
            }
        };
        let Some(n) = sidecar.get("NumVolumes").and_then(num_volumes) else {
            log::warn!("'NumVolumes' not found in {}; cannot create aslcontext.tsv", file.display());
            result.skipped += 1;
            continue;
        };

        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let tsv = file.with_file_name(name.replace("_asl.json", "_aslcontext.tsv"));
        if dry_run {
            log::info!("[dry run] would write {} ({} volumes)", tsv.display(), n);
        } else {
            std::fs::write(&tsv, aslcontext_body(n, first))?;
            log::info!("Created {} with {} volumes", tsv.display(), n);
        }
        result.changed += 1;
    }

    Ok(result)
}
