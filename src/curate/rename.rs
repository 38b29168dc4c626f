//! File renames and moves that CuBIDS could not do for us.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use walkdir::WalkDir;

use super::{CurateError, CurateResult, Result};
use crate::fsutil;
use crate::sidecar::Sidecar;

static MISORDERED_ANAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(sub-\d+_ses-\d+)_run-(\d+)_rec-norm_(T[12]w)\.(nii\.gz|json)$").unwrap()
});

static VARIANT_OBLIQUITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"acq-VARIANTObliquity_([^_]+)_").unwrap());

enum Move {
    Done,
    DestinationExists,
}

/// Rename `src` to `dst` unless `dst` already exists.
fn move_file(src: &Path, dst: &Path, dry_run: bool) -> Result<Move> {
    if dst.exists() {
        log::warn!("Destination exists, skipping: {}", dst.display());
        return Ok(Move::DestinationExists);
    }
    if dry_run {
        log::info!("[dry run] would rename {} -> {}", src.display(), dst.display());
        return Ok(Move::Done);
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(src, dst)?;
    log::info!("Renamed {} -> {}", src.display(), dst.display());
    Ok(Move::Done)
}

fn record(result: &mut CurateResult, outcome: Result<Move>, src: &Path) {
    match outcome {
        Ok(Move::Done) => result.changed += 1,
        Ok(Move::DestinationExists) => result.skipped += 1,
        Err(e) => {
            log::warn!("Failed to rename {}: {}", src.display(), e);
            result.errors += 1;
        }
    }
}

/// `sub-1_ses-1_run-01_rec-norm_T1w.json` → `sub-1_ses-1_rec-norm_run-01_T1w.json`.
pub fn misordered_anat_name(name: &str) -> Option<String> {
    let caps = MISORDERED_ANAT.captures(name)?;
    Some(format!(
        "{}_rec-norm_run-{}_{}.{}",
        &caps[1], &caps[2], &caps[3], &caps[4]
    ))
}

pub fn rename_misordered_anat(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    let hits: Vec<(PathBuf, String)> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let new_name = misordered_anat_name(&e.file_name().to_string_lossy())?;
            Some((e.into_path(), new_name))
        })
        .collect();

    for (path, new_name) in hits {
        let dst = path.with_file_name(&new_name);
        let outcome = move_file(&path, &dst, dry_run);
        record(&mut result, outcome, &path);
    }

    Ok(result)
}

/// Parse a subject/session list: one `sub-X ses-Y` pair per line, separated
/// by whitespace, commas or tabs. Blank lines and `#` comments are ignored.
pub fn parse_subject_sessions(text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .collect();
        match parts.as_slice() {
            [sub, ses] => pairs.push((sub.to_string(), ses.to_string())),
            _ => {
                return Err(CurateError::Invalid(format!(
                    "line {}: expected '<sub> <ses>', got {:?}",
                    lineno + 1,
                    raw
                )));
            }
        }
    }
    Ok(pairs)
}

/// For each listed subject/session, rename `fmap/*.json` files whose name
/// contains `from` by substituting `to`.
pub fn rename_fmap_variants(
    root: &Path,
    pairs: &[(String, String)],
    from: &str,
    to: &str,
    dry_run: bool,
) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    if from.is_empty() {
        return Err(CurateError::Invalid("empty --from pattern".to_string()));
    }
    let mut result = CurateResult::default();

    for (sub, ses) in pairs {
        let fmap = root.join(sub).join(ses).join("fmap");
        if !fmap.is_dir() {
            log::warn!("Skipping {}, does not exist", fmap.display());
            result.skipped += 1;
            continue;
        }
        for path in fsutil::files_where(&fmap, |n| n.ends_with(".json") && n.contains(from))? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let dst = path.with_file_name(name.replace(from, to));
            let outcome = move_file(&path, &dst, dry_run);
            record(&mut result, outcome, &path);
        }
    }

    Ok(result)
}

/// `acq-VARIANTObliquity_dwi_dir-AP` → `acq-dwiVARIANTObliquity_dir-AP`.
pub fn variant_obliquity_name(name: &str) -> Option<String> {
    let caps = VARIANT_OBLIQUITY.captures(name)?;
    let modality = &caps[1];
    Some(name.replace(
        &format!("VARIANTObliquity_{modality}_"),
        &format!("{modality}VARIANTObliquity_"),
    ))
}

pub fn fix_variant_obliquity(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    for fmap in fsutil::datatype_dirs(root, "fmap")? {
        for path in fsutil::files_where(&fmap, |n| n.contains("VARIANTObliquity"))? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(new_name) = variant_obliquity_name(name) else {
                continue;
            };
            let dst = path.with_file_name(new_name);
            let outcome = move_file(&path, &dst, dry_run);
            record(&mut result, outcome, &path);
        }
    }

    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoPart {
    Mag,
    Phase,
}

impl EchoPart {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mag => "mag",
            Self::Phase => "phase",
        }
    }

    /// `M` in `ImageType` means magnitude, otherwise `P` means phase.
    pub fn from_image_type(value: Option<&Value>) -> Option<Self> {
        let items: Vec<String> = value?
            .as_array()?
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_uppercase(),
                other => other.to_string().trim().to_uppercase(),
            })
            .collect();
        if items.iter().any(|s| s == "M") {
            Some(Self::Mag)
        } else if items.iter().any(|s| s == "P") {
            Some(Self::Phase)
        } else {
            None
        }
    }
}

/// `sub-1_ses-1_run-01_echo-1_qsm` → `sub-1_ses-1_echo-1_part-mag_MEGRE`.
pub fn megre_stem(old_stem: &str, part: EchoPart) -> String {
    let mut tokens: Vec<String> = old_stem
        .split('_')
        .filter(|t| !t.starts_with("run-"))
        .map(str::to_string)
        .collect();

    let insert_at = match tokens.iter().position(|t| t.starts_with("echo-")) {
        Some(i) => i + 1,
        None => tokens.len().saturating_sub(1),
    };
    let part_token = format!("part-{}", part.as_str());
    if !tokens.contains(&part_token) {
        tokens.insert(insert_at, part_token);
    }

    match tokens.last_mut() {
        Some(last) => *last = "MEGRE".to_string(),
        None => tokens.push("MEGRE".to_string()),
    }
    tokens.join("_")
}

/// Move `swi/*_qsm.{json,nii.gz}` pairs into `anat/` as MEGRE magnitude/phase echoes.
pub fn swi_to_megre(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    let swi_dirs = fsutil::datatype_dirs(root, "swi")?;
    if swi_dirs.is_empty() {
        log::info!("No swi/ directories found under {}", root.display());
    }

    for swi in swi_dirs {
        log::debug!("Scanning {}", swi.display());
        let Some(anat) = swi.parent().map(|ses| ses.join("anat")) else {
            continue;
        };

        for json in fsutil::files_where(&swi, |n| n.ends_with("_qsm.json"))? {
            let sidecar = match Sidecar::load(&json) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("Could not read {}: {}", json.display(), e);
                    result.errors += 1;
                    continue;
                }
            };
            let Some(part) = EchoPart::from_image_type(sidecar.get("ImageType")) else {
                log::warn!(
                    "Could not decide part-mag/part-phase from ImageType in {}, skipping",
                    json.display()
                );
                result.skipped += 1;
                continue;
            };

            let name = json.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let stem = name.trim_end_matches(".json");
            let nii = json.with_file_name(format!("{stem}.nii.gz"));
            if !nii.exists() {
                log::warn!("Paired NIfTI not found for {} (expected {})", name, nii.display());
                result.skipped += 1;
                continue;
            }

            let new_stem = megre_stem(stem, part);
            let json_move = move_file(&json, &anat.join(format!("{new_stem}.json")), dry_run);
            record(&mut result, json_move, &json);
            let nii_move = move_file(&nii, &anat.join(format!("{new_stem}.nii.gz")), dry_run);
            record(&mut result, nii_move, &nii);
        }

        if !dry_run && std::fs::read_dir(&swi)?.next().is_none() {
            std::fs::remove_dir(&swi)?;
            log::info!("Removed empty {}", swi.display());
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, body: &str) -> PathBuf {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn test_misordered_anat_name() {
        assert_eq!(
            misordered_anat_name("sub-1_ses-2_run-01_rec-norm_T1w.nii.gz").as_deref(),
            Some("sub-1_ses-2_rec-norm_run-01_T1w.nii.gz")
        );
        assert_eq!(misordered_anat_name("sub-1_ses-2_rec-norm_run-01_T1w.json"), None);
        // Anchored: trailing junk does not match
        assert_eq!(misordered_anat_name("sub-1_ses-2_run-01_rec-norm_T2w.json.bak"), None);
    }

    #[test]
    fn test_rename_misordered_anat_never_overwrites() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-1/ses-1/anat/sub-1_ses-1_run-01_rec-norm_T1w.json", "{}");
        touch(dir.path(), "sub-1/ses-1/anat/sub-1_ses-1_run-01_rec-norm_T2w.json", "old");
        touch(dir.path(), "sub-1/ses-1/anat/sub-1_ses-1_rec-norm_run-01_T2w.json", "new");

        let r = rename_misordered_anat(dir.path(), false).unwrap();
        assert_eq!(r.changed, 1);
        assert_eq!(r.skipped, 1);
        let anat = dir.path().join("sub-1/ses-1/anat");
        assert!(anat.join("sub-1_ses-1_rec-norm_run-01_T1w.json").exists());
        assert_eq!(
            std::fs::read_to_string(anat.join("sub-1_ses-1_rec-norm_run-01_T2w.json")).unwrap(),
            "new"
        );
    }

    #[test]
    fn test_parse_subject_sessions() {
        let text = "# dwi AP\nsub-20812 ses-3\nsub-20259,ses-3\n\nsub-19861\tses-1  # trailing\n";
        let pairs = parse_subject_sessions(text).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1], ("sub-20259".to_string(), "ses-3".to_string()));
        assert!(parse_subject_sessions("sub-1\n").is_err());
    }

    #[test]
    fn test_rename_fmap_variants() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-1/ses-1/fmap/sub-1_ses-1_acq-dwi_dir-AP_run-01_epi.json", "{}");
        touch(dir.path(), "sub-1/ses-1/fmap/sub-1_ses-1_acq-dwi_dir-AP_run-01_epi.nii.gz", "");
        let pairs = vec![
            ("sub-1".to_string(), "ses-1".to_string()),
            ("sub-2".to_string(), "ses-1".to_string()),
        ];
        let r = rename_fmap_variants(
            dir.path(),
            &pairs,
            "acq-dwi_dir-AP",
            "acq-VARIANTObliquity_dwi_dir-AP",
            false,
        )
        .unwrap();
        assert_eq!(r.changed, 1);
        assert_eq!(r.skipped, 1);
        let fmap = dir.path().join("sub-1/ses-1/fmap");
        assert!(fmap.join("sub-1_ses-1_acq-VARIANTObliquity_dwi_dir-AP_run-01_epi.json").exists());
        assert!(fmap.join("sub-1_ses-1_acq-dwi_dir-AP_run-01_epi.nii.gz").exists());
    }

    #[test]
    fn test_variant_obliquity_name() {
        assert_eq!(
            variant_obliquity_name("sub-1_ses-1_acq-VARIANTObliquity_dwi_dir-AP_epi.json").as_deref(),
            Some("sub-1_ses-1_acq-dwiVARIANTObliquity_dir-AP_epi.json")
        );
        assert_eq!(variant_obliquity_name("sub-1_ses-1_acq-dwi_dir-AP_epi.json"), None);
    }

    #[test]
    fn test_megre_stem() {
        assert_eq!(
            megre_stem("sub-23698_ses-1_run-01_echo-1_qsm", EchoPart::Mag),
            "sub-23698_ses-1_echo-1_part-mag_MEGRE"
        );
        assert_eq!(
            megre_stem("sub-1_ses-1_acq-x_qsm", EchoPart::Phase),
            "sub-1_ses-1_acq-x_part-phase_MEGRE"
        );
    }

    #[test]
    fn test_part_from_image_type() {
        let mag = serde_json::json!(["ORIGINAL", "PRIMARY", "M", "NORM"]);
        let phase = serde_json::json!(["ORIGINAL", "PRIMARY", "P"]);
        let neither = serde_json::json!(["ORIGINAL"]);
        assert_eq!(EchoPart::from_image_type(Some(&mag)), Some(EchoPart::Mag));
        assert_eq!(EchoPart::from_image_type(Some(&phase)), Some(EchoPart::Phase));
        assert_eq!(EchoPart::from_image_type(Some(&neither)), None);
        assert_eq!(EchoPart::from_image_type(None), None);
    }

    #[test]
    fn test_swi_to_megre_moves_pairs() {
        let dir = TempDir::new().unwrap();
        touch(
            dir.path(),
            "sub-1/ses-1/swi/sub-1_ses-1_run-01_echo-1_qsm.json",
            r#"{"ImageType": ["ORIGINAL", "PRIMARY", "M"]}"#,
        );
        touch(dir.path(), "sub-1/ses-1/swi/sub-1_ses-1_run-01_echo-1_qsm.nii.gz", "");

        let dry = swi_to_megre(dir.path(), true).unwrap();
        assert_eq!(dry.changed, 2);
        assert!(dir.path().join("sub-1/ses-1/swi").is_dir());

        let r = swi_to_megre(dir.path(), false).unwrap();
        assert_eq!(r.changed, 2);
        let anat = dir.path().join("sub-1/ses-1/anat");
        assert!(anat.join("sub-1_ses-1_echo-1_part-mag_MEGRE.json").exists());
        assert!(anat.join("sub-1_ses-1_echo-1_part-mag_MEGRE.nii.gz").exists());
        assert!(!dir.path().join("sub-1/ses-1/swi").exists());
    }

    #[test]
    fn test_swi_missing_nifti_skipped() {
        let dir = TempDir::new().unwrap();
        touch(
            dir.path(),
            "sub-1/ses-1/swi/sub-1_ses-1_echo-2_qsm.json",
            r#"{"ImageType": ["P"]}"#,
        );
        let r = swi_to_megre(dir.path(), false).unwrap();
        assert_eq!(r.skipped, 1);
        assert!(dir.path().join("sub-1/ses-1/swi").is_dir());
    }
}
