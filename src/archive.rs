//! Selective extraction from per-subject derivative ZIP archives.

use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP error in {path}: {source}")]
    Zip { path: String, source: zip::result::ZipError },
    #[error("Invalid archive pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },
}

/// Named archive/member selections used by the study's derivative pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnzipPreset {
    XcpdRelmat,
    FmriprepSurfaces,
    T1Mni,
}

impl UnzipPreset {
    pub fn archive_glob(&self) -> &'static str {
        match self {
            Self::XcpdRelmat => "sub-*_ses-*_xcpd-0-10-7.zip",
            Self::FmriprepSurfaces | Self::T1Mni => "sub-*_ses-*_fmriprep_anat-25-0-0.zip",
        }
    }

    pub fn members(&self) -> &'static [&'static str] {
        match self {
            Self::XcpdRelmat => &["_seg-4S1056Parcels_stat-pearsoncorrelation_relmat.tsv"],
            Self::FmriprepSurfaces => &[
                "_space-fsLR_den-91k_thickness.dscalar.nii",
                "_space-fsLR_den-91k_curv.dscalar.nii",
                "_space-fsLR_den-91k_sulc.dscalar.nii",
            ],
            Self::T1Mni => &["_space-MNI152NLin6Asym_res-1_desc-preproc_T1w.nii.gz"],
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub members_total: usize,
    pub extracted: Vec<PathBuf>,
    pub unsafe_skipped: usize,
}

pub struct UnzipResult {
    pub archives: u64,
    pub extracted: u64,
    pub errors: u64,
}

/// Extract every member of `archive` whose name contains one of `patterns`.
/// In-archive paths are kept relative to `dest`.
pub fn extract_matching(
    archive: &Path,
    patterns: &[String],
    dest: &Path,
) -> Result<ExtractReport, ArchiveError> {
    let zip_err = |source| ArchiveError::Zip {
        path: archive.display().to_string(),
        source,
    };
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_err)?;

    let mut report = ExtractReport {
        members_total: zip.len(),
        ..Default::default()
    };

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        let name = entry.name().to_string();
        if !patterns.iter().any(|p| name.contains(p.as_str())) {
            continue;
        }

        let Some(rel) = entry.enclosed_name() else {
            log::warn!("Skipping unsafe member path {:?} in {}", name, archive.display());
            report.unsafe_skipped += 1;
            continue;
        };
        let out_path = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
        log::debug!("Extracted {}", out_path.display());
        report.extracted.push(out_path);
    }

    Ok(report)
}

/// Glob archives in `dir` (sorted) and extract matching members from each.
pub fn extract_all(
    dir: &Path,
    archive_glob: &str,
    patterns: &[String],
    dest: &Path,
) -> Result<UnzipResult, ArchiveError> {
    let archives = crate::fsutil::glob_sorted(dir, archive_glob).map_err(|message| {
        ArchiveError::Pattern {
            pattern: archive_glob.to_string(),
            message,
        }
    })?;

    log::info!("Found {} archives matching {}", archives.len(), archive_glob);

    let pb = ProgressBar::new(archives.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut result = UnzipResult {
        archives: 0,
        extracted: 0,
        errors: 0,
    };

    for archive in &archives {
        result.archives += 1;
        match extract_matching(archive, patterns, dest) {
            Ok(report) => {
                result.extracted += report.extracted.len() as u64;
                if report.extracted.is_empty() {
                    log::warn!("No matching members in {}", archive.display());
                }
            }
            Err(e) => {
                log::warn!("Failed to unzip {}: {}", archive.display(), e);
                result.errors += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message(format!(
        "Done: {} archives, {} files extracted, {} errors",
        result.archives, result.extracted, result.errors
    ));

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn make_zip(path: &Path, members: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, body) in members {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_matching_filters_by_substring() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("sub-1_ses-1_xcpd-0-10-7.zip");
        make_zip(
            &archive,
            &[
                ("xcpd/sub-1/ses-1/func/sub-1_ses-1_task-rest_seg-4S1056Parcels_stat-pearsoncorrelation_relmat.tsv", "Node\n"),
                ("xcpd/sub-1/ses-1/func/sub-1_ses-1_task-rest_motion.tsv", "fd\n"),
                ("xcpd/dataset_description.json", "{}"),
            ],
        );
        let dest = dir.path().join("out");
        let patterns = vec!["_seg-4S1056Parcels_stat-pearsoncorrelation_relmat.tsv".to_string()];
        let report = extract_matching(&archive, &patterns, &dest).unwrap();

        assert_eq!(report.members_total, 3);
        assert_eq!(report.extracted.len(), 1);
        assert!(dest
            .join("xcpd/sub-1/ses-1/func/sub-1_ses-1_task-rest_seg-4S1056Parcels_stat-pearsoncorrelation_relmat.tsv")
            .exists());
        assert!(!dest.join("xcpd/dataset_description.json").exists());
    }

    #[test]
    fn test_extract_matching_skips_escaping_members() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("sub-1_ses-1_xcpd-0-10-7.zip");
        make_zip(
            &archive,
            &[
                ("xcpd/sub-1/func/sub-1_relmat.tsv", "Node\n"),
                ("../escape_relmat.tsv", "Node\n"),
            ],
        );
        let dest = dir.path().join("out");
        let report = extract_matching(&archive, &["relmat.tsv".to_string()], &dest).unwrap();

        assert_eq!(report.unsafe_skipped, 1);
        assert_eq!(report.extracted, vec![dest.join("xcpd/sub-1/func/sub-1_relmat.tsv")]);
        assert!(!dir.path().join("escape_relmat.tsv").exists());
    }

    #[test]
    fn test_extract_all_counts_bad_archives() {
        let dir = TempDir::new().unwrap();
        make_zip(&dir.path().join("sub-1_ses-1_xcpd-0-10-7.zip"), &[("a_relmat.tsv", "x")]);
        make_zip(&dir.path().join("sub-2_ses-1_xcpd-0-10-7.zip"), &[("b_relmat.tsv", "y")]);
        std::fs::write(dir.path().join("sub-3_ses-1_xcpd-0-10-7.zip"), "not a zip").unwrap();

        let dest = dir.path().join("out");
        let result = extract_all(
            dir.path(),
            UnzipPreset::XcpdRelmat.archive_glob(),
            &["_relmat.tsv".to_string()],
            &dest,
        )
        .unwrap();

        assert_eq!(result.archives, 3);
        assert_eq!(result.extracted, 2);
        assert_eq!(result.errors, 1);
        assert!(dest.join("a_relmat.tsv").exists());
        assert!(dest.join("b_relmat.tsv").exists());
    }

    #[test]
    fn test_presets() {
        assert_eq!(UnzipPreset::FmriprepSurfaces.members().len(), 3);
        assert!(UnzipPreset::T1Mni.archive_glob().ends_with("fmriprep_anat-25-0-0.zip"));
    }
}
