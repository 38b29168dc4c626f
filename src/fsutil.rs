//! Path helpers for the `sub-*/ses-*/<datatype>/` layout.

use std::path::{Path, PathBuf};

/// Files under `dir` matching a relative glob (e.g. `sub-*/ses-*/func/*_motion.tsv`), sorted.
pub fn glob_sorted(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, String> {
    let base = glob::Pattern::escape(&dir.to_string_lossy());
    let full = format!("{}/{}", base.trim_end_matches('/'), pattern);
    let paths = glob::glob(&full).map_err(|e| format!("Invalid glob pattern '{}': {}", full, e))?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => log::warn!("glob error: {}", e),
        }
    }
    files.sort();
    Ok(files)
}

/// Sorted child directories of `dir` whose names start with `prefix`.
pub fn child_dirs(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.path().is_dir() && name.to_string_lossy().starts_with(prefix) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Every existing `sub-*/ses-*/<datatype>` directory under `root`, sorted.
pub fn datatype_dirs(root: &Path, datatype: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for sub in child_dirs(root, "sub-")? {
        for ses in child_dirs(&sub, "ses-")? {
            let dir = ses.join(datatype);
            if dir.is_dir() {
                out.push(dir);
            }
        }
    }
    Ok(out)
}

/// Sorted files in `dir` for which `keep(file_name)` holds.
pub fn files_where(dir: &Path, keep: impl Fn(&str) -> bool) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && keep(&entry.file_name().to_string_lossy()) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Every file in `sub-*/ses-*/<datatype>/` whose name satisfies `keep`.
pub fn datatype_files(
    root: &Path,
    datatype: &str,
    keep: impl Fn(&str) -> bool,
) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for dir in datatype_dirs(root, datatype)? {
        out.extend(files_where(&dir, &keep)?);
    }
    Ok(out)
}

/// Ensure a root directory exists before a recipe walks it.
pub fn require_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("directory not found: {}", dir.display()),
        ))
    }
}
