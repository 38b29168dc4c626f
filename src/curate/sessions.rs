//! Sessions and scans tables: anonymised session dates, column/file renames,
//! scan-date shifting.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use walkdir::WalkDir;

use super::{CurateError, CurateResult, Result};
use crate::fsutil;
use crate::table::{self, Table};

/// Year every anonymised date is moved into.
const ANON_YEAR: i32 = 1800;
/// Day of month the first session is placed on.
const ANON_DAY: u32 = 15;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse an `acq_time` cell. Accepts ISO-8601 with `T` or space, optional
/// fractional seconds, an optional offset, or a bare date (midnight).
pub fn parse_acq_time(cell: &str) -> Option<NaiveDateTime> {
    let s = cell.trim();
    if table::is_missing(s) {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Earliest parsable `acq_time` in a scans table.
fn earliest_acq_time(scans: &Table) -> Option<NaiveDateTime> {
    scans
        .column("acq_time")
        .ok()?
        .into_iter()
        .filter_map(parse_acq_time)
        .min()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Move `original` relative to `base` into year 1800.
///
/// The month offset from the base session and the day offset within the
/// month are kept; the base session lands on the 15th of its own month. The
/// hour is rounded to the nearest hour.
pub fn anonymize_time(base: NaiveDateTime, original: NaiveDateTime) -> Option<NaiveDateTime> {
    let month_diff =
        (original.year() - base.year()) * 12 + (original.month() as i32 - base.month() as i32);

    // Base day moved into the original's month, clamped for short months.
    let day = base.day().min(days_in_month(original.year(), original.month()));
    let anchor = NaiveDate::from_ymd_opt(original.year(), original.month(), day)?.and_time(base.time());
    let day_diff = (original - anchor).num_seconds().div_euclid(86_400);

    let months = base.month() as i32 - 1 + month_diff;
    let new_year = ANON_YEAR + months.div_euclid(12);
    let new_month = months.rem_euclid(12) as u32 + 1;
    let date = NaiveDate::from_ymd_opt(new_year, new_month, ANON_DAY)? + Duration::days(day_diff);

    let rounded = if original.minute() >= 30 {
        original + Duration::hours(1)
    } else {
        original
    };
    date.and_hms_opt(rounded.hour(), 0, 0)
}

/// Anonymised `(session_id, datetime)` pairs; the first session is the base.
pub fn anonymize_sessions(times: &[(String, NaiveDateTime)]) -> Vec<(String, String)> {
    let Some((_, base)) = times.first() else {
        return Vec::new();
    };
    times
        .iter()
        .filter_map(|(ses, t)| {
            let anon = anonymize_time(*base, *t)?;
            Some((ses.clone(), anon.format("%Y-%m-%dT%H:00:00").to_string()))
        })
        .collect()
}

/// Write `<sub>/sessions.tsv` for every subject in a scans tree.
pub fn create_sessions(scans_root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(scans_root)?;
    let mut result = CurateResult::default();

    for sub_dir in fsutil::child_dirs(scans_root, "sub-")? {
        let sub = dir_name(&sub_dir);
        let mut times = Vec::new();

        for ses_dir in fsutil::child_dirs(&sub_dir, "ses-")? {
            let ses = dir_name(&ses_dir);
            let scans_file = ses_dir.join(format!("{sub}_{ses}_scans.tsv"));
            if !scans_file.is_file() {
                continue;
            }
            match Table::read(&scans_file) {
                Ok(scans) => match earliest_acq_time(&scans) {
                    Some(t) => times.push((ses, t)),
                    None => log::warn!("No parsable acq_time in {}", scans_file.display()),
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}", scans_file.display(), e);
                    result.errors += 1;
                }
            }
        }

        if times.is_empty() {
            result.skipped += 1;
            continue;
        }

        let mut sessions = Table::new(vec!["session_id".to_string(), "datetime".to_string()]);
        for (ses, when) in anonymize_sessions(&times) {
            sessions.rows.push(vec![ses, when]);
        }

        let out = sub_dir.join("sessions.tsv");
        if dry_run {
            log::info!("[dry run] would write {} ({} sessions)", out.display(), sessions.len());
        } else {
            sessions.write(&out)?;
            log::info!("Generated {}", out.display());
        }
        result.changed += 1;
    }

    Ok(result)
}

/// Rename the `datetime` column of `<sub>/sessions.tsv` to `acq_time`.
pub fn rename_sessions_column(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    for sub_dir in fsutil::child_dirs(root, "sub-")? {
        let path = sub_dir.join("sessions.tsv");
        if !path.is_file() {
            continue;
        }
        let mut sessions = Table::read(&path)?;
        if !sessions.rename_column("datetime", "acq_time") {
            result.unchanged += 1;
            continue;
        }
        if dry_run {
            log::info!("[dry run] would rename datetime → acq_time in {}", path.display());
        } else {
            sessions.write(&path)?;
            log::info!("Updated 'datetime' to 'acq_time' in {}", path.display());
        }
        result.changed += 1;
    }

    Ok(result)
}

/// `<sub>/sessions.tsv` → `<sub>/<sub>_sessions.tsv`.
pub fn rename_sessions_file(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    for sub_dir in fsutil::child_dirs(root, "sub-")? {
        let src = sub_dir.join("sessions.tsv");
        if !src.is_file() {
            log::debug!("No sessions.tsv in {}", sub_dir.display());
            continue;
        }
        let dst = sub_dir.join(format!("{}_sessions.tsv", dir_name(&sub_dir)));
        if dst.exists() {
            log::warn!("Destination exists, skipping: {}", dst.display());
            result.skipped += 1;
            continue;
        }
        if dry_run {
            log::info!("[dry run] would rename {} -> {}", src.display(), dst.display());
        } else {
            std::fs::rename(&src, &dst)?;
            log::info!("Renamed {} -> {}", src.display(), dst.display());
        }
        result.changed += 1;
    }

    Ok(result)
}

/// Replace the date of a parsable `acq_time` with 1800-01-01, keeping the time.
pub fn shifted_acq_time(cell: &str) -> Option<String> {
    parse_acq_time(cell).map(|t| t.format("1800-01-01T%H:%M:%S").to_string())
}

pub fn shift_scan_dates(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::glob_sorted(root, "sub-*/ses-*/*_scans.tsv").map_err(CurateError::Invalid)?;
    let mut result = CurateResult::default();

    for path in files {
        let mut scans = match Table::read(&path) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Failed to process {}: {}", path.display(), e);
                result.errors += 1;
                continue;
            }
        };
        let Ok(cells) = scans.column("acq_time") else {
            log::info!("Skipped {} (no 'acq_time' column)", path.display());
            result.skipped += 1;
            continue;
        };

        let mut failed = 0usize;
        let shifted: Vec<String> = cells
            .into_iter()
            .map(|c| match shifted_acq_time(c) {
                Some(s) => s,
                None => {
                    if !table::is_missing(c) {
                        failed += 1;
                    }
                    String::new()
                }
            })
            .collect();
        if failed > 0 {
            log::warn!("{} 'acq_time' values in {} could not be parsed", failed, path.display());
        }

        scans.set_column("acq_time", shifted);
        if dry_run {
            log::info!("[dry run] would update {}", path.display());
        } else {
            scans.write(&path)?;
            log::info!("Updated {}", path.display());
        }
        result.changed += 1;
    }

    Ok(result)
}

/// Remove the `operator` column from every `*scans.tsv` in the tree.
pub fn drop_operator_column(root: &Path, dry_run: bool) -> Result<CurateResult> {
    fsutil::require_dir(root)?;
    let mut result = CurateResult::default();

    let files: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy().ends_with("scans.tsv"))
        .map(|e| e.into_path())
        .collect();

    for path in files {
        let mut scans = match Table::read(&path) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Error reading {}: {}", path.display(), e);
                result.errors += 1;
                continue;
            }
        };
        if !scans.drop_column("operator") {
            log::debug!("No 'operator' column in {}", path.display());
            result.unchanged += 1;
            continue;
        }
        if dry_run {
            log::info!("[dry run] would remove 'operator' from {}", path.display());
        } else if let Err(e) = scans.write(&path) {
            log::warn!("Error writing {}: {}", path.display(), e);
            result.errors += 1;
            continue;
        } else {
            log::info!("Removed 'operator' column from {}", path.display());
        }
        result.changed += 1;
    }

    Ok(result)
}

/// One row per subject: the earliest `ses-1` scan date as `%m/%d/%Y`, or `NA`.
pub fn scan1_summary(root: &Path) -> Result<Table> {
    fsutil::require_dir(root)?;
    let mut summary = Table::new(vec!["sub".to_string(), "scan_1_time".to_string()]);

    for sub_dir in fsutil::child_dirs(root, "sub-")? {
        let sub = dir_name(&sub_dir);
        let ses1 = sub_dir.join("ses-1");
        let first_scans = if ses1.is_dir() {
            fsutil::files_where(&ses1, |n| n.ends_with("_scans.tsv"))?
                .into_iter()
                .next()
        } else {
            None
        };

        let when = first_scans
            .and_then(|p| match Table::read(&p) {
                Ok(t) => Some(t),
                Err(e) => {
                    log::warn!("Failed to read {}: {}", p.display(), e);
                    None
                }
            })
            .and_then(|t| earliest_acq_time(&t))
            .map(|t| t.format("%m/%d/%Y").to_string())
            .unwrap_or_else(|| "NA".to_string());

        summary
            .rows
            .push(vec![crate::entities::strip_label_prefix(&sub).to_string(), when]);
    }

    Ok(summary)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
