//! Threshold outlier tables: mean ± k·SD flags per column/row, missing
//! counts, and parcel coverage counts.

use std::path::{Path, PathBuf};

use super::{PlotSettings, Result, figure_path, plot_values};
use crate::plot;
use crate::stats;
use crate::table::{self, Table};

/// Columns of the bundle table that are not per-bundle volumes.
pub const BUNDLE_EXCLUDE: &[&str] = &["subject", "session", "total_volume_all_bundles", "mean_bundle_volume"];
/// Identifying columns of the concatenated coverage table.
pub const COVERAGE_META: &[&str] = &["sub", "ses", "task", "run", "space", "seg", "stat", "acq"];

/// Every column not listed in `exclude`, in table order.
pub fn value_columns(table: &Table, exclude: &[&str]) -> Vec<usize> {
    table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !exclude.contains(&c.as_str()))
        .map(|(i, _)| i)
        .collect()
}

fn numeric_at(table: &Table, idx: usize) -> Vec<Option<f64>> {
    table.rows.iter().map(|r| table::parse_number(&r[idx])).collect()
}

/// True when `v` lies on or beyond either edge of the band.
fn outside(v: f64, band: Option<(f64, f64)>) -> bool {
    match band {
        Some((lo, hi)) => v >= hi || v <= lo,
        None => false,
    }
}

/// Per-column outlier summary returned alongside the flag table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOutliers {
    pub table: Table,
    /// `(column, flagged cells)` for every value column.
    pub counts: Vec<(String, u64)>,
}

/// Replace each value cell with 1 if it is outside mean ± k·SD of its column,
/// else 0 (missing counts as 0). Appends a column-mean row and a flag-count row,
/// labelled in the first `meta` column. Columns in `meta` are left as they are.
pub fn column_outliers(table: &Table, meta: &[&str], k: f64) -> ColumnOutliers {
    let cols = value_columns(table, meta);
    let label = |text: &str| meta.first().map(|c| (c.to_string(), text.to_string()));
    let mut out = table.clone();
    let mut mean_row: Vec<(String, String)> = label("mean_bundle_column_volume").into_iter().collect();
    let mut count_row: Vec<(String, String)> = label("num_column_outliers").into_iter().collect();
    let mut counts = Vec::with_capacity(cols.len());

    for &c in &cols {
        let values = numeric_at(table, c);
        let band = stats::sd_band(&values, k);
        let mut flagged = 0u64;
        for (row, v) in out.rows.iter_mut().zip(&values) {
            let flag = v.is_some_and(|v| outside(v, band));
            flagged += flag as u64;
            row[c] = if flag { "1" } else { "0" }.to_string();
        }
        let name = table.columns[c].clone();
        mean_row.push((name.clone(), table::format_opt(stats::mean(&values))));
        count_row.push((name.clone(), flagged.to_string()));
        counts.push((name, flagged));
    }

    out.push_row_map(mean_row);
    out.push_row_map(count_row);
    ColumnOutliers { table: out, counts }
}

/// Replace each value cell with 1 if it is missing or outside mean ± k·SD,
/// else 0. Appends `num_row_outliers` and `num_missing_bundles`.
pub fn row_outliers(table: &Table, meta: &[&str], k: f64) -> Table {
    let cols = value_columns(table, meta);
    let mut out = table.clone();
    let mut per_row = vec![0u64; table.len()];
    let mut missing = vec![0u64; table.len()];

    for &c in &cols {
        let values = numeric_at(table, c);
        let band = stats::sd_band(&values, k);
        for (i, v) in values.iter().enumerate() {
            let flag = match v {
                None => {
                    missing[i] += 1;
                    true
                }
                Some(v) => outside(*v, band),
            };
            per_row[i] += flag as u64;
            out.rows[i][c] = if flag { "1" } else { "0" }.to_string();
        }
    }

    out.push_column("num_row_outliers", per_row.iter().map(u64::to_string).collect());
    out.push_column("num_missing_bundles", missing.iter().map(u64::to_string).collect());
    out
}

/// Append one row with each value column's missing count, labelled in the
/// first `meta` column.
pub fn missing_counts(table: &Table, meta: &[&str]) -> (Table, Vec<u64>) {
    let cols = value_columns(table, meta);
    let mut out = table.clone();
    let mut row: Vec<(String, String)> = meta
        .first()
        .map(|c| (c.to_string(), "num_subjects_with_missing_bundle".to_string()))
        .into_iter()
        .collect();
    let mut counts = Vec::with_capacity(cols.len());
    for &c in &cols {
        let n = stats::count_missing(&numeric_at(table, c)) as u64;
        row.push((table.columns[c].clone(), n.to_string()));
        counts.push(n);
    }
    out.push_row_map(row);
    (out, counts)
}

fn below(cell: &str, threshold: f64) -> bool {
    table::parse_number(cell).is_some_and(|v| v < threshold)
}

/// Append `row_sum`: how many parcels in each row have coverage below `threshold`.
pub fn coverage_row_sums(table: &Table, threshold: f64) -> (Table, Vec<u64>) {
    let cols = value_columns(table, COVERAGE_META);
    let sums: Vec<u64> = table
        .rows
        .iter()
        .map(|r| cols.iter().filter(|&&c| below(&r[c], threshold)).count() as u64)
        .collect();
    let mut out = table.clone();
    out.push_column("row_sum", sums.iter().map(u64::to_string).collect());
    (out, sums)
}

/// Append a `sub=col_sum` row: per parcel, how many rows have coverage below `threshold`.
pub fn coverage_col_sums(table: &Table, threshold: f64) -> (Table, Vec<u64>) {
    let cols = value_columns(table, COVERAGE_META);
    let mut row: Vec<(String, String)> = vec![("sub".to_string(), "col_sum".to_string())];
    let mut sums = Vec::with_capacity(cols.len());
    for &c in &cols {
        let n = table.rows.iter().filter(|r| below(&r[c], threshold)).count() as u64;
        row.push((table.columns[c].clone(), n.to_string()));
        sums.push(n);
    }
    let mut out = table.clone();
    out.push_row_map(row);
    (out, sums)
}

/// Files produced by one outlier command.
#[derive(Debug, Default)]
pub struct OutlierReport {
    pub tables: Vec<PathBuf>,
    pub figures: u64,
}

impl OutlierReport {
    fn save(&mut self, table: &Table, path: PathBuf) -> Result<()> {
        table.write(&path)?;
        log::info!("Saved {}", path.display());
        self.tables.push(path);
        Ok(())
    }

    fn count(&mut self, drawn: bool) {
        self.figures += drawn as u64;
    }
}

fn as_f64(counts: &[u64]) -> Vec<f64> {
    counts.iter().map(|&c| c as f64).collect()
}

/// Column, row and missing-value summaries of the concatenated bundle table.
pub fn run_bundle_outliers(table: &Table, out_dir: &Path, k: f64, plots: &PlotSettings) -> Result<OutlierReport> {
    let mut report = OutlierReport::default();

    let cols = column_outliers(table, BUNDLE_EXCLUDE, k);
    report.save(&cols.table, out_dir.join("column_sum_bundle_volume.csv"))?;
    let counts: Vec<u64> = cols.counts.iter().map(|(_, n)| *n).collect();
    let opts = plots.options("Distribution of Column Outlier Counts", "Number of Outliers", "Number of Bundles");
    report.count(plot::histogram(
        &figure_path(out_dir, "column_bundle_outlier_distribution"),
        &as_f64(&counts),
        plots.bins,
        true,
        &opts,
    )?);

    let rows = row_outliers(table, BUNDLE_EXCLUDE, k);
    report.save(&rows, out_dir.join("row_sum_bundle_volume.csv"))?;
    let opts = plots.options("Distribution of Row Outlier Counts", "Number of Outliers", "Number of Subjects");
    report.count(plot::histogram(
        &figure_path(out_dir, "row_bundle_outlier_distribution"),
        &plot_values(&rows, "num_row_outliers")?,
        plots.bins,
        true,
        &opts,
    )?);

    let (missing, counts) = missing_counts(table, BUNDLE_EXCLUDE);
    report.save(&missing, out_dir.join("missing_bundle_column_sum.csv"))?;
    let opts = plots.options("Subjects Missing Each Bundle", "Number of Subjects Missing", "Number of Bundles");
    report.count(plot::histogram(
        &figure_path(out_dir, "missing_bundle_column_distribution"),
        &as_f64(&counts),
        plots.bins,
        false,
        &opts,
    )?);

    Ok(report)
}

/// Low-coverage parcel counts per scan (rows) and per parcel (columns).
pub fn run_coverage(table: &Table, out_dir: &Path, threshold: f64, plots: &PlotSettings) -> Result<OutlierReport> {
    let mut report = OutlierReport::default();
    let x_label = format!("Parcels with coverage < {threshold}");

    let (rows, sums) = coverage_row_sums(table, threshold);
    report.save(&rows, out_dir.join("concat_xcpd_qc_coverage_row_sums.csv"))?;
    let values = as_f64(&sums);
    let opts = plots.options("Row Sums of Low Coverage", &x_label, "Number of Scans");
    report.count(plot::discrete_histogram(
        &figure_path(out_dir, "row_sum_histogram_trimmed"),
        &values,
        false,
        &opts,
    )?);
    let opts = plots.options("Row Sums of Low Coverage (log scale)", &x_label, "Number of Scans");
    report.count(plot::discrete_histogram(
        &figure_path(out_dir, "row_sum_histogram_logy_trimmed"),
        &values,
        true,
        &opts,
    )?);
    let opts = plots.options("Row Sum Counts", &x_label, "Number of Scans");
    report.count(plot::bar_counts(&figure_path(out_dir, "row_sum_barplot"), &values, &opts)?);

    let (cols, sums) = coverage_col_sums(table, threshold);
    report.save(&cols, out_dir.join("concat_xcpd_qc_coverage_col_sums.csv"))?;
    let values = as_f64(&sums);
    let x_label = format!("Scans with coverage < {threshold}");
    let opts = plots.options("Column Sums of Low Coverage", &x_label, "Number of Parcels");
    report.count(plot::discrete_histogram(
        &figure_path(out_dir, "col_sum_histogram"),
        &values,
        false,
        &opts,
    )?);
    let opts = plots.options("Column Sum Counts", &x_label, "Number of Parcels");
    report.count(plot::bar_counts(&figure_path(out_dir, "col_sum_barplot"), &values, &opts)?);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle_table() -> Table {
        // Column A: 20 values near 100 and one spike at 1000
        let mut t = Table::new(
            ["subject", "session", "total_volume_mm3_A", "total_volume_mm3_B", "total_volume_all_bundles", "mean_bundle_volume"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for i in 0..20 {
            let a = 100 + (i % 5);
            let b = if i == 3 { String::new() } else { (50 + i % 3).to_string() };
            t.rows.push(vec![
                format!("sub-{i}"),
                "ses-1".to_string(),
                a.to_string(),
                b,
                "0".to_string(),
                "0".to_string(),
            ]);
        }
        t.rows.push(vec![
            "sub-99".to_string(),
            "ses-1".to_string(),
            "1000".to_string(),
            "51".to_string(),
            "0".to_string(),
            "0".to_string(),
        ]);
        t
    }

    /// Reference flags computed straight from mean ± 3·SD.
    fn expected_flags(values: &[Option<f64>], missing_flag: bool) -> Vec<&'static str> {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        let n = present.len() as f64;
        let m = present.iter().sum::<f64>() / n;
        let sd = (present.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
        values
            .iter()
            .map(|v| match v {
                None => if missing_flag { "1" } else { "0" },
                Some(x) if *x >= m + 3.0 * sd || *x <= m - 3.0 * sd => "1",
                Some(_) => "0",
            })
            .collect()
    }

    #[test]
    fn test_column_outliers_match_band() {
        let t = bundle_table();
        let r = column_outliers(&t, BUNDLE_EXCLUDE, 3.0);
        for col in ["total_volume_mm3_A", "total_volume_mm3_B"] {
            let expected = expected_flags(&t.numeric_column(col).unwrap(), false);
            let got: Vec<&str> = r.table.column(col).unwrap()[..t.len()].to_vec();
            assert_eq!(got, expected, "{col}");
        }
        assert_eq!(r.table.cell(20, "total_volume_mm3_A"), Some("1"));
        assert_eq!(r.counts[0], ("total_volume_mm3_A".to_string(), 1));
        // Summary rows
        assert_eq!(r.table.len(), t.len() + 2);
        assert_eq!(r.table.cell(21, "subject"), Some("mean_bundle_column_volume"));
        assert_eq!(r.table.cell(22, "subject"), Some("num_column_outliers"));
        assert_eq!(r.table.cell(22, "total_volume_mm3_A"), Some("1"));
        assert_eq!(r.table.cell(22, "session"), Some(""));
        // Excluded columns untouched
        assert_eq!(r.table.cell(0, "total_volume_all_bundles"), Some("0"));
    }

    #[test]
    fn test_meta_columns_are_caller_defined() {
        let t = bundle_table();
        // Treat the bundle totals as values and column B as metadata.
        let meta = ["session", "subject", "total_volume_mm3_B"];
        let r = column_outliers(&t, &meta, 3.0);
        assert_eq!(r.counts.len(), 3);
        assert_eq!(r.counts[0].0, "total_volume_mm3_A");
        assert_eq!(r.table.cell(21, "session"), Some("mean_bundle_column_volume"));
        assert_eq!(r.table.cell(21, "subject"), Some(""));
        assert_eq!(r.table.cell(3, "total_volume_mm3_B"), Some(""));

        let rows = row_outliers(&t, &meta, 3.0);
        assert_eq!(rows.cell(3, "num_missing_bundles"), Some("0"));
        assert_eq!(rows.cell(3, "total_volume_mm3_B"), Some(""));

        let (missing, counts) = missing_counts(&t, &meta);
        assert_eq!(counts, vec![0, 0, 0]);
        assert_eq!(missing.cell(21, "session"), Some("num_subjects_with_missing_bundle"));
    }

    #[test]
    fn test_row_outliers_flag_missing() {
        let t = bundle_table();
        let out = row_outliers(&t, BUNDLE_EXCLUDE, 3.0);
        let expected_b = expected_flags(&t.numeric_column("total_volume_mm3_B").unwrap(), true);
        assert_eq!(out.column("total_volume_mm3_B").unwrap(), expected_b);
        assert_eq!(out.cell(3, "num_missing_bundles"), Some("1"));
        assert_eq!(out.cell(3, "total_volume_mm3_B"), Some("1"));
        assert_eq!(out.cell(20, "num_row_outliers"), Some("1"));
        assert_eq!(out.cell(0, "num_row_outliers"), Some("0"));
    }

    #[test]
    fn test_missing_counts_row() {
        let (out, counts) = missing_counts(&bundle_table(), BUNDLE_EXCLUDE);
        assert_eq!(counts, vec![0, 1]);
        let last = out.len() - 1;
        assert_eq!(out.cell(last, "subject"), Some("num_subjects_with_missing_bundle"));
        assert_eq!(out.cell(last, "total_volume_mm3_B"), Some("1"));
        assert_eq!(out.cell(last, "session"), Some(""));
    }

    #[test]
    fn test_coverage_sums() {
        let t = Table {
            columns: vec!["sub".into(), "ses".into(), "task".into(), "p1".into(), "p2".into(), "p3".into()],
            rows: vec![
                vec!["1".into(), "1".into(), "rest".into(), "0.9".into(), "0.4".into(), "0.1".into()],
                vec!["2".into(), "1".into(), "rest".into(), "0.5".into(), "n/a".into(), "0.49".into()],
            ],
        };
        let (rows, sums) = coverage_row_sums(&t, 0.5);
        assert_eq!(sums, vec![2, 1]);
        assert_eq!(rows.column("row_sum").unwrap(), vec!["2", "1"]);

        let (cols, sums) = coverage_col_sums(&t, 0.5);
        assert_eq!(sums, vec![0, 1, 2]);
        assert_eq!(cols.rows[2], vec!["col_sum", "", "", "0", "1", "2"]);
    }

    #[test]
    fn test_run_bundle_outliers_writes_tables() {
        let dir = TempDir::new().unwrap();
        let report = run_bundle_outliers(&bundle_table(), dir.path(), 3.0, &PlotSettings::default()).unwrap();
        assert_eq!(report.tables.len(), 3);
        for name in ["column_sum_bundle_volume.csv", "row_sum_bundle_volume.csv", "missing_bundle_column_sum.csv"] {
            assert!(dir.path().join(name).exists(), "{name}");
        }
        let rows = Table::read(&dir.path().join("row_sum_bundle_volume.csv")).unwrap();
        assert!(rows.has_column("num_missing_bundles"));
        assert!(dir.path().join("row_bundle_outlier_distribution.svg").exists());
    }
}
