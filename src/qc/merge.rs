//! Diffusion QC metrics against per-subject bundle outlier counts.

use std::collections::HashMap;
use std::path::Path;

use super::{PlotSettings, Result, figure_path, plot_values};
use crate::plot;
use crate::table::Table;

const QC_COLUMNS: &[&str] = &["mean_fd", "raw_neighbor_corr"];

/// Inner join of the QC table (`sub`/`ses`) with the row outlier table
/// (`sub-`/`ses-` prefixed) on bare subject and session labels. Output
/// columns: `subject, session, mean_fd, raw_neighbor_corr, num_row_outliers`,
/// in QC table order.
pub fn diffusion_vs_row_outliers(qc: &Table, outliers: &Table) -> Result<Table> {
    let mut qc = qc.clone();
    qc.rename_column("sub", "subject");
    qc.rename_column("ses", "session");
    let qc_subject = qc.column("subject")?;
    let qc_session = qc.column("session")?;
    let qc_values: Vec<Vec<&str>> = QC_COLUMNS.iter().map(|c| qc.column(c)).collect::<std::result::Result<_, _>>()?;

    let mut counts: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
    for ((sub, ses), n) in outliers
        .column("subject")?
        .into_iter()
        .zip(outliers.column("session")?)
        .zip(outliers.column("num_row_outliers")?)
    {
        let key = (sub.trim_start_matches("sub-"), ses.trim_start_matches("ses-"));
        counts.entry(key).or_default().push(n);
    }

    let mut out = Table::new(
        ["subject", "session", "mean_fd", "raw_neighbor_corr", "num_row_outliers"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    for (i, (sub, ses)) in qc_subject.iter().zip(&qc_session).enumerate() {
        let Some(matches) = counts.get(&(*sub, *ses)) else {
            continue;
        };
        for n in matches {
            out.rows.push(vec![
                sub.to_string(),
                ses.to_string(),
                qc_values[0][i].to_string(),
                qc_values[1][i].to_string(),
                n.to_string(),
            ]);
        }
    }
    Ok(out)
}

pub struct MergeResult {
    pub rows: usize,
    pub figures: u64,
}

/// Join the two tables and scatter each QC metric against the outlier count.
pub fn run_merge(qc: &Table, outliers: &Table, out_dir: &Path, plots: &PlotSettings) -> Result<MergeResult> {
    let merged = diffusion_vs_row_outliers(qc, outliers)?;
    log::info!("Merged rows: {}", merged.len());
    let counts = plot_values(&merged, "num_row_outliers")?;

    let scatters = [
        (
            "mean_fd",
            "diffusion_scatter_mean_fd_vs_row_outliers",
            "Mean FD vs. Number of Row Outliers",
            "Mean Framewise Displacement",
        ),
        (
            "raw_neighbor_corr",
            "diffusion_scatter_neighbor_corr_vs_row_outliers",
            "Neighbor Correlation vs. Number of Row Outliers",
            "Raw Neighbor Correlation",
        ),
    ];
    let mut figures = 0;
    for (column, stem, title, x_label) in scatters {
        let xs = plot_values(&merged, column)?;
        let opts = plots.options(title, x_label, "Number of Bundle Outliers");
        if plot::scatter(&figure_path(out_dir, stem), &xs, &counts, &opts)? {
            figures += 1;
        }
    }
    Ok(MergeResult {
        rows: merged.len(),
        figures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        Table {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows: rows.iter().map(|r| r.iter().map(|s| s.to_string()).collect()).collect(),
        }
    }

    fn qc() -> Table {
        table(
            &["sub", "ses", "mean_fd", "raw_neighbor_corr", "max_fd"],
            &[
                &["101", "1", "0.2", "0.5", "1.0"],
                &["102", "1", "0.4", "0.6", "2.0"],
                &["103", "2", "0.1", "0.7", "0.5"],
            ],
        )
    }

    fn outliers() -> Table {
        table(
            &["subject", "session", "total_volume_mm3_A", "num_row_outliers"],
            &[
                &["sub-103", "ses-2", "0", "4"],
                &["sub-101", "ses-1", "1", "7"],
                &["sub-999", "ses-1", "0", "1"],
            ],
        )
    }

    #[test]
    fn test_inner_join_strips_prefixes() {
        let merged = diffusion_vs_row_outliers(&qc(), &outliers()).unwrap();
        assert_eq!(
            merged.columns,
            vec!["subject", "session", "mean_fd", "raw_neighbor_corr", "num_row_outliers"]
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.rows[0], vec!["101", "1", "0.2", "0.5", "7"]);
        assert_eq!(merged.rows[1], vec!["103", "2", "0.1", "0.7", "4"]);
    }

    #[test]
    fn test_missing_qc_column_is_error() {
        let mut q = qc();
        q.drop_column("mean_fd");
        assert!(diffusion_vs_row_outliers(&q, &outliers()).is_err());
    }

    #[test]
    fn test_run_merge_writes_scatters() {
        let dir = TempDir::new().unwrap();
        let r = run_merge(&qc(), &outliers(), dir.path(), &PlotSettings::default()).unwrap();
        assert_eq!(r.rows, 2);
        assert_eq!(r.figures, 2);
        assert!(dir.path().join("diffusion_scatter_mean_fd_vs_row_outliers.svg").exists());
    }
}
