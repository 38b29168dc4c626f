//! Stack per-subject QC files into one table per pipeline.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use super::{PlotSettings, QcError, Result, figure_path, plot_values};
use crate::entities;
use crate::fsutil;
use crate::plot;
use crate::stats;
use crate::table::{self, Table};

/// How a per-file table collapses into one output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// First row, every column as read.
    First,
    /// Mean of each numeric column.
    Mean,
    /// Median of each numeric column.
    Median,
}

/// Where the identifying columns of an output row come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaSource {
    /// `key-value` entities of the file name, in name order.
    FilenameEntities,
    /// These columns' first-row values, or `n/a` when a column is absent.
    FirstRowColumns(Vec<String>),
}

/// Ordered `(column, value)` pairs for one output row.
pub type Row = Vec<(String, String)>;

fn metadata(path: &Path, table: &Table, meta: &MetaSource) -> Row {
    match meta {
        MetaSource::FilenameEntities => entities::parse_path(path).entities,
        MetaSource::FirstRowColumns(cols) => {
            let mut row: Row = Vec::new();
            for c in cols {
                if row.iter().any(|(k, _)| k == c) {
                    continue;
                }
                let v = table.cell(0, c).unwrap_or("n/a").to_string();
                row.push((c.clone(), v));
            }
            row
        }
    }
}

fn reduce(table: &Table, reducer: Reducer) -> Row {
    match reducer {
        Reducer::First => match table.rows.first() {
            Some(first) => table.columns.iter().cloned().zip(first.iter().cloned()).collect(),
            None => Vec::new(),
        },
        Reducer::Mean | Reducer::Median => (0..table.columns.len())
            .filter(|&i| table.is_numeric_column(i))
            .map(|i| {
                let values: Vec<Option<f64>> =
                    table.rows.iter().map(|r| table::parse_number(&r[i])).collect();
                let v = match reducer {
                    Reducer::Median => stats::median(&values),
                    _ => stats::mean(&values),
                };
                (table.columns[i].clone(), table::format_opt(v))
            })
            .collect(),
    }
}

/// Reduced values override metadata with the same key, which keeps its position.
pub fn merge_row(mut meta: Row, values: Row) -> Row {
    for (k, v) in values {
        match meta.iter_mut().find(|(mk, _)| *mk == k) {
            Some(slot) => slot.1 = v,
            None => meta.push((k, v)),
        }
    }
    meta
}

/// Read one QC file and collapse it into a single row.
pub fn reduce_file(path: &Path, reducer: Reducer, meta: &MetaSource) -> Result<Row> {
    let mut t = Table::read(path)?;
    t.drop_unnamed_columns();
    if t.is_empty() {
        return Err(QcError::Invalid(format!("{} has no data rows", path.display())));
    }
    Ok(merge_row(metadata(path, &t, meta), reduce(&t, reducer)))
}

pub struct ConcatResult {
    pub table: Table,
    pub files: u64,
    pub failed: u64,
}

/// Reduce `files` in parallel and stack the rows in input order. Unreadable
/// files are logged and left out.
pub fn concat_files(files: &[PathBuf], reducer: Reducer, meta: &MetaSource, jobs: usize) -> Result<ConcatResult> {
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build()?;
    let rows: Vec<Result<Row>> = pool.install(|| {
        files
            .par_iter()
            .map(|f| {
                let row = reduce_file(f, reducer, meta);
                pb.inc(1);
                row
            })
            .collect()
    });

    let mut result = ConcatResult {
        table: Table::default(),
        files: files.len() as u64,
        failed: 0,
    };
    for (path, row) in files.iter().zip(rows) {
        match row {
            Ok(row) => result.table.push_row_map(row),
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                result.failed += 1;
            }
        }
    }

    pb.finish_with_message(format!(
        "Done: {} rows, {} failed",
        result.table.len(),
        result.failed
    ));
    Ok(result)
}

/// A histogram drawn from one column of a concatenated table.
#[derive(Debug, Clone, Copy)]
pub struct HistogramSpec {
    pub column: &'static str,
    pub stem: &'static str,
    pub title: &'static str,
    pub x_label: &'static str,
}

/// Per-pipeline concatenation presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcSource {
    XcpdMotion,
    XcpdCoverage,
    Qsiprep,
    Aslprep,
    Euler,
}

impl QcSource {
    /// Glob relative to the pipeline's derivatives root.
    pub fn glob(&self) -> &'static str {
        match self {
            Self::XcpdMotion => "sub-*/ses-*/func/sub-*_ses-*_task-*_run-*_motion.tsv",
            Self::XcpdCoverage => {
                "sub-*/ses-*/func/sub-*_ses-*_task-*_run-*_space-*_seg-4S1056Parcels_stat-coverage_bold.tsv"
            }
            Self::Qsiprep => "sub-*/ses-*/dwi/sub-*_ses-*_space-*_desc-image_qc.tsv",
            Self::Aslprep => "sub-*/ses-*/perf/sub-*_ses-*_run-*_desc-qualitycontrol_cbf.tsv",
            Self::Euler => "sub-*/sub-*_ses-*_desc-FreeSurfer_qc.tsv",
        }
    }

    pub fn reducer(&self) -> Reducer {
        match self {
            Self::XcpdMotion => Reducer::Median,
            Self::XcpdCoverage | Self::Qsiprep => Reducer::First,
            Self::Aslprep | Self::Euler => Reducer::Mean,
        }
    }

    pub fn meta(&self) -> MetaSource {
        fn cols(names: &[&str]) -> MetaSource {
            MetaSource::FirstRowColumns(names.iter().map(|s| s.to_string()).collect())
        }
        match self {
            Self::XcpdMotion | Self::XcpdCoverage | Self::Qsiprep => MetaSource::FilenameEntities,
            Self::Aslprep => cols(&["sub", "ses", "acq", "run"]),
            Self::Euler => cols(&["participant_id", "session_id"]),
        }
    }

    pub fn output_name(&self) -> &'static str {
        match self {
            Self::XcpdMotion => "concat_xcpd_qc_median.csv",
            Self::XcpdCoverage => "concat_xcpd_qc_coverage.csv",
            Self::Qsiprep => "concat_qsiprep_qc.csv",
            Self::Aslprep => "concat_aslprep_qc.csv",
            Self::Euler => "concat_euler_qc.csv",
        }
    }

    pub fn histograms(&self) -> &'static [HistogramSpec] {
        match self {
            Self::XcpdMotion => &[HistogramSpec {
                column: "framewise_displacement",
                stem: "concat_xcpd_qc_histogram_median",
                title: "Median FD distribution",
                x_label: "Median FD",
            }],
            Self::XcpdCoverage => &[],
            Self::Qsiprep => &[
                HistogramSpec {
                    column: "raw_neighbor_corr",
                    stem: "concat_qsiprep_neighborhood_corr_histogram",
                    title: "Mean Neighborhood Corr distribution",
                    x_label: "Mean Neighborhood Corr",
                },
                HistogramSpec {
                    column: "mean_fd",
                    stem: "concat_qsiprep_fd_histogram",
                    title: "Mean FD distribution",
                    x_label: "Mean FD",
                },
            ],
            Self::Aslprep => &[HistogramSpec {
                column: "qei_cbf",
                stem: "concat_aslprep_qc_histogram",
                title: "Mean QEI Distribution",
                x_label: "Mean QEI",
            }],
            Self::Euler => &[
                HistogramSpec {
                    column: "lh_euler",
                    stem: "concat_LH_euler_qc_histogram",
                    title: "Mean Left Hemisphere Euler Distribution",
                    x_label: "Mean LH Euler",
                },
                HistogramSpec {
                    column: "rh_euler",
                    stem: "concat_RH_euler_qc_histogram",
                    title: "Mean Right Hemisphere Euler Distribution",
                    x_label: "Mean RH Euler",
                },
            ],
        }
    }

    /// `(x column, y column, stem, title)` for sources with a scatter plot.
    pub fn scatter(&self) -> Option<(&'static str, &'static str, &'static str, &'static str)> {
        match self {
            Self::Qsiprep => Some((
                "mean_fd",
                "raw_neighbor_corr",
                "scatter_meanfd_vs_neighborcorr",
                "Mean FD vs. Raw Neighborhood Correlation",
            )),
            _ => None,
        }
    }
}

/// Histograms for the listed columns; a column the table lacks is logged and skipped.
pub fn draw_histograms(table: &Table, specs: &[HistogramSpec], out_dir: &Path, plots: &PlotSettings) -> Result<u64> {
    let mut written = 0;
    for spec in specs {
        if !table.has_column(spec.column) {
            log::warn!("Column {} not found; {} skipped", spec.column, spec.stem);
            continue;
        }
        let values = plot_values(table, spec.column)?;
        let opts = plots.options(spec.title, spec.x_label, "Count");
        if plot::histogram(&figure_path(out_dir, spec.stem), &values, plots.bins, true, &opts)? {
            written += 1;
        }
    }
    Ok(written)
}

pub struct SourceResult {
    pub concat: ConcatResult,
    pub output: PathBuf,
    pub figures: u64,
}

/// Concatenate one pipeline's QC files under `input_root`, write the CSV and figures to `out_dir`.
pub fn run_source(
    source: QcSource,
    input_root: &Path,
    out_dir: &Path,
    jobs: usize,
    plots: &PlotSettings,
) -> Result<SourceResult> {
    fsutil::require_dir(input_root)?;
    let files = fsutil::glob_sorted(input_root, source.glob()).map_err(QcError::Invalid)?;
    log::info!("Found {} files matching {}", files.len(), source.glob());
    if files.is_empty() {
        return Err(QcError::Invalid(format!(
            "no files matching {} under {}",
            source.glob(),
            input_root.display()
        )));
    }

    let concat = concat_files(&files, source.reducer(), &source.meta(), jobs)?;
    let output = out_dir.join(source.output_name());
    concat.table.write(&output)?;
    log::info!("Saved {}", output.display());

    let mut figures = draw_histograms(&concat.table, source.histograms(), out_dir, plots)?;
    if let Some((x, y, stem, title)) = source.scatter() {
        if concat.table.has_column(x) && concat.table.has_column(y) {
            let xs = plot_values(&concat.table, x)?;
            let ys = plot_values(&concat.table, y)?;
            let opts = plots.options(title, "Mean Framewise Displacement (FD)", "Raw Neighborhood Correlation");
            if plot::scatter(&figure_path(out_dir, stem), &xs, &ys, &opts)? {
                figures += 1;
            }
        }
    }

    Ok(SourceResult { concat, output, figures })
}

/// Value columns of a per-subject bundle volume table.
pub const BUNDLE_PREFIX: &str = "total_volume_mm3_";

pub struct PivotResult {
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// `bundle_name, total_volume_mm3` rows → one row of `total_volume_mm3_<bundle>` columns.
pub fn pivot_bundle_table(stats: &Table) -> Option<Table> {
    let names = stats.column("bundle_name").ok()?;
    let volumes = stats.column("total_volume_mm3").ok()?;
    let mut out = Table::default();
    let pairs: Vec<(String, String)> = names
        .into_iter()
        .zip(volumes)
        .map(|(n, v)| (format!("{BUNDLE_PREFIX}{n}"), v.to_string()))
        .collect();
    out.push_row_map(pairs);
    Some(out)
}

/// Write `<sub>_<ses>_space-ACPC_model-gqi_volume.csv` next to every `*_bundlestats.csv`.
pub fn pivot_bundle_stats(root: &Path) -> Result<PivotResult> {
    fsutil::require_dir(root)?;
    let files = fsutil::glob_sorted(root, "sub-*/ses-*/dwi/*_bundlestats.csv").map_err(QcError::Invalid)?;
    log::info!("Found {} bundlestats files", files.len());

    let mut result = PivotResult {
        written: 0,
        skipped: 0,
        failed: 0,
    };
    for file in &files {
        let stats = match Table::read(file) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Failed to process {}: {}", file.display(), e);
                result.failed += 1;
                continue;
            }
        };
        let Some(pivot) = pivot_bundle_table(&stats) else {
            log::warn!("Skipping {}: missing bundle_name/total_volume_mm3", file.display());
            result.skipped += 1;
            continue;
        };
        let (Some(sub), Some(ses)) = entities::subject_session_from_path(file) else {
            log::warn!("Skipping {}: no sub-/ses- directory in path", file.display());
            result.skipped += 1;
            continue;
        };
        let out = file.with_file_name(format!("{sub}_{ses}_space-ACPC_model-gqi_volume.csv"));
        pivot.write(&out)?;
        log::debug!("Wrote {}", out.display());
        result.written += 1;
    }
    Ok(result)
}

/// Stack every per-subject volume table with `subject`/`session` first, then
/// append the bundle total (missing as 0) and mean (missing skipped).
pub fn concat_bundle_volumes(root: &Path) -> Result<Table> {
    fsutil::require_dir(root)?;
    let files = fsutil::glob_sorted(root, "sub-*/ses-*/dwi/*_space-ACPC_model-gqi_volume.csv")
        .map_err(QcError::Invalid)?;
    log::info!("Found {} volume summary files", files.len());

    let mut parts = Vec::new();
    for file in &files {
        let mut t = match Table::read(file) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Failed to process {}: {}", file.display(), e);
                continue;
            }
        };
        let (sub, ses) = entities::subject_session_from_path(file);
        t.insert_constant_column(0, "subject", sub.as_deref().unwrap_or_default());
        t.insert_constant_column(1, "session", ses.as_deref().unwrap_or_default());
        parts.push(t);
    }
    if parts.is_empty() {
        return Err(QcError::Invalid(format!("no valid volume files under {}", root.display())));
    }

    let mut table = Table::concat(&parts);
    let volume_idx: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with(BUNDLE_PREFIX))
        .map(|(i, _)| i)
        .collect();

    let (totals, means): (Vec<String>, Vec<String>) = table
        .rows
        .iter()
        .map(|row| {
            let values: Vec<Option<f64>> = volume_idx.iter().map(|&i| table::parse_number(&row[i])).collect();
            (
                table::format_number(stats::sum(&values)),
                table::format_opt(stats::mean(&values)),
            )
        })
        .unzip();
    table.push_column("total_volume_all_bundles", totals);
    table.push_column("mean_bundle_volume", means);
    Ok(table)
}

/// Histograms of the two per-subject bundle summaries.
pub const BUNDLE_SUMMARY_HISTOGRAMS: &[HistogramSpec] = &[
    HistogramSpec {
        column: "total_volume_all_bundles",
        stem: "concat_bundle_volume_histogram",
        title: "Total Bundle Volume",
        x_label: "Total Volume (mm³)",
    },
    HistogramSpec {
        column: "mean_bundle_volume",
        stem: "concat_bundle_volume_mean_histogram",
        title: "Mean Bundle Volume",
        x_label: "Mean Volume (mm³)",
    },
];

/// One histogram per bundle column, into `dir/<bundle>.svg`.
pub fn bundle_histograms(table: &Table, dir: &Path, plots: &PlotSettings) -> Result<u64> {
    let mut written = 0;
    for col in table.columns.iter().filter(|c| c.starts_with(BUNDLE_PREFIX)) {
        let bundle = col.trim_start_matches(BUNDLE_PREFIX);
        let values = plot_values(table, col)?;
        let opts = plots.options(&format!("Volume Distribution: {bundle}"), "Volume (mm³)", "Frequency");
        match plot::histogram(&figure_path(dir, bundle), &values, plots.bins, true, &opts) {
            Ok(true) => written += 1,
            Ok(false) => {}
            Err(e) => log::warn!("Failed to plot {}: {}", col, e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) -> PathBuf {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn test_merge_row_keeps_meta_position() {
        let meta = vec![("sub".to_string(), "1".to_string()), ("ses".to_string(), "2".to_string())];
        let values = vec![("fd".to_string(), "0.1".to_string()), ("sub".to_string(), "01".to_string())];
        let row = merge_row(meta, values);
        assert_eq!(
            row,
            vec![
                ("sub".to_string(), "01".to_string()),
                ("ses".to_string(), "2".to_string()),
                ("fd".to_string(), "0.1".to_string()),
            ]
        );
    }

    #[test]
    fn test_median_reducer_with_filename_entities() {
        let dir = TempDir::new().unwrap();
        let p = write(
            dir.path(),
            "sub-1/ses-1/func/sub-1_ses-1_task-rest_run-01_motion.tsv",
            "framewise_displacement\trmsd\n0.1\t1\n0.3\t2\n0.2\tn/a\n",
        );
        let row = reduce_file(&p, Reducer::Median, &MetaSource::FilenameEntities).unwrap();
        let keys: Vec<&str> = row.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["sub", "ses", "task", "run", "framewise_displacement", "rmsd"]);
        assert_eq!(row[3].1, "01");
        assert_eq!(row[4].1, "0.2");
        assert_eq!(row[5].1, "1.5");
    }

    #[test]
    fn test_mean_reducer_with_first_row_columns() {
        let dir = TempDir::new().unwrap();
        let p = write(
            dir.path(),
            "sub-1/sub-1_ses-1_desc-FreeSurfer_qc.tsv",
            "Unnamed: 0\tparticipant_id\tlh_euler\trh_euler\n0\tsub-1\t-10\t-20\n1\tsub-1\t-30\t-40\n",
        );
        let meta = MetaSource::FirstRowColumns(vec![
            "participant_id".to_string(),
            "session_id".to_string(),
            "session_id".to_string(),
        ]);
        let row = reduce_file(&p, Reducer::Mean, &meta).unwrap();
        assert_eq!(
            row,
            vec![
                ("participant_id".to_string(), "sub-1".to_string()),
                ("session_id".to_string(), "n/a".to_string()),
                ("lh_euler".to_string(), "-20".to_string()),
                ("rh_euler".to_string(), "-30".to_string()),
            ]
        );
    }

    #[test]
    fn test_concat_rows_match_readable_files_and_union_columns() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "sub-1/ses-1/dwi/sub-1_ses-1_space-T1w_desc-image_qc.tsv", "mean_fd\traw_neighbor_corr\n0.2\t0.5\n");
        let b = write(dir.path(), "sub-2/ses-1/dwi/sub-2_ses-1_space-T1w_desc-image_qc.tsv", "mean_fd\textra\n0.3\tx\n");
        let c = write(dir.path(), "sub-3/ses-1/dwi/sub-3_ses-1_space-T1w_desc-image_qc.tsv", "mean_fd\n");

        let r = concat_files(&[a, b, c], Reducer::First, &MetaSource::FilenameEntities, 2).unwrap();
        assert_eq!(r.table.len(), 2);
        assert_eq!(r.failed, 1);
        assert_eq!(
            r.table.columns,
            vec!["sub", "ses", "space", "desc", "mean_fd", "raw_neighbor_corr", "extra"]
        );
        assert_eq!(r.table.rows[0][0], "1");
        assert_eq!(r.table.rows[1][6], "x");
        assert_eq!(r.table.rows[1][5], "");
    }

    #[test]
    fn test_run_source_writes_csv() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("aslprep");
        write(
            &root,
            "sub-1/ses-1/perf/sub-1_ses-1_run-01_desc-qualitycontrol_cbf.tsv",
            "sub\tses\tqei_cbf\n1\t1\t0.75\n1\t1\t0.25\n",
        );
        let out = dir.path().join("out");
        let r = run_source(QcSource::Aslprep, &root, &out, 1, &PlotSettings::default()).unwrap();
        assert_eq!(r.concat.table.len(), 1);
        let t = Table::read(&out.join("concat_aslprep_qc.csv")).unwrap();
        assert_eq!(t.columns, vec!["sub", "ses", "acq", "run", "qei_cbf"]);
        assert_eq!(t.rows[0], vec!["1", "1", "n/a", "n/a", "0.5"]);
        assert_eq!(r.figures, 1);
    }

    #[test]
    fn test_pivot_and_concat_bundles() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "sub-1/ses-1/dwi/sub-1_ses-1_bundlestats.csv",
            "bundle_name,total_volume_mm3\nAF_L,100\nAF_R,300\n",
        );
        write(
            dir.path(),
            "sub-2/ses-1/dwi/sub-2_ses-1_bundlestats.csv",
            "bundle_name,total_volume_mm3\nAF_L,50\n",
        );
        write(dir.path(), "sub-3/ses-1/dwi/sub-3_ses-1_bundlestats.csv", "name,volume\nx,1\n");

        let p = pivot_bundle_stats(dir.path()).unwrap();
        assert_eq!(p.written, 2);
        assert_eq!(p.skipped, 1);

        let t = concat_bundle_volumes(dir.path()).unwrap();
        assert_eq!(
            t.columns,
            vec![
                "subject",
                "session",
                "total_volume_mm3_AF_L",
                "total_volume_mm3_AF_R",
                "total_volume_all_bundles",
                "mean_bundle_volume"
            ]
        );
        assert_eq!(t.rows[0], vec!["sub-1", "ses-1", "100", "300", "400", "200"]);
        assert_eq!(t.rows[1], vec!["sub-2", "ses-1", "50", "", "50", "50"]);
    }
}
