//! Isolation Forest outlier flags for the parcel coverage table.
//!
//! Rows (scans) and, after transposing, columns (parcels) are scored
//! separately. A score above 0.5 marks an outlier (`-1`), anything else an
//! inlier (`1`).

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::outliers::{COVERAGE_META, value_columns};
use super::{QcError, Result};
use crate::stats;
use crate::table::{self, Table};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// Upper bound on the per-tree subsample; the data size caps it.
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn path_length(&self, x: &[f64], depth: usize) -> f64 {
        match self {
            Node::Leaf { size } => depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let next = if x[*feature] < *threshold { left } else { right };
                next.path_length(x, depth + 1)
            }
        }
    }
}

fn grow(data: &[Vec<f64>], idx: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || idx.len() <= 1 {
        return Node::Leaf { size: idx.len() };
    }

    let n_features = data[idx[0]].len();
    let ranges: Vec<(usize, f64, f64)> = (0..n_features)
        .filter_map(|f| {
            let (lo, hi) = idx.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(data[i][f]), hi.max(data[i][f]))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if ranges.is_empty() {
        return Node::Leaf { size: idx.len() };
    }

    let (feature, lo, hi) = ranges[rng.random_range(0..ranges.len())];
    let threshold = rng.random_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) = idx.into_iter().partition(|&i| data[i][feature] < threshold);
    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(data, left, depth + 1, limit, rng)),
        right: Box::new(grow(data, right, depth + 1, limit, rng)),
    }
}

/// Per-tree seed; SplitMix64 finaliser over the base seed and tree index.
fn tree_seed(seed: u64, tree: usize) -> u64 {
    let mut x = seed ^ ((tree as u64) << 1);
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Grow the trees in parallel on the current rayon pool. `data` is
    /// row-major (`data[sample][feature]`) and must not contain NaN.
    pub fn fit(data: &[Vec<f64>], params: &ForestParams) -> Self {
        let sample_size = params.max_samples.min(data.len());
        let limit = (sample_size.max(1) as f64).log2().ceil() as usize;
        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(tree_seed(params.seed, t));
                let idx = rand::seq::index::sample(&mut rng, data.len(), sample_size).into_vec();
                grow(data, idx, 0, limit, &mut rng)
            })
            .collect();
        Self { trees, sample_size }
    }

    /// Anomaly score in `(0, 1]`; higher is more isolated.
    pub fn score(&self, x: &[f64]) -> f64 {
        let norm = average_path_length(self.sample_size);
        if self.trees.is_empty() || norm == 0.0 {
            return 0.5;
        }
        let mean = self.trees.iter().map(|t| t.path_length(x, 0)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean / norm)
    }

    /// `-1` for outliers (score > 0.5), `1` otherwise.
    pub fn predict(&self, data: &[Vec<f64>]) -> Vec<i8> {
        data.par_iter()
            .map(|x| if self.score(x) > 0.5 { -1 } else { 1 })
            .collect()
    }
}

/// Parcel values of every row, each missing cell replaced by its column mean
/// (0 when the whole column is missing).
pub fn imputed_matrix(table: &Table, cols: &[usize]) -> Vec<Vec<f64>> {
    let means: Vec<f64> = cols
        .iter()
        .map(|&c| {
            let values: Vec<Option<f64>> = table.rows.iter().map(|r| table::parse_number(&r[c])).collect();
            stats::mean(&values).unwrap_or(0.0)
        })
        .collect();
    table
        .rows
        .iter()
        .map(|r| {
            cols.iter()
                .zip(&means)
                .map(|(&c, &m)| table::parse_number(&r[c]).filter(|v| v.is_finite()).unwrap_or(m))
                .collect()
        })
        .collect()
}

fn transpose(m: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let width = m.first().map_or(0, Vec::len);
    (0..width).map(|j| m.iter().map(|row| row[j]).collect()).collect()
}

pub struct IsolationResult {
    pub row_flagged: Table,
    pub full: Table,
    pub row_outliers: u64,
    pub region_outliers: u64,
}

fn count_outliers(flags: &[i8]) -> u64 {
    flags.iter().filter(|&&f| f < 0).count() as u64
}

/// Flag outlying scans (`individual_outlier`) and parcels (a trailing
/// `region_outlier_flag` row behind a leading index column).
pub fn flag_coverage_outliers(table: &Table, params: &ForestParams, jobs: usize) -> Result<IsolationResult> {
    let cols = value_columns(table, COVERAGE_META);
    if table.is_empty() || cols.is_empty() {
        return Err(QcError::Invalid("coverage table has no parcel values".to_string()));
    }
    let matrix = imputed_matrix(table, &cols);
    let regions = transpose(&matrix);

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build()?;
    let (row_flags, region_flags) = pool.install(|| {
        let rows = IsolationForest::fit(&matrix, params).predict(&matrix);
        let regions = IsolationForest::fit(&regions, params).predict(&regions);
        (rows, regions)
    });
    log::info!(
        "Isolation forest: {}/{} scans and {}/{} parcels flagged",
        count_outliers(&row_flags),
        row_flags.len(),
        count_outliers(&region_flags),
        region_flags.len()
    );

    let mut row_flagged = table.clone();
    row_flagged.push_column("individual_outlier", row_flags.iter().map(i8::to_string).collect());

    let mut full = row_flagged.clone();
    let mut region_row: Vec<(String, String)> = vec![(String::new(), "region_outlier_flag".to_string())];
    region_row.extend(
        cols.iter()
            .zip(&region_flags)
            .map(|(&c, f)| (table.columns[c].clone(), f.to_string())),
    );
    full.insert_constant_column(0, "", "");
    for (i, row) in full.rows.iter_mut().enumerate() {
        row[0] = i.to_string();
    }
    full.push_row_map(region_row);

    Ok(IsolationResult {
        row_outliers: count_outliers(&row_flags),
        region_outliers: count_outliers(&region_flags),
        row_flagged,
        full,
    })
}

/// Write both flagged tables into `out_dir`; returns their paths.
pub fn write_outputs(result: &IsolationResult, out_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let rows = out_dir.join("concat_xcpd_qc_coverage_with_row_outlier_flag.csv");
    let full = out_dir.join("concat_xcpd_qc_coverage_with_column_and_row_flag.csv");
    result.row_flagged.write(&rows)?;
    result.full.write(&full)?;
    log::info!("Saved {} and {}", rows.display(), full.display());
    Ok((rows, full))
}
