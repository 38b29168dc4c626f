//! Group connectivity matrices: Fisher-z mean and SD over per-scan
//! parcel × parcel correlation matrices, ordered by network community.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::fsutil;
use crate::plot::{self, Colormap, HeatmapOptions, PlotOptions};
use crate::table::{self, Table, TableError};

#[derive(Error, Debug)]
pub enum CorrmatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Table error: {0}")]
    Table(#[from] TableError),
    #[error("Plot error: {0}")]
    Plot(#[from] plot::PlotError),
    #[error("No correlation matrices selected for task-{0}")]
    NoMatrices(String),
    #[error("{path}: {rows}x{cols} matrix, atlas has {expected} regions")]
    Shape {
        path: String,
        rows: usize,
        cols: usize,
        expected: usize,
    },
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CorrmatError>;

/// Atlas names standing in for a missing network label.
const ATLAS_NETWORKS: &[(&str, &str)] = &[
    ("CIT168Subcortical", "Subcortical"),
    ("ThalamusHCP", "Thalamus"),
    ("SubcorticalHCP", "Subcortical"),
];

const CLIP: f64 = 0.999_999;

/// Region labels and their network, in atlas order.
#[derive(Debug, Clone, PartialEq)]
pub struct Atlas {
    pub labels: Vec<String>,
    pub networks: Vec<String>,
}

impl Atlas {
    pub fn read(path: &Path) -> Result<Self> {
        Self::from_table(&Table::read(path)?)
    }

    /// `network_label`, else `atlas_name` mapped to a network.
    pub fn from_table(dseg: &Table) -> Result<Self> {
        let labels = dseg.column("label")?.into_iter().map(str::to_string).collect();
        let network = dseg.column("network_label")?;
        let atlas = dseg.column("atlas_name")?;
        let networks = network
            .into_iter()
            .zip(atlas)
            .map(|(n, a)| {
                let name = if table::is_missing(n) { a } else { n };
                ATLAS_NETWORKS
                    .iter()
                    .find(|(from, _)| *from == name)
                    .map_or(name, |(_, to)| *to)
                    .to_string()
            })
            .collect();
        Ok(Self { labels, networks })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Node order grouping each network together, networks in order of first appearance.
#[derive(Debug, Clone, PartialEq)]
pub struct Communities {
    pub order: Vec<usize>,
    /// `(network, start, end)` blocks in display order; `end` is exclusive.
    pub blocks: Vec<(String, usize, usize)>,
}

impl Communities {
    pub fn from_networks(networks: &[String]) -> Self {
        let mut rank: HashMap<&str, usize> = HashMap::new();
        for n in networks {
            let next = rank.len();
            rank.entry(n.as_str()).or_insert(next);
        }
        let mut order: Vec<usize> = (0..networks.len()).collect();
        order.sort_by_key(|&i| rank[networks[i].as_str()]);

        let mut blocks: Vec<(String, usize, usize)> = Vec::new();
        for (pos, &node) in order.iter().enumerate() {
            let net = &networks[node];
            if let Some(block) = blocks.last_mut().filter(|b| b.0 == *net) {
                block.2 = pos + 1;
            } else {
                blocks.push((net.clone(), pos, pos + 1));
            }
        }
        Self { order, blocks }
    }

    /// Block starts after the first, where separator lines go.
    pub fn separators(&self) -> Vec<usize> {
        self.blocks.iter().skip(1).map(|(_, start, _)| *start).collect()
    }

    /// Block names at the centre of each block.
    pub fn labels(&self) -> Vec<(f64, String)> {
        self.blocks
            .iter()
            .map(|(name, start, end)| ((*start + *end) as f64 / 2.0, name.clone()))
            .collect()
    }
}

/// Trimmed, non-empty values of `column` in a CSV list file.
pub fn read_id_list(path: &Path, column: &str) -> Result<BTreeSet<String>> {
    let t = Table::read(path)?;
    Ok(t.column(column)?
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// Whether `path` belongs to an excluded scan ID (`/<id>/` or `/<id>_`).
fn is_excluded(path: &str, excluded: &BTreeSet<String>) -> bool {
    excluded
        .iter()
        .any(|id| path.contains(&format!("/{id}/")) || path.contains(&format!("/{id}_")))
}

/// Matrices of `task-<task>` that no excluded scan ID matches.
pub fn select_matrices(files: &[PathBuf], task: &str, excluded: &BTreeSet<String>) -> Vec<PathBuf> {
    let tag = format!("task-{task}");
    let for_task: Vec<&PathBuf> = files
        .iter()
        .filter(|p| p.to_string_lossy().contains(&tag))
        .collect();
    log::info!("Total {} scans found: {}", tag, for_task.len());
    let selected: Vec<PathBuf> = for_task
        .into_iter()
        .filter(|p| !is_excluded(&p.to_string_lossy(), excluded))
        .cloned()
        .collect();
    log::info!("Included scans after exclusion: {}", selected.len());
    selected
}

/// A relmat TSV without its `Node` index column; missing cells are NaN.
pub fn read_matrix(path: &Path) -> Result<Vec<Vec<f64>>> {
    let mut t = Table::read(path)?;
    t.drop_column("Node");
    Ok(t.rows
        .iter()
        .map(|r| r.iter().map(|c| table::parse_number(c).unwrap_or(f64::NAN)).collect())
        .collect())
}

/// Running element-wise Fisher-z mean and population variance, skipping NaN.
#[derive(Debug)]
pub struct ZAccumulator {
    size: usize,
    count: Vec<u32>,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl ZAccumulator {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            count: vec![0; size * size],
            mean: vec![0.0; size * size],
            m2: vec![0.0; size * size],
        }
    }

    /// Clip `r` to ±0.999999, take `arctanh` and fold it in.
    pub fn add(&mut self, matrix: &[Vec<f64>]) {
        for (i, row) in matrix.iter().enumerate() {
            for (j, r) in row.iter().enumerate() {
                if r.is_nan() {
                    continue;
                }
                let z = r.clamp(-CLIP, CLIP).atanh();
                let k = i * self.size + j;
                self.count[k] += 1;
                let delta = z - self.mean[k];
                self.mean[k] += delta / self.count[k] as f64;
                self.m2[k] += delta * (z - self.mean[k]);
            }
        }
    }

    fn grid(&self, cell: impl Fn(usize) -> f64) -> Vec<Vec<f64>> {
        (0..self.size)
            .map(|i| (0..self.size).map(|j| cell(i * self.size + j)).collect())
            .collect()
    }

    /// `(mean_z, sd_z)`; cells never observed are NaN.
    pub fn finish(&self) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let mean = self.grid(|k| if self.count[k] == 0 { f64::NAN } else { self.mean[k] });
        let sd = self.grid(|k| {
            if self.count[k] == 0 {
                f64::NAN
            } else {
                (self.m2[k] / self.count[k] as f64).sqrt()
            }
        });
        (mean, sd)
    }
}

/// Reorder rows and columns, zero the diagonal, back-transform with `tanh`,
/// then blank the rows/columns of excluded regions (original indices).
pub fn finalize(z: &[Vec<f64>], order: &[usize], excluded: &[usize]) -> Vec<Vec<f64>> {
    let blank: BTreeSet<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, node)| excluded.contains(node))
        .map(|(pos, _)| pos)
        .collect();
    order
        .iter()
        .enumerate()
        .map(|(pi, &i)| {
            order
                .iter()
                .enumerate()
                .map(|(pj, &j)| {
                    if blank.contains(&pi) || blank.contains(&pj) {
                        f64::NAN
                    } else if pi == pj {
                        0.0
                    } else {
                        z[i][j].tanh()
                    }
                })
                .collect()
        })
        .collect()
}

/// Square matrix as a table with a `Node` label column; NaN is written blank.
pub fn matrix_table(matrix: &[Vec<f64>], labels: &[String]) -> Table {
    let mut columns = vec!["Node".to_string()];
    columns.extend(labels.iter().cloned());
    let mut t = Table::new(columns);
    for (label, row) in labels.iter().zip(matrix) {
        let mut cells = vec![label.clone()];
        cells.extend(row.iter().map(|&v| table::format_number(v)));
        t.rows.push(cells);
    }
    t
}

/// Inputs of one `corrmat` run.
#[derive(Debug, Clone)]
pub struct CorrmatRequest {
    pub xcpd_root: PathBuf,
    pub dseg: PathBuf,
    pub atlas: String,
    pub task: String,
    pub excluded_scans: BTreeSet<String>,
    pub excluded_regions: BTreeSet<String>,
    pub out_dir: PathBuf,
    pub width: u32,
}

pub struct CorrmatResult {
    pub found: u64,
    pub used: u64,
    pub outputs: Vec<PathBuf>,
}

/// Default atlas dseg location under an XCP-D output root.
pub fn default_dseg(xcpd_root: &Path, atlas: &str) -> PathBuf {
    xcpd_root
        .join("atlases")
        .join(format!("atlas-{atlas}"))
        .join(format!("atlas-{atlas}_dseg.tsv"))
}

pub fn run(req: &CorrmatRequest) -> Result<CorrmatResult> {
    let atlas = Atlas::read(&req.dseg)?;
    if atlas.is_empty() {
        return Err(CorrmatError::Invalid(format!("{} lists no regions", req.dseg.display())));
    }
    let communities = Communities::from_networks(&atlas.networks);
    let excluded_idx: Vec<usize> = atlas
        .labels
        .iter()
        .enumerate()
        .filter(|(_, l)| req.excluded_regions.contains(l.as_str()))
        .map(|(i, _)| i)
        .collect();

    fsutil::require_dir(&req.xcpd_root)?;
    let pattern = format!(
        "sub-*/ses-*/func/*seg-{}_stat-pearsoncorrelation_relmat.tsv",
        req.atlas
    );
    let files = fsutil::glob_sorted(&req.xcpd_root, &pattern).map_err(CorrmatError::Invalid)?;
    let selected = select_matrices(&files, &req.task, &req.excluded_scans);
    if selected.is_empty() {
        return Err(CorrmatError::NoMatrices(req.task.clone()));
    }

    let pb = ProgressBar::new(selected.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    let n = atlas.len();
    let mut acc = ZAccumulator::new(n);
    for path in &selected {
        let m = read_matrix(path)?;
        let cols = m.first().map_or(0, Vec::len);
        if m.len() != n || m.iter().any(|r| r.len() != n) {
            return Err(CorrmatError::Shape {
                path: path.display().to_string(),
                rows: m.len(),
                cols,
                expected: n,
            });
        }
        acc.add(&m);
        pb.inc(1);
    }
    pb.finish_with_message(format!("Done: {} matrices", selected.len()));

    let (mean_z, sd_z) = acc.finish();
    let ordered_labels: Vec<String> = communities.order.iter().map(|&i| atlas.labels[i].clone()).collect();
    let stem = format!("XCPD_task-{}", req.task);
    let opts = PlotOptions::new("", "", "").size(req.width, req.width);
    let mut outputs = Vec::new();

    for (z, suffix, colormap, range) in [
        (mean_z, "Mean", Colormap::Seismic, (-1.0, 1.0)),
        (sd_z, "StandardDeviation", Colormap::Reds, (0.0, 0.6)),
    ] {
        let matrix = finalize(&z, &communities.order, &excluded_idx);
        let csv = req.out_dir.join(format!("{stem}_{suffix}.csv"));
        matrix_table(&matrix, &ordered_labels).write(&csv)?;
        log::info!("Saved {}", csv.display());
        outputs.push(csv);

        let hm = HeatmapOptions {
            colormap,
            range,
            separators: communities.separators(),
            labels: communities.labels(),
            max_cells: 400,
        };
        let svg = req.out_dir.join(format!("{stem}_{suffix}.svg"));
        if plot::heatmap(&svg, &matrix, &hm, &opts)? {
            outputs.push(svg);
        }
    }

    Ok(CorrmatResult {
        found: files.len() as u64,
        used: selected.len() as u64,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats;
    use tempfile::TempDir;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn write(root: &Path, rel: &str, body: &str) -> PathBuf {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn test_network_label_falls_back_to_atlas() {
        let dseg = Table {
            columns: strings(&["index", "label", "network_label", "atlas_name"]),
            rows: vec![
                strings(&["1", "L_V1", "Visual", "Glasser"]),
                strings(&["2", "Thal_1", "", "ThalamusHCP"]),
                strings(&["3", "Amyg", "n/a", "CIT168Subcortical"]),
                strings(&["4", "Cb", "", "Cerebellum"]),
            ],
        };
        let atlas = Atlas::from_table(&dseg).unwrap();
        assert_eq!(atlas.networks, strings(&["Visual", "Thalamus", "Subcortical", "Cerebellum"]));
        assert_eq!(atlas.labels[1], "Thal_1");
    }

    #[test]
    fn test_community_order_is_stable_by_first_appearance() {
        let nets = strings(&["B", "A", "B", "C", "A"]);
        let c = Communities::from_networks(&nets);
        assert_eq!(c.order, vec![0, 2, 1, 4, 3]);
        assert_eq!(
            c.blocks,
            vec![("B".to_string(), 0, 2), ("A".to_string(), 2, 4), ("C".to_string(), 4, 5)]
        );
        assert_eq!(c.separators(), vec![2, 4]);
        assert_eq!(c.labels()[0], (1.0, "B".to_string()));
    }

    #[test]
    fn test_select_matrices_excludes_ids() {
        let files: Vec<PathBuf> = [
            "/x/sub-1/ses-1/func/sub-1_ses-1_task-rest_run-03_relmat.tsv",
            "/x/sub-2/ses-1/func/sub-2_ses-1_task-rest_run-03_relmat.tsv",
            "/x/sub-22/ses-1/func/sub-22_ses-1_task-rest_run-03_relmat.tsv",
            "/x/sub-3/ses-1/func/sub-3_ses-1_task-nback_relmat.tsv",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        let excluded: BTreeSet<String> = ["sub-2".to_string()].into();
        let selected = select_matrices(&files, "rest_run-03", &excluded);
        assert_eq!(selected, vec![files[0].clone(), files[2].clone()]);
    }

    #[test]
    fn test_fisher_z_mean_and_sd() {
        let a = vec![vec![1.0, 0.5], vec![0.5, 1.0]];
        let b = vec![vec![1.0, -0.5], vec![f64::NAN, 1.0]];
        let mut acc = ZAccumulator::new(2);
        acc.add(&a);
        acc.add(&b);
        let (mean, sd) = acc.finish();
        assert!(mean[0][1].abs() < 1e-12);
        assert!((sd[0][1] - 0.5f64.atanh()).abs() < 1e-12);
        assert!((mean[1][0] - 0.5f64.atanh()).abs() < 1e-12);
        assert_eq!(sd[1][0], 0.0);
        assert!((mean[0][0] - CLIP.atanh()).abs() < 1e-9);
    }

    #[test]
    fn test_streaming_sd_matches_population_std() {
        let rs = [0.1, 0.35, -0.2, 0.8, 0.45];
        let mut acc = ZAccumulator::new(1);
        for r in rs {
            acc.add(&[vec![r]]);
        }
        let (mean, sd) = acc.finish();
        let zs: Vec<Option<f64>> = rs.iter().map(|r| Some(r.atanh())).collect();
        assert!((mean[0][0] - stats::mean(&zs).unwrap()).abs() < 1e-12);
        assert!((sd[0][0] - stats::population_std(&zs).unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_finalize_reorders_and_blanks() {
        let z = vec![
            vec![9.0, 0.1, 0.2],
            vec![0.1, 9.0, 0.3],
            vec![0.2, 0.3, 9.0],
        ];
        let m = finalize(&z, &[2, 0, 1], &[1]);
        assert_eq!(m[0][0], 0.0);
        assert!((m[0][1] - 0.2f64.tanh()).abs() < 1e-12);
        assert!(m[2].iter().all(|v| v.is_nan()));
        assert!(m[0][2].is_nan());
    }

    #[test]
    fn test_run_writes_outputs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("xcpd");
        let dseg = write(
            &root,
            "atlases/atlas-Test/atlas-Test_dseg.tsv",
            "index\tlabel\tnetwork_label\tatlas_name\n1\tr1\tVis\tX\n2\tr2\tDMN\tX\n3\tr3\tVis\tX\n",
        );
        let body = "Node\tr1\tr2\tr3\nr1\t1\t0.2\t0.4\nr2\t0.2\t1\t-0.1\nr3\t0.4\t-0.1\t1\n";
        for sub in ["sub-1", "sub-2", "sub-3"] {
            write(
                &root,
                &format!("{sub}/ses-1/func/{sub}_ses-1_task-rest_seg-Test_stat-pearsoncorrelation_relmat.tsv"),
                body,
            );
        }
        let out = dir.path().join("figs");
        let req = CorrmatRequest {
            xcpd_root: root.clone(),
            dseg,
            atlas: "Test".to_string(),
            task: "rest".to_string(),
            excluded_scans: ["sub-3".to_string()].into(),
            excluded_regions: ["r2".to_string()].into(),
            out_dir: out.clone(),
            width: 400,
        };
        let result = run(&req).unwrap();
        assert_eq!(result.found, 3);
        assert_eq!(result.used, 2);

        let mean = Table::read(&out.join("XCPD_task-rest_Mean.csv")).unwrap();
        assert_eq!(mean.columns, strings(&["Node", "r1", "r3", "r2"]));
        assert_eq!(mean.cell(0, "r1"), Some("0"));
        assert_eq!(mean.cell(0, "r2"), Some(""));
        let r13: f64 = mean.cell(0, "r3").unwrap().parse().unwrap();
        assert!((r13 - 0.4).abs() < 1e-9);
        assert!(out.join("XCPD_task-rest_StandardDeviation.svg").exists());
    }

    #[test]
    fn test_run_without_matrices_fails() {
        let dir = TempDir::new().unwrap();
        let dseg = write(dir.path(), "dseg.tsv", "label\tnetwork_label\tatlas_name\nr1\tVis\tX\n");
        let req = CorrmatRequest {
            xcpd_root: dir.path().to_path_buf(),
            dseg,
            atlas: "Test".to_string(),
            task: "rest".to_string(),
            excluded_scans: BTreeSet::new(),
            excluded_regions: BTreeSet::new(),
            out_dir: dir.path().join("out"),
            width: 400,
        };
        assert!(matches!(run(&req), Err(CorrmatError::NoMatrices(_))));
    }
}
