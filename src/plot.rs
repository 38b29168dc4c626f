//! Diagnostic figures rendered to SVG with plotters.
//!
//! Every function returns `Ok(false)` without writing anything when the
//! input has no finite values.

use std::collections::BTreeMap;
use std::path::Path;

use plotters::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Render error in {path}: {message}")]
    Render { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, PlotError>;

/// Title, axis labels and canvas size.
#[derive(Debug, Clone)]
pub struct PlotOptions {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub width: u32,
    pub height: u32,
}

impl PlotOptions {
    pub fn new(title: &str, x_label: &str, y_label: &str) -> Self {
        Self {
            title: title.to_string(),
            x_label: x_label.to_string(),
            y_label: y_label.to_string(),
            width: 800,
            height: 500,
        }
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

const BAR_COLOR: RGBColor = RGBColor(70, 130, 180);
const KDE_COLOR: RGBColor = RGBColor(31, 119, 180);

fn render_err<E: std::fmt::Display>(path: &Path, e: E) -> PlotError {
    PlotError::Render {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn prepare(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (lo.is_finite() && hi.is_finite()).then_some((lo, hi))
}

/// Widen a degenerate range so axes can be drawn.
fn padded(lo: f64, hi: f64) -> (f64, f64) {
    if hi > lo { (lo, hi) } else { (lo - 0.5, hi + 0.5) }
}

/// Equal-width bin counts over `[lo, hi]`; the last bin is closed.
pub fn bin_counts(values: &[f64], bins: usize, lo: f64, hi: f64) -> Vec<u64> {
    let bins = bins.max(1);
    let mut counts = vec![0u64; bins];
    let width = (hi - lo) / bins as f64;
    for &v in values {
        let idx = if width > 0.0 {
            (((v - lo) / width).floor() as usize).min(bins - 1)
        } else {
            0
        };
        counts[idx] += 1;
    }
    counts
}

/// Gaussian KDE bandwidth by Scott's rule.
fn scott_bandwidth(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let present: Vec<Option<f64>> = values.iter().map(|v| Some(*v)).collect();
    let sd = crate::stats::sample_std(&present)?;
    let h = sd * (n as f64).powf(-0.2);
    (h > 0.0).then_some(h)
}

/// Gaussian kernel density at each of `xs`.
pub fn kde(values: &[f64], bandwidth: f64, xs: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let norm = 1.0 / (n * bandwidth * (2.0 * std::f64::consts::PI).sqrt());
    xs.iter()
        .map(|x| {
            values
                .iter()
                .map(|v| {
                    let z = (x - v) / bandwidth;
                    (-0.5 * z * z).exp()
                })
                .sum::<f64>()
                * norm
        })
        .collect()
}

/// Histogram with `bins` equal-width bins, optionally with a KDE curve scaled to counts.
pub fn histogram(path: &Path, values: &[f64], bins: usize, with_kde: bool, opts: &PlotOptions) -> Result<bool> {
    let data = finite(values);
    let Some((lo, hi)) = min_max(&data) else {
        log::warn!("No finite values for {}; plot skipped", path.display());
        return Ok(false);
    };
    let (lo, hi) = padded(lo, hi);
    let bins = bins.max(1);
    let counts = bin_counts(&data, bins, lo, hi);
    let width = (hi - lo) / bins as f64;

    let curve: Vec<(f64, f64)> = match with_kde.then(|| scott_bandwidth(&data)).flatten() {
        Some(h) => {
            let xs: Vec<f64> = (0..=200).map(|i| lo + (hi - lo) * i as f64 / 200.0).collect();
            let scale = data.len() as f64 * width;
            let ys = kde(&data, h, &xs);
            xs.into_iter().zip(ys.into_iter().map(|d| d * scale)).collect()
        }
        None => Vec::new(),
    };

    let y_max = counts
        .iter()
        .map(|c| *c as f64)
        .chain(curve.iter().map(|(_, y)| *y))
        .fold(1.0, f64::max)
        * 1.05;

    prepare(path)?;
    let root = SVGBackend::new(path, (opts.width, opts.height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| render_err(path, e))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(&opts.title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(lo..hi, 0f64..y_max)
        .map_err(|e| render_err(path, e))?;
    chart
        .configure_mesh()
        .x_desc(opts.x_label.as_str())
        .y_desc(opts.y_label.as_str())
        .draw()
        .map_err(|e| render_err(path, e))?;

    chart
        .draw_series(counts.iter().enumerate().map(|(i, c)| {
            let x0 = lo + i as f64 * width;
            Rectangle::new([(x0, 0.0), (x0 + width, *c as f64)], BAR_COLOR.mix(0.6).filled())
        }))
        .map_err(|e| render_err(path, e))?;

    if !curve.is_empty() {
        chart
            .draw_series(LineSeries::new(curve, KDE_COLOR.stroke_width(2)))
            .map_err(|e| render_err(path, e))?;
    }

    root.present().map_err(|e| render_err(path, e))?;
    log::info!("Saved {}", path.display());
    Ok(true)
}

/// One bin per integer from min to max, optionally on a log y axis.
pub fn discrete_histogram(path: &Path, values: &[f64], log_y: bool, opts: &PlotOptions) -> Result<bool> {
    let data = finite(values);
    let Some((lo, hi)) = min_max(&data) else {
        log::warn!("No finite values for {}; plot skipped", path.display());
        return Ok(false);
    };
    let (lo, hi) = (lo.floor(), hi.floor());
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for v in &data {
        *counts.entry(v.floor() as i64).or_default() += 1;
    }
    let y_max = counts.values().copied().max().unwrap_or(1) as f64;

    prepare(path)?;
    let root = SVGBackend::new(path, (opts.width, opts.height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| render_err(path, e))?;

    let mut builder = ChartBuilder::on(&root);
    builder
        .caption(&opts.title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50);
    let bars = counts.iter().map(|(k, c)| (*k as f64, *c as f64));

    if log_y {
        let mut chart = builder
            .build_cartesian_2d(lo..hi + 1.0, (0.5f64..y_max * 2.0).log_scale())
            .map_err(|e| render_err(path, e))?;
        chart
            .configure_mesh()
            .x_desc(opts.x_label.as_str())
            .y_desc(opts.y_label.as_str())
            .draw()
            .map_err(|e| render_err(path, e))?;
        chart
            .draw_series(bars.map(|(x, c)| {
                Rectangle::new([(x, 0.5), (x + 1.0, c)], RGBColor(255, 140, 0).filled())
            }))
            .map_err(|e| render_err(path, e))?;
    } else {
        let mut chart = builder
            .build_cartesian_2d(lo..hi + 1.0, 0f64..y_max * 1.05)
            .map_err(|e| render_err(path, e))?;
        chart
            .configure_mesh()
            .x_desc(opts.x_label.as_str())
            .y_desc(opts.y_label.as_str())
            .draw()
            .map_err(|e| render_err(path, e))?;
        chart
            .draw_series(bars.map(|(x, c)| Rectangle::new([(x, 0.0), (x + 1.0, c)], BAR_COLOR.filled())))
            .map_err(|e| render_err(path, e))?;
    }

    root.present().map_err(|e| render_err(path, e))?;
    log::info!("Saved {}", path.display());
    Ok(true)
}

/// Frequency of each distinct integer value, one bar per value present.
pub fn value_counts(values: &[f64]) -> BTreeMap<i64, u64> {
    let mut counts = BTreeMap::new();
    for v in finite(values) {
        *counts.entry(v.round() as i64).or_default() += 1;
    }
    counts
}

pub fn bar_counts(path: &Path, values: &[f64], opts: &PlotOptions) -> Result<bool> {
    let counts = value_counts(values);
    if counts.is_empty() {
        log::warn!("No finite values for {}; plot skipped", path.display());
        return Ok(false);
    }
    let n = counts.len();
    let y_max = counts.values().copied().max().unwrap_or(1) as f64 * 1.05;

    prepare(path)?;
    let root = SVGBackend::new(path, (opts.width, opts.height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| render_err(path, e))?;

    let labels: Vec<String> = counts.keys().map(|k| k.to_string()).collect();
    let mut chart = ChartBuilder::on(&root)
        .caption(&opts.title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0f64..n as f64, 0f64..y_max)
        .map_err(|e| render_err(path, e))?;
    chart
        .configure_mesh()
        .x_labels(n.min(40))
        .x_label_formatter(&|x| {
            let i = x.floor() as usize;
            labels.get(i).cloned().unwrap_or_default()
        })
        .x_desc(opts.x_label.as_str())
        .y_desc(opts.y_label.as_str())
        .draw()
        .map_err(|e| render_err(path, e))?;

    chart
        .draw_series(counts.values().enumerate().map(|(i, c)| {
            let x = i as f64;
            Rectangle::new([(x + 0.1, 0.0), (x + 0.9, *c as f64)], RGBColor(60, 179, 113).filled())
        }))
        .map_err(|e| render_err(path, e))?;

    root.present().map_err(|e| render_err(path, e))?;
    log::info!("Saved {}", path.display());
    Ok(true)
}

/// Scatter of paired values; pairs with a non-finite member are dropped.
pub fn scatter(path: &Path, xs: &[f64], ys: &[f64], opts: &PlotOptions) -> Result<bool> {
    let points: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| (*x, *y))
        .collect();
    if points.is_empty() {
        log::warn!("No finite points for {}; plot skipped", path.display());
        return Ok(false);
    }
    let px: Vec<f64> = points.iter().map(|p| p.0).collect();
    let py: Vec<f64> = points.iter().map(|p| p.1).collect();
    let (x0, x1) = min_max(&px).map(|(a, b)| padded(a, b)).unwrap_or((0.0, 1.0));
    let (y0, y1) = min_max(&py).map(|(a, b)| padded(a, b)).unwrap_or((0.0, 1.0));
    let (dx, dy) = ((x1 - x0) * 0.05, (y1 - y0) * 0.05);

    prepare(path)?;
    let root = SVGBackend::new(path, (opts.width, opts.height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| render_err(path, e))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(&opts.title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x0 - dx..x1 + dx, y0 - dy..y1 + dy)
        .map_err(|e| render_err(path, e))?;
    chart
        .configure_mesh()
        .x_desc(opts.x_label.as_str())
        .y_desc(opts.y_label.as_str())
        .draw()
        .map_err(|e| render_err(path, e))?;

    chart
        .draw_series(points.iter().map(|p| Circle::new(*p, 4, BAR_COLOR.mix(0.7).filled())))
        .map_err(|e| render_err(path, e))?;

    root.present().map_err(|e| render_err(path, e))?;
    log::info!("Saved {}", path.display());
    Ok(true)
}

/// Diverging and sequential colour maps for matrix plots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colormap {
    Seismic,
    Reds,
}

impl Colormap {
    fn stops(&self) -> &'static [(u8, u8, u8)] {
        match self {
            Self::Seismic => &[(0, 0, 77), (0, 0, 255), (255, 255, 255), (255, 0, 0), (128, 0, 0)],
            Self::Reds => &[
                (255, 245, 240),
                (254, 224, 210),
                (252, 187, 161),
                (252, 146, 114),
                (251, 106, 74),
                (239, 59, 44),
                (203, 24, 29),
                (165, 15, 21),
                (103, 0, 13),
            ],
        }
    }

    /// Colour for `t` in `[0, 1]` (clamped), linearly interpolated between stops.
    pub fn color(&self, t: f64) -> RGBColor {
        let stops = self.stops();
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let pos = t * (stops.len() - 1) as f64;
        let i = (pos.floor() as usize).min(stops.len() - 2);
        let f = pos - i as f64;
        let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * f).round() as u8;
        let (a, b) = (stops[i], stops[i + 1]);
        RGBColor(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
    }
}

/// Colour scaling and block annotations for [`heatmap`].
#[derive(Debug, Clone)]
pub struct HeatmapOptions {
    pub colormap: Colormap,
    pub range: (f64, f64),
    /// Indices where a new block starts; lines are drawn there.
    pub separators: Vec<usize>,
    /// Block labels, centred on each block along both axes.
    pub labels: Vec<(f64, String)>,
    /// Matrices wider than this are block-averaged for display.
    pub max_cells: usize,
}

/// Average `factor × factor` blocks, ignoring missing cells.
fn downsample(matrix: &[Vec<f64>], factor: usize) -> Vec<Vec<f64>> {
    let n = matrix.len();
    let m = n.div_ceil(factor);
    (0..m)
        .map(|bi| {
            (0..m)
                .map(|bj| {
                    let mut sum = 0.0;
                    let mut count = 0usize;
                    for row in matrix.iter().skip(bi * factor).take(factor) {
                        for v in row.iter().skip(bj * factor).take(factor) {
                            if v.is_finite() {
                                sum += v;
                                count += 1;
                            }
                        }
                    }
                    if count > 0 { sum / count as f64 } else { f64::NAN }
                })
                .collect()
        })
        .collect()
}

/// Square matrix heatmap with a colour bar. Non-finite cells are left blank.
pub fn heatmap(path: &Path, matrix: &[Vec<f64>], hm: &HeatmapOptions, opts: &PlotOptions) -> Result<bool> {
    let n = matrix.len();
    if n == 0 || !matrix.iter().flatten().any(|v| v.is_finite()) {
        log::warn!("No finite values for {}; plot skipped", path.display());
        return Ok(false);
    }

    let factor = if hm.max_cells > 0 { n.div_ceil(hm.max_cells).max(1) } else { 1 };
    let shown = if factor > 1 { downsample(matrix, factor) } else { matrix.to_vec() };
    let cells = shown.len() as f64;
    let scale = 1.0 / factor as f64;
    let (lo, hi) = hm.range;
    let span = if hi > lo { hi - lo } else { 1.0 };

    prepare(path)?;
    let root = SVGBackend::new(path, (opts.width, opts.height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| render_err(path, e))?;
    let (main, bar) = root.split_horizontally(opts.width.saturating_sub(90) as i32);

    let mut chart = ChartBuilder::on(&main)
        .caption(&opts.title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(120)
        .build_cartesian_2d(0f64..cells, 0f64..cells)
        .map_err(|e| render_err(path, e))?;

    chart
        .draw_series(shown.iter().enumerate().flat_map(|(i, row)| {
            let y_top = cells - i as f64;
            row.iter().enumerate().filter(|(_, v)| v.is_finite()).map(move |(j, v)| {
                let color = hm.colormap.color((v - lo) / span);
                Rectangle::new([(j as f64, y_top), (j as f64 + 1.0, y_top - 1.0)], color.filled())
            })
        }))
        .map_err(|e| render_err(path, e))?;

    for &s in &hm.separators {
        let b = s as f64 * scale;
        chart
            .draw_series(LineSeries::new([(b, 0.0), (b, cells)], BLACK.stroke_width(1)))
            .map_err(|e| render_err(path, e))?;
        chart
            .draw_series(LineSeries::new([(0.0, cells - b), (cells, cells - b)], BLACK.stroke_width(1)))
            .map_err(|e| render_err(path, e))?;
    }

    let label_style = ("sans-serif", 11).into_font().color(&BLACK);
    for (centre, label) in &hm.labels {
        let c = centre * scale;
        let (lx, ly) = chart.backend_coord(&(0.0, cells - c));
        main.draw(&Text::new(label.clone(), (lx - 115, ly - 5), label_style.clone()))
            .map_err(|e| render_err(path, e))?;
        let (bx, by) = chart.backend_coord(&(c, 0.0));
        main.draw(&Text::new(label.clone(), (bx - 10, by + 5), label_style.clone()))
            .map_err(|e| render_err(path, e))?;
    }

    let mut legend = ChartBuilder::on(&bar)
        .margin_top(40)
        .margin_bottom(30)
        .margin_right(10)
        .y_label_area_size(45)
        .build_cartesian_2d(0f64..1f64, lo..lo + span)
        .map_err(|e| render_err(path, e))?;
    legend
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .disable_x_axis()
        .y_labels(5)
        .draw()
        .map_err(|e| render_err(path, e))?;
    let steps = 100;
    legend
        .draw_series((0..steps).map(|k| {
            let y0 = lo + span * k as f64 / steps as f64;
            let y1 = lo + span * (k + 1) as f64 / steps as f64;
            Rectangle::new([(0.0, y0), (1.0, y1)], hm.colormap.color(k as f64 / steps as f64).filled())
        }))
        .map_err(|e| render_err(path, e))?;

    root.present().map_err(|e| render_err(path, e))?;
    log::info!("Saved {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bin_counts_closed_last_bin() {
        let counts = bin_counts(&[0.0, 0.5, 1.0, 2.0], 2, 0.0, 2.0);
        assert_eq!(counts, vec![2, 2]);
    }

    #[test]
    fn test_kde_integrates_to_one() {
        let data = [0.0, 1.0, 1.5, 3.0];
        let xs: Vec<f64> = (0..=2000).map(|i| -10.0 + 23.0 * i as f64 / 2000.0).collect();
        let ys = kde(&data, 0.8, &xs);
        let dx = 23.0 / 2000.0;
        let area: f64 = ys.iter().sum::<f64>() * dx;
        assert!((area - 1.0).abs() < 1e-3, "area = {area}");
    }

    #[test]
    fn test_value_counts() {
        let counts = value_counts(&[0.0, 2.0, 2.0, f64::NAN, 5.0]);
        assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![(0, 1), (2, 2), (5, 1)]);
    }

    #[test]
    fn test_colormap_endpoints() {
        assert_eq!(Colormap::Seismic.color(0.5), RGBColor(255, 255, 255));
        assert_eq!(Colormap::Seismic.color(-3.0), RGBColor(0, 0, 77));
        assert_eq!(Colormap::Reds.color(1.0), RGBColor(103, 0, 13));
    }

    #[test]
    fn test_downsample_ignores_missing() {
        let m = vec![
            vec![1.0, 3.0, 5.0],
            vec![f64::NAN, 2.0, 5.0],
            vec![0.0, 0.0, f64::NAN],
        ];
        let d = downsample(&m, 2);
        assert_eq!(d.len(), 2);
        assert_eq!(d[0][0], 2.0);
        assert_eq!(d[0][1], 5.0);
        assert!(d[1][1].is_nan());
    }

    #[test]
    fn test_histogram_writes_svg() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("figs/hist.svg");
        let opts = PlotOptions::new("Median FD distribution", "Median FD", "Count");
        let written = histogram(&p, &[0.1, 0.2, 0.2, 0.35, f64::NAN], 20, true, &opts).unwrap();
        assert!(written);
        let svg = std::fs::read_to_string(&p).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_empty_input_not_written() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("empty.svg");
        let opts = PlotOptions::new("t", "x", "y");
        assert!(!histogram(&p, &[f64::NAN], 20, false, &opts).unwrap());
        assert!(!scatter(&p, &[1.0], &[f64::NAN], &opts).unwrap());
        assert!(!p.exists());
    }

    #[test]
    fn test_heatmap_writes_svg() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("mean.svg");
        let m = vec![vec![0.0, 0.4], vec![0.4, f64::NAN]];
        let hm = HeatmapOptions {
            colormap: Colormap::Seismic,
            range: (-1.0, 1.0),
            separators: vec![1],
            labels: vec![(0.5, "Vis".to_string()), (1.5, "Default".to_string())],
            max_cells: 400,
        };
        assert!(heatmap(&p, &m, &hm, &PlotOptions::new("Mean", "", "")).unwrap());
        assert!(p.exists());
    }
}
