//! QC tables: per-pipeline concatenation, threshold and Isolation Forest
//! outlier flags, QC-vs-outlier comparison.

pub mod concat;
pub mod isolation;
pub mod merge;
pub mod outliers;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::plot::PlotOptions;

#[derive(Error, Debug)]
pub enum QcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Table error: {0}")]
    Table(#[from] crate::table::TableError),
    #[error("Plot error: {0}")]
    Plot(#[from] crate::plot::PlotError),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, QcError>;

/// Figure settings shared by every QC command.
#[derive(Debug, Clone, Copy)]
pub struct PlotSettings {
    pub bins: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for PlotSettings {
    fn default() -> Self {
        Self {
            bins: 20,
            width: 800,
            height: 500,
        }
    }
}

impl PlotSettings {
    pub fn options(&self, title: &str, x_label: &str, y_label: &str) -> PlotOptions {
        PlotOptions::new(title, x_label, y_label).size(self.width, self.height)
    }
}

/// `<dir>/<stem>.svg`
pub fn figure_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.svg"))
}

/// Numeric values of a column with missing cells as NaN (for plotting).
pub fn plot_values(table: &crate::table::Table, column: &str) -> Result<Vec<f64>> {
    Ok(table
        .numeric_column(column)?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}
