use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::qc::PlotSettings;
use crate::qc::isolation::ForestParams;

/// Settings from `~/.config/bidsqc/config.toml`. Every field is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// BIDS dataset root (curation commands without a path argument).
    pub bids_root: Option<PathBuf>,
    /// Derivatives root (`unzip`, `qc concat`, `corrmat` without a path argument).
    pub derivatives_root: Option<PathBuf>,
    /// Where concatenated tables and figures go.
    pub output_dir: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub outliers: OutlierConfig,
    pub plots: PlotConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// k in mean ± k·SD.
    pub sd_multiplier: f64,
    /// Parcel coverage below this counts as low.
    pub coverage_threshold: f64,
    pub iforest_trees: usize,
    pub iforest_seed: u64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            sd_multiplier: 3.0,
            coverage_threshold: 0.5,
            iforest_trees: 100,
            iforest_seed: 42,
        }
    }
}

impl OutlierConfig {
    pub fn forest(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.iforest_trees,
            seed: self.iforest_seed,
            ..ForestParams::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PlotConfig {
    pub bins: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for PlotConfig {
    fn default() -> Self {
        let d = PlotSettings::default();
        Self {
            bins: d.bins,
            width: d.width,
            height: d.height,
        }
    }
}

impl PlotConfig {
    pub fn settings(&self) -> PlotSettings {
        PlotSettings {
            bins: self.bins.max(1),
            width: self.width,
            height: self.height,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/bidsqc/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
