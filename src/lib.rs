pub mod archive;
pub mod config;
pub mod corrmat;
pub mod curate;
pub mod entities;
pub mod fsutil;
pub mod heuristic;
pub mod plot;
pub mod qc;
pub mod sidecar;
pub mod stats;
pub mod table;

/// Application name for XDG paths
pub const APP_NAME: &str = "bidsqc";
