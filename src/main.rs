use anyhow::{Context, Result};
use bidsqc::config::AppConfig;
use bidsqc::curate::CurateResult;
use bidsqc::qc::concat::QcSource;
use bidsqc::table::Table;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "bidsqc", version, about = "BIDS dataset curation and QC tables")]
struct Cli {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Number of parallel workers (0 = auto-detect from config)
    #[arg(short = 'j', long, default_value = "0", global = true)]
    jobs: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    XcpdRelmat,
    FmriprepSurfaces,
    T1Mni,
}

impl From<Preset> for bidsqc::archive::UnzipPreset {
    fn from(p: Preset) -> Self {
        match p {
            Preset::XcpdRelmat => Self::XcpdRelmat,
            Preset::FmriprepSurfaces => Self::FmriprepSurfaces,
            Preset::T1Mni => Self::T1Mni,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    XcpdMotion,
    XcpdCoverage,
    Qsiprep,
    Aslprep,
    Euler,
}

impl From<Source> for QcSource {
    fn from(s: Source) -> Self {
        match s {
            Source::XcpdMotion => Self::XcpdMotion,
            Source::XcpdCoverage => Self::XcpdCoverage,
            Source::Qsiprep => Self::Qsiprep,
            Source::Aslprep => Self::Aslprep,
            Source::Euler => Self::Euler,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FirstVolume {
    Label,
    Control,
}

impl From<FirstVolume> for bidsqc::curate::sidecars::VolumeType {
    fn from(v: FirstVolume) -> Self {
        match v {
            FirstVolume::Label => Self::Label,
            FirstVolume::Control => Self::Control,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract selected members from per-subject derivative ZIP archives
    Unzip {
        /// Directory holding the archives (defaults to config derivatives_root)
        dir: Option<PathBuf>,

        /// Extraction root (defaults to the archive directory)
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Archive/member selection
        #[arg(long, value_enum, default_value = "xcpd-relmat")]
        preset: Preset,

        /// Member name substrings; replaces the preset's members
        #[arg(long)]
        member: Vec<String>,

        /// Archive glob; replaces the preset's glob
        #[arg(long)]
        archive_glob: Option<String>,
    },

    /// Curate BIDS metadata in place
    Curate {
        /// BIDS root (defaults to config bids_root)
        #[arg(long, global = true)]
        root: Option<PathBuf>,

        /// Report what would change without writing
        #[arg(long, global = true)]
        dry_run: bool,

        #[command(subcommand)]
        recipe: Recipe,
    },

    /// Map scanner series to BIDS targets from a dicominfo.tsv
    Classify {
        /// HeuDiConv dicominfo.tsv
        dicominfo: PathBuf,

        /// Write the per-series assignment table here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Concatenate QC tables and flag outliers
    Qc {
        /// Output directory (defaults to config output_dir)
        #[arg(long, global = true)]
        out_dir: Option<PathBuf>,

        #[command(subcommand)]
        step: QcStep,
    },

    /// Group mean / SD connectivity matrices for one task
    Corrmat {
        /// XCP-D output root (defaults to config derivatives_root)
        xcpd_root: Option<PathBuf>,

        /// Task entity, e.g. rest_run-03
        #[arg(long, default_value = "rest_run-03")]
        task: String,

        /// Atlas name in the seg- entity
        #[arg(long, default_value = "4S1056Parcels")]
        atlas: String,

        /// Atlas dseg TSV (defaults to <xcpd_root>/atlases/atlas-<atlas>/atlas-<atlas>_dseg.tsv)
        #[arg(long)]
        dseg: Option<PathBuf>,

        /// CSV with an excluded_scans column
        #[arg(long)]
        exclude_scans: Option<PathBuf>,

        /// CSV with an excluded_regions column
        #[arg(long)]
        exclude_regions: Option<PathBuf>,

        /// Output directory (defaults to config output_dir)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Heatmap width and height in pixels
        #[arg(long, default_value = "1000")]
        size: u32,
    },
}

#[derive(Subcommand)]
enum Recipe {
    /// ASL sidecars: BackgroundSuppression, LabelingDuration, M0Type
    AslKeys,
    /// Point each m0scan's IntendedFor at its ASL run
    IntendedFor,
    /// Field map sidecars: reduction factor, PF direction, B0FieldIdentifier
    FmapKeys,
    /// DWI sidecars: PartialFourierDirection = y
    DwiPartialFourier,
    /// m0scan sidecars: RepetitionTimePreparation = 5
    M0RepetitionTime,
    /// Phase MEGRE sidecars: Units = arbitrary (dry run unless --apply)
    MegreUnits {
        #[arg(long)]
        apply: bool,
    },
    /// Write <stem>_aslcontext.tsv for each ASL series
    Aslcontext {
        /// Type of the first volume
        #[arg(long, value_enum, default_value = "label")]
        first: FirstVolume,
    },
    /// run-N_rec-norm_T1w → rec-norm_run-N_T1w
    RenameAnat,
    /// Rename fmap JSONs for the listed subject/session pairs
    RenameFmap {
        /// File with one "<sub> <ses>" pair per line
        list: PathBuf,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// acq-VARIANTObliquity_<m>_ → acq-<m>VARIANTObliquity_
    FixObliquity,
    /// Move swi/*_qsm series to anat/*_part-<mag|phase>_MEGRE
    SwiToMegre,
    /// Build anonymised <sub>/sessions.tsv from scans.tsv acq_time
    CreateSessions {
        /// Tree holding the scans.tsv files (defaults to --root)
        #[arg(long)]
        scans_root: Option<PathBuf>,
    },
    /// sessions.tsv: rename datetime to acq_time
    SessionsColumn,
    /// <sub>/sessions.tsv → <sub>/<sub>_sessions.tsv
    SessionsFile,
    /// Move every scans.tsv acq_time to 1800-01-01, keeping the clock time
    ShiftScanDates,
    /// Remove the operator column from every scans.tsv
    DropOperator,
    /// One row per subject with the first session's scan date
    Scan1Summary {
        /// Output TSV
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum QcStep {
    /// Stack one pipeline's per-subject QC files
    Concat {
        #[arg(value_enum)]
        source: Source,

        /// Pipeline derivatives root (defaults to config derivatives_root)
        input: Option<PathBuf>,
    },
    /// Pivot each bundlestats.csv into a one-row volume table
    Pivot {
        /// QSIRecon root (defaults to config derivatives_root)
        root: Option<PathBuf>,
    },
    /// Concatenate per-subject bundle volumes
    Bundles {
        /// QSIRecon root (defaults to config derivatives_root)
        root: Option<PathBuf>,
    },
    /// Column, row and missing-value outlier tables for bundle volumes
    Outliers {
        /// Concatenated bundle table (defaults to <out_dir>/concatenated_bundle_volume.csv)
        table: Option<PathBuf>,

        /// k in mean ± k·SD (defaults to config)
        #[arg(long)]
        sd: Option<f64>,
    },
    /// Low-coverage parcel counts per scan and per parcel
    Coverage {
        /// Coverage table (defaults to <out_dir>/concat_xcpd_qc_coverage.csv)
        table: Option<PathBuf>,

        /// Coverage threshold (defaults to config)
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Isolation Forest flags for scans and parcels
    Isolation {
        /// Coverage table (defaults to <out_dir>/concat_xcpd_qc_coverage.csv)
        table: Option<PathBuf>,
    },
    /// Scatter diffusion QC metrics against bundle outlier counts
    Merge {
        /// QSIPrep QC table (defaults to <out_dir>/concat_qsiprep_qc.csv)
        #[arg(long)]
        qc: Option<PathBuf>,

        /// Row outlier table (defaults to <out_dir>/row_sum_bundle_volume.csv)
        #[arg(long)]
        outliers: Option<PathBuf>,
    },
}

/// CLI argument, else config value, else a clear error.
fn resolve_path(arg: Option<PathBuf>, fallback: &Option<PathBuf>, key: &str) -> Result<PathBuf> {
    arg.or_else(|| fallback.clone())
        .with_context(|| format!("No path given. Pass it as an argument or set {key} in config."))
}

fn read_table(path: &Path) -> Result<Table> {
    Table::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();
    let workers = if cli.jobs > 0 { cli.jobs } else { config.resolve_workers() };
    let plots = config.plots.settings();

    match cli.command {
        Commands::Unzip {
            dir,
            dest,
            preset,
            member,
            archive_glob,
        } => {
            let dir = resolve_path(dir, &config.derivatives_root, "derivatives_root")?;
            let dest = dest.unwrap_or_else(|| dir.clone());
            let preset = bidsqc::archive::UnzipPreset::from(preset);
            let patterns: Vec<String> = if member.is_empty() {
                preset.members().iter().map(|m| m.to_string()).collect()
            } else {
                member
            };
            let glob = archive_glob.as_deref().unwrap_or(preset.archive_glob());
            let result = bidsqc::archive::extract_all(&dir, glob, &patterns, &dest)
                .context("Unzip failed")?;
            println!(
                "Unzip complete: {} archives, {} members extracted, {} errors",
                result.archives, result.extracted, result.errors
            );
        }

        Commands::Curate { root, dry_run, recipe } => {
            let root = resolve_path(root, &config.bids_root, "bids_root")?;
            let dry_run = match &recipe {
                Recipe::MegreUnits { apply } => dry_run || !apply,
                _ => dry_run,
            };
            if dry_run {
                println!("DRY RUN: no files will be changed");
            }
            run_recipe(recipe, &root, dry_run)?;
            if dry_run {
                println!("(dry run, re-run without --dry-run to apply)");
            }
        }

        Commands::Classify { dicominfo, output } => {
            let seqs = bidsqc::heuristic::SeqInfo::read_dicominfo(&dicominfo)
                .with_context(|| format!("Failed to read {}", dicominfo.display()))?;
            let info = bidsqc::heuristic::infotodict(&seqs);
            for (target, ids) in &info {
                println!("{:<90} {}", target.template(), ids.join(","));
            }
            let matched: usize = info.values().map(Vec::len).sum();
            if let Some(out) = output {
                bidsqc::heuristic::assignments_table(&seqs)
                    .write(&out)
                    .with_context(|| format!("Failed to write {}", out.display()))?;
            }
            println!(
                "Classify complete: {} series, {} matched, {} unmatched",
                seqs.len(),
                matched,
                seqs.len() - matched
            );
        }

        Commands::Qc { out_dir, step } => {
            let out_dir = resolve_path(out_dir, &config.output_dir, "output_dir")?;
            run_qc(step, &out_dir, &config, workers, &plots)?;
        }

        Commands::Corrmat {
            xcpd_root,
            task,
            atlas,
            dseg,
            exclude_scans,
            exclude_regions,
            out_dir,
            size,
        } => {
            let xcpd_root = resolve_path(xcpd_root, &config.derivatives_root, "derivatives_root")?;
            let out_dir = resolve_path(out_dir, &config.output_dir, "output_dir")?;
            let read_ids = |path: Option<PathBuf>, column: &str| -> Result<BTreeSet<String>> {
                match path {
                    Some(p) => bidsqc::corrmat::read_id_list(&p, column)
                        .with_context(|| format!("Failed to read {}", p.display())),
                    None => Ok(BTreeSet::new()),
                }
            };
            let req = bidsqc::corrmat::CorrmatRequest {
                dseg: dseg.unwrap_or_else(|| bidsqc::corrmat::default_dseg(&xcpd_root, &atlas)),
                excluded_scans: read_ids(exclude_scans, "excluded_scans")?,
                excluded_regions: read_ids(exclude_regions, "excluded_regions")?,
                xcpd_root,
                atlas,
                task,
                out_dir,
                width: size,
            };
            let result = bidsqc::corrmat::run(&req).context("Correlation matrix summary failed")?;
            println!(
                "Corrmat complete: {} matrices found, {} used, {} files written",
                result.found,
                result.used,
                result.outputs.len()
            );
        }
    }

    Ok(())
}

fn run_recipe(recipe: Recipe, root: &Path, dry_run: bool) -> Result<()> {
    use bidsqc::curate::{rename, sessions, sidecars};

    let (what, result): (&str, CurateResult) = match recipe {
        Recipe::AslKeys => ("ASL keys", sidecars::asl_keys(root, dry_run)?),
        Recipe::IntendedFor => ("IntendedFor", sidecars::intended_for(root, dry_run)?),
        Recipe::FmapKeys => ("Fmap keys", sidecars::fmap_keys(root, dry_run)?),
        Recipe::DwiPartialFourier => ("DWI PartialFourierDirection", sidecars::dwi_partial_fourier(root, dry_run)?),
        Recipe::M0RepetitionTime => ("M0 RepetitionTimePreparation", sidecars::m0_repetition_time(root, dry_run)?),
        Recipe::MegreUnits { .. } => ("MEGRE Units", sidecars::megre_phase_units(root, dry_run)?),
        Recipe::Aslcontext { first } => ("aslcontext", sidecars::aslcontext(root, first.into(), dry_run)?),
        Recipe::RenameAnat => ("Anat rename", rename::rename_misordered_anat(root, dry_run)?),
        Recipe::RenameFmap { list, from, to } => {
            let text = std::fs::read_to_string(&list)
                .with_context(|| format!("Failed to read {}", list.display()))?;
            let pairs = rename::parse_subject_sessions(&text)?;
            ("Fmap rename", rename::rename_fmap_variants(root, &pairs, &from, &to, dry_run)?)
        }
        Recipe::FixObliquity => ("Obliquity rename", rename::fix_variant_obliquity(root, dry_run)?),
        Recipe::SwiToMegre => ("SWI to MEGRE", rename::swi_to_megre(root, dry_run)?),
        Recipe::CreateSessions { scans_root } => {
            let scans_root = scans_root.unwrap_or_else(|| root.to_path_buf());
            ("Sessions", sessions::create_sessions(&scans_root, dry_run)?)
        }
        Recipe::SessionsColumn => ("Sessions column", sessions::rename_sessions_column(root, dry_run)?),
        Recipe::SessionsFile => ("Sessions file", sessions::rename_sessions_file(root, dry_run)?),
        Recipe::ShiftScanDates => ("Scan dates", sessions::shift_scan_dates(root, dry_run)?),
        Recipe::DropOperator => ("Operator column", sessions::drop_operator_column(root, dry_run)?),
        Recipe::Scan1Summary { output } => {
            let summary = sessions::scan1_summary(root).context("Scan summary failed")?;
            summary
                .write(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Scan summary complete: {} subjects → {}", summary.len(), output.display());
            return Ok(());
        }
    };
    println!("{}", result.summary(what));
    Ok(())
}

fn run_qc(
    step: QcStep,
    out_dir: &Path,
    config: &AppConfig,
    workers: usize,
    plots: &bidsqc::qc::PlotSettings,
) -> Result<()> {
    use bidsqc::qc::{concat, isolation, merge, outliers};

    let default_table = |arg: Option<PathBuf>, name: &str| arg.unwrap_or_else(|| out_dir.join(name));

    match step {
        QcStep::Concat { source, input } => {
            let input = resolve_path(input, &config.derivatives_root, "derivatives_root")?;
            let result = concat::run_source(source.into(), &input, out_dir, workers, plots)
                .context("Concatenation failed")?;
            println!(
                "Concat complete: {} files, {} rows, {} failed, {} figures → {}",
                result.concat.files,
                result.concat.table.len(),
                result.concat.failed,
                result.figures,
                result.output.display()
            );
        }

        QcStep::Pivot { root } => {
            let root = resolve_path(root, &config.derivatives_root, "derivatives_root")?;
            let result = concat::pivot_bundle_stats(&root).context("Pivot failed")?;
            println!(
                "Pivot complete: {} written, {} skipped, {} failed",
                result.written, result.skipped, result.failed
            );
        }

        QcStep::Bundles { root } => {
            let root = resolve_path(root, &config.derivatives_root, "derivatives_root")?;
            let table = concat::concat_bundle_volumes(&root).context("Bundle concatenation failed")?;
            let output = out_dir.join("concatenated_bundle_volume.csv");
            table
                .write(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            let mut figures = concat::draw_histograms(&table, concat::BUNDLE_SUMMARY_HISTOGRAMS, out_dir, plots)?;
            figures += concat::bundle_histograms(&table, &out_dir.join("bundle_histograms"), plots)?;
            println!(
                "Bundles complete: {} subjects, {} figures → {}",
                table.len(),
                figures,
                output.display()
            );
        }

        QcStep::Outliers { table, sd } => {
            let path = default_table(table, "concatenated_bundle_volume.csv");
            let k = sd.unwrap_or(config.outliers.sd_multiplier);
            let report = outliers::run_bundle_outliers(&read_table(&path)?, out_dir, k, plots)
                .context("Outlier tables failed")?;
            println!(
                "Outliers complete (mean ± {}·SD): {} tables, {} figures",
                k,
                report.tables.len(),
                report.figures
            );
        }

        QcStep::Coverage { table, threshold } => {
            let path = default_table(table, "concat_xcpd_qc_coverage.csv");
            let threshold = threshold.unwrap_or(config.outliers.coverage_threshold);
            let report = outliers::run_coverage(&read_table(&path)?, out_dir, threshold, plots)
                .context("Coverage counts failed")?;
            println!(
                "Coverage complete (threshold {}): {} tables, {} figures",
                threshold,
                report.tables.len(),
                report.figures
            );
        }

        QcStep::Isolation { table } => {
            let path = default_table(table, "concat_xcpd_qc_coverage.csv");
            let result = isolation::flag_coverage_outliers(&read_table(&path)?, &config.outliers.forest(), workers)
                .context("Isolation forest failed")?;
            isolation::write_outputs(&result, out_dir)?;
            println!(
                "Isolation complete: {} of {} scans and {} parcels flagged",
                result.row_outliers,
                result.row_flagged.len(),
                result.region_outliers
            );
        }

        QcStep::Merge { qc, outliers } => {
            let qc = read_table(&default_table(qc, "concat_qsiprep_qc.csv"))?;
            let rows = read_table(&default_table(outliers, "row_sum_bundle_volume.csv"))?;
            let result = merge::run_merge(&qc, &rows, out_dir, plots).context("Merge failed")?;
            println!("Merge complete: {} rows, {} figures", result.rows, result.figures);
        }
    }

    Ok(())
}
