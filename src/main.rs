use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;

use glbinstancer::config::{self, CliOverrides, ConfigFile, ToolConfig};
use glbinstancer::detect::{DetectorOptions, InstancingDetector};
use glbinstancer::export::{report, tileset, EmitMode, GlbWriter, WriteOutcome};
use glbinstancer::models;

/// Detects meshes repeated across GLB tiles and rewrites them as
/// EXT_mesh_gpu_instancing nodes.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory containing GLB files (and tileset.json manifests) to process
    #[arg(long = "input_directory")]
    input_directory: Option<PathBuf>,

    /// Output directory; defaults to <input_directory>/processed_output
    #[arg(long = "output_directory")]
    output_directory: Option<PathBuf>,

    /// `key = value` configuration file; command-line values win
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity
    #[arg(long = "log-level", value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Geometric tolerance for POSITION comparison (0 = exact matching)
    #[arg(long)]
    tolerance: Option<f64>,

    /// Tolerance for NORMAL comparison in tolerance mode (negative clamps to 0)
    #[arg(long = "normal-tolerance")]
    normal_tolerance: Option<f64>,

    /// Comma-separated attributes whose data is not hashed in tolerance mode
    /// (POSITION is always excluded there)
    #[arg(long = "skip-attribute-data-hash")]
    skip_attribute_data_hash: Option<String>,

    /// Merge all GLB outputs into a single file per type
    #[arg(long = "merge-all-glb")]
    merge_all_glb: bool,

    /// Minimum number of matching meshes to form an instanced group
    #[arg(long = "instance-limit")]
    instance_limit: Option<usize>,

    /// Export every mesh of the generated outputs as its own GLB
    #[arg(long = "mesh-segmentation")]
    mesh_segmentation: bool,

    /// Directory with *_IDExport.csv files for post-processing
    #[arg(long = "csv-dir")]
    csv_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    None,
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::None => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Verbose => LevelFilter::TRACE,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level.filter())
        .with_target(false)
        .init();
    info!("glbinstancer starting");

    let file = match &args.config {
        Some(path) => ConfigFile::load(path)
            .wrap_err_with(|| format!("failed to load configuration file {}", path.display()))?,
        None => ConfigFile::default(),
    };
    let cli = CliOverrides {
        input_directory: args.input_directory,
        output_directory: args.output_directory,
        geometry_tolerance: args.tolerance,
        normal_tolerance: args.normal_tolerance,
        skip_attribute_data_hash: args
            .skip_attribute_data_hash
            .as_deref()
            .map(config::split_csv),
        merge_all_glb: args.merge_all_glb.then_some(true),
        instance_limit: args.instance_limit,
        mesh_segmentation: args.mesh_segmentation.then_some(true),
        csv_directory: args.csv_dir,
    };
    let config = ToolConfig::resolve(file, cli)?;

    if !config.input_directory.is_dir() {
        return Err(eyre!(
            "input directory does not exist or is not a directory: {}",
            config.input_directory.display()
        ));
    }
    std::fs::create_dir_all(&config.output_directory).wrap_err_with(|| {
        format!(
            "failed to create output directory {}",
            config.output_directory.display()
        )
    })?;

    // Stage 1: discover, load, detect, write combined outputs.
    info!(
        "stage 1: discovering GLB files under {}",
        config.input_directory.display()
    );
    let paths = models::discover_glb_files(&config.input_directory, true);
    if paths.is_empty() {
        info!("no GLB files found in the input directory");
        return Ok(());
    }
    let loaded = models::load_models(&paths);
    if loaded.is_empty() {
        return Err(eyre!("failed to load any GLB models"));
    }
    info!("loaded {} model(s)", loaded.len());

    let mut detector = InstancingDetector::new(DetectorOptions {
        geometry_tolerance: config.geometry_tolerance,
        normal_tolerance: config.normal_tolerance,
        skip_attribute_data_hash: config.skip_attribute_data_hash.clone(),
        instance_limit: config.instance_limit,
    });
    let detection = detector.detect(&loaded);

    let stats = report::AnalysisStats::collect(&loaded, &detection);
    stats.log();
    let analysis_path = config.output_directory.join("instancing_analysis.csv");
    if let Err(err) = stats.write_csv(&analysis_path) {
        error!("failed to write {}: {err}", analysis_path.display());
    }

    if config.merge_all_glb {
        // The combined writers already consolidate every input model.
        debug!("--merge-all-glb requested; outputs are consolidated either way");
    }

    let mut writer = GlbWriter::new();
    let mut stage1_outputs: Vec<PathBuf> = Vec::new();
    let write_stage1 = |writer: &mut GlbWriter,
                            outputs: &mut Vec<PathBuf>,
                            file_name: &str,
                            mode: EmitMode|
     -> Option<WriteOutcome> {
        let path = config.output_directory.join(file_name);
        match writer.write_combined(&loaded, &detection, &path, mode) {
            Ok(outcome) => {
                outputs.push(outcome.path.clone());
                Some(outcome)
            }
            Err(err) => {
                error!("failed to write {}: {err}", path.display());
                None
            }
        }
    };
    let instanced = write_stage1(
        &mut writer,
        &mut stage1_outputs,
        "instanced_meshes.glb",
        EmitMode::InstancedOnly,
    );
    let non_instanced = write_stage1(
        &mut writer,
        &mut stage1_outputs,
        "non_instanced_meshes.glb",
        EmitMode::NonInstancedOnly,
    );

    for (outcome, manifest) in [
        (&instanced, "tileset_instanced.json"),
        (&non_instanced, "tileset_non_instanced.json"),
    ] {
        let Some(outcome) = outcome else { continue };
        if !outcome.bounds.is_valid() {
            info!("skipping {manifest}: output has no valid bounds");
            continue;
        }
        let diagonal = (outcome.bounds.max - outcome.bounds.min).length();
        let geometric_error = (diagonal * 0.1).max(1.0);
        debug!("root geometric error for {manifest}: {geometric_error}");
        let manifest_path = config.output_directory.join(manifest);
        if let Err(err) = tileset::write_tileset(&[outcome], &manifest_path, geometric_error) {
            error!("failed to write {}: {err}", manifest_path.display());
        }
    }

    // Stage 2: per-mesh segmentation of the stage-1 outputs.
    if config.mesh_segmentation {
        if stage1_outputs.is_empty() {
            info!("stage 2: no stage-1 outputs to segment");
        } else {
            let segmented_dir = config.output_directory.join("segmented_glb_output");
            std::fs::create_dir_all(&segmented_dir).wrap_err_with(|| {
                format!("failed to create {}", segmented_dir.display())
            })?;
            let reload: BTreeSet<PathBuf> = stage1_outputs.iter().cloned().collect();
            let segment_models = models::load_models(&reload);
            if segment_models.is_empty() {
                warn!("stage 2: could not reload any stage-1 output for segmentation");
            } else {
                match writer.write_segmented(&segment_models, &segmented_dir) {
                    Ok(written) => info!(
                        "stage 2: wrote {} segmented GLB(s) to {}",
                        written.len(),
                        segmented_dir.display()
                    ),
                    Err(err) => error!("stage 2: mesh segmentation failed: {err}"),
                }
            }
        }
    } else {
        info!("stage 2: mesh segmentation disabled");
    }

    // Stage 3: CSV post-processing.
    match &config.csv_directory {
        Some(csv_dir) => {
            info!("stage 3: CSV processing against {}", csv_dir.display());
            if let Err(err) = report::process_csv_exports(csv_dir, &config.output_directory) {
                error!("stage 3: CSV processing failed: {err}");
            }
        }
        None => info!("stage 3: CSV processing disabled (no --csv-dir)"),
    }

    info!("glbinstancer finished");
    Ok(())
}
