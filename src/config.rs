//! Tool configuration: `key = value` config files, CLI overrides, defaults.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{InstancingError, Result};

pub const DEFAULT_INSTANCE_LIMIT: usize = 2;

/// Values read from a configuration file. Every field is optional so that
/// command-line arguments can override file entries.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub input_directory: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub geometry_tolerance: Option<f64>,
    pub normal_tolerance: Option<f64>,
    pub skip_attribute_data_hash: Option<BTreeSet<String>>,
    pub merge_all_glb: Option<bool>,
    pub instance_limit: Option<usize>,
    pub mesh_segmentation: Option<bool>,
    pub csv_directory: Option<PathBuf>,
}

/// Split a comma-separated list, trimming entries and dropping empties.
pub fn split_csv(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl ConfigFile {
    /// Parse a `key = value` file. `#` and `;` start comment lines. Unknown
    /// keys and unparseable values are warned about and skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            InstancingError::Config(format!(
                "cannot read configuration file {}: {err}",
                path.display()
            ))
        })?;
        info!("loading configuration from {}", path.display());
        let mut config = Self::default();
        for (index, raw) in content.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("malformed line {line_number} in {}: {raw}", path.display());
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                warn!("empty key on line {line_number} in {}", path.display());
                continue;
            }
            match key {
                "input_directory" => config.input_directory = Some(PathBuf::from(value)),
                "output_directory" => config.output_directory = Some(PathBuf::from(value)),
                "tolerance" | "geometry_tolerance" => match value.parse() {
                    Ok(parsed) => config.geometry_tolerance = Some(parsed),
                    Err(_) => warn!("invalid value for '{key}' on line {line_number}: {value}"),
                },
                "normal_tolerance" => match value.parse::<f64>() {
                    Ok(parsed) if parsed < 0.0 => {
                        warn!("negative normal_tolerance on line {line_number} adjusted to 0");
                        config.normal_tolerance = Some(0.0);
                    }
                    Ok(parsed) => config.normal_tolerance = Some(parsed),
                    Err(_) => {
                        warn!("invalid value for 'normal_tolerance' on line {line_number}: {value}")
                    }
                },
                "skip_attribute_data_hash" => {
                    config.skip_attribute_data_hash = Some(split_csv(value))
                }
                "merge_all_glb" => match parse_bool(value) {
                    Some(parsed) => config.merge_all_glb = Some(parsed),
                    None => {
                        warn!("invalid boolean for 'merge_all_glb' on line {line_number}: {value}")
                    }
                },
                "instance_limit" => match value.parse::<usize>() {
                    Ok(parsed) if parsed >= 1 => config.instance_limit = Some(parsed),
                    Ok(_) => {
                        warn!(
                            "instance_limit on line {line_number} must be >= 1; \
                             using default {DEFAULT_INSTANCE_LIMIT}"
                        );
                        config.instance_limit = Some(DEFAULT_INSTANCE_LIMIT);
                    }
                    Err(_) => {
                        warn!("invalid value for 'instance_limit' on line {line_number}: {value}")
                    }
                },
                "mesh_segmentation" => match parse_bool(value) {
                    Some(parsed) => config.mesh_segmentation = Some(parsed),
                    None => warn!(
                        "invalid boolean for 'mesh_segmentation' on line {line_number}: {value}"
                    ),
                },
                "csv_directory" => config.csv_directory = Some(PathBuf::from(value)),
                _ => warn!("unknown configuration key on line {line_number}: {key}"),
            }
        }
        Ok(config)
    }
}

/// Command-line values; `None` means the flag was not given.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub input_directory: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub geometry_tolerance: Option<f64>,
    pub normal_tolerance: Option<f64>,
    pub skip_attribute_data_hash: Option<BTreeSet<String>>,
    pub merge_all_glb: Option<bool>,
    pub instance_limit: Option<usize>,
    pub mesh_segmentation: Option<bool>,
    pub csv_directory: Option<PathBuf>,
}

/// Fully resolved tool configuration.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub input_directory: PathBuf,
    pub output_directory: PathBuf,
    pub geometry_tolerance: f64,
    pub normal_tolerance: f64,
    pub skip_attribute_data_hash: BTreeSet<String>,
    pub merge_all_glb: bool,
    pub instance_limit: usize,
    pub mesh_segmentation: bool,
    pub csv_directory: Option<PathBuf>,
}

impl ToolConfig {
    /// Merge CLI values over file values and apply defaults and clamps.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> Result<Self> {
        let input_directory = cli
            .input_directory
            .or(file.input_directory)
            .ok_or_else(|| {
                InstancingError::Config("--input_directory must be specified".to_string())
            })?;
        let output_directory = cli
            .output_directory
            .or(file.output_directory)
            .unwrap_or_else(|| {
                let default = input_directory.join("processed_output");
                info!(
                    "output directory not specified, defaulting to {}",
                    default.display()
                );
                default
            });

        let normal_tolerance = cli
            .normal_tolerance
            .or(file.normal_tolerance)
            .unwrap_or(0.0);
        let normal_tolerance = if normal_tolerance < 0.0 {
            warn!("normal tolerance cannot be negative; using 0");
            0.0
        } else {
            normal_tolerance
        };

        let instance_limit = cli
            .instance_limit
            .or(file.instance_limit)
            .unwrap_or(DEFAULT_INSTANCE_LIMIT);
        let instance_limit = if instance_limit < 1 {
            warn!("instance limit must be >= 1; using default {DEFAULT_INSTANCE_LIMIT}");
            DEFAULT_INSTANCE_LIMIT
        } else {
            instance_limit
        };

        Ok(Self {
            input_directory,
            output_directory,
            geometry_tolerance: cli
                .geometry_tolerance
                .or(file.geometry_tolerance)
                .unwrap_or(0.0),
            normal_tolerance,
            skip_attribute_data_hash: cli
                .skip_attribute_data_hash
                .or(file.skip_attribute_data_hash)
                .unwrap_or_default(),
            merge_all_glb: cli.merge_all_glb.or(file.merge_all_glb).unwrap_or(false),
            instance_limit,
            mesh_segmentation: cli
                .mesh_segmentation
                .or(file.mesh_segmentation)
                .unwrap_or(false),
            csv_directory: cli.csv_directory.or(file.csv_directory),
        })
    }
}
