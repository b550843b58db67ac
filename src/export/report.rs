//! Run statistics and CSV reporting.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{error, info, warn};

use crate::detect::DetectionResult;
use crate::error::Result;
use crate::models::gpu_instancing::{MeshGpuInstancing, TRANSLATION};
use crate::models::{self, LoadedModel};

/// Before/after counters for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct AnalysisStats {
    pub input_models: usize,
    pub initial_nodes: usize,
    pub initial_meshes: usize,
    /// Instances already declared through inbound `EXT_mesh_gpu_instancing`.
    pub initial_instances: usize,
    pub instanced_groups: usize,
    pub final_instances: usize,
    pub non_instanced_meshes: usize,
    pub final_nodes: usize,
    pub final_meshes: usize,
    /// Final instances plus non-instanced meshes: what a viewer draws.
    pub total_displayed: usize,
}

impl AnalysisStats {
    pub fn collect(loaded: &[LoadedModel], detection: &DetectionResult) -> Self {
        let mut initial_nodes = 0;
        let mut initial_meshes = 0;
        let mut initial_instances = 0;
        for model in loaded {
            initial_nodes += model.document.nodes.len();
            initial_meshes += model.document.meshes.len();
            for node in &model.document.nodes {
                let Some(extension) = MeshGpuInstancing::from_node(node) else {
                    continue;
                };
                if let Some(accessor) = extension
                    .accessor(TRANSLATION)
                    .and_then(|index| model.document.accessors.get(index))
                {
                    initial_instances += accessor.count.0 as usize;
                }
            }
        }

        let instanced_groups = detection.instanced_groups.len();
        let final_instances: usize = detection
            .instanced_groups
            .iter()
            .map(|group| group.instances.len())
            .sum();
        let non_instanced_meshes = detection.non_instanced.len();
        // One node and one mesh per group, plus one of each per non-instanced
        // entry.
        let final_nodes = instanced_groups + non_instanced_meshes;

        Self {
            input_models: loaded.len(),
            initial_nodes,
            initial_meshes,
            initial_instances,
            instanced_groups,
            final_instances,
            non_instanced_meshes,
            final_nodes,
            final_meshes: final_nodes,
            total_displayed: final_instances + non_instanced_meshes,
        }
    }

    pub fn node_reduction_pct(&self) -> f64 {
        if self.initial_nodes == 0 {
            return 0.0;
        }
        100.0 * (self.initial_nodes as f64 - self.final_nodes as f64) / self.initial_nodes as f64
    }

    pub fn initial_ratio_pct(&self) -> f64 {
        if self.total_displayed == 0 {
            return 0.0;
        }
        100.0 * self.initial_instances as f64 / self.total_displayed as f64
    }

    pub fn final_ratio_pct(&self) -> f64 {
        if self.total_displayed == 0 {
            return 0.0;
        }
        100.0 * self.final_instances as f64 / self.total_displayed as f64
    }

    pub fn ratio_delta_pct(&self) -> f64 {
        self.final_ratio_pct() - self.initial_ratio_pct()
    }

    pub fn log(&self) {
        info!("--- instancing analysis ---");
        info!(
            "initial: {} model(s), {} node(s), {} mesh(es), {} gpu instance(s)",
            self.input_models, self.initial_nodes, self.initial_meshes, self.initial_instances
        );
        info!(
            "detected: {} instanced group(s) covering {} instance(s), {} non-instanced mesh(es)",
            self.instanced_groups, self.final_instances, self.non_instanced_meshes
        );
        info!(
            "projected output: {} node(s), {} mesh(es), {} displayed mesh(es)",
            self.final_nodes, self.final_meshes, self.total_displayed
        );
        info!(
            "node reduction {} -> {} ({:.2}%)",
            self.initial_nodes,
            self.final_nodes,
            self.node_reduction_pct()
        );
        info!(
            "instancing ratio {:.2}% -> {:.2}% ({:+.2}%)",
            self.initial_ratio_pct(),
            self.final_ratio_pct(),
            self.ratio_delta_pct()
        );
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let header = "Input Models,Initial Nodes,Initial Meshes,Initial Instances,\
                      Instanced Groups,Final Instances,Non-instanced Meshes,\
                      Final Nodes,Final Meshes,Total Displayed Meshes,Node Reduction (%),\
                      Initial Instancing Ratio (%),Final Instancing Ratio (%),\
                      Instancing Increase (%)";
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{:.2},{:.2},{:.2},{:.2}",
            self.input_models,
            self.initial_nodes,
            self.initial_meshes,
            self.initial_instances,
            self.instanced_groups,
            self.final_instances,
            self.non_instanced_meshes,
            self.final_nodes,
            self.final_meshes,
            self.total_displayed,
            self.node_reduction_pct(),
            self.initial_ratio_pct(),
            self.final_ratio_pct(),
            self.ratio_delta_pct(),
        );
        std::fs::write(path, format!("{header}\n{row}\n"))?;
        info!("wrote analysis report {}", path.display());
        Ok(())
    }
}

const ID_EXPORT_SUFFIX: &str = "_IDExport.csv";

/// Cross-reference mesh names in the generated non-instanced GLB against every
/// `*_IDExport.csv` in `csv_dir`, writing `<stem>_results.csv` files into the
/// output directory.
pub fn process_csv_exports(csv_dir: &Path, output_dir: &Path) -> Result<()> {
    if !csv_dir.is_dir() {
        error!(
            "CSV directory does not exist or is not a directory: {}",
            csv_dir.display()
        );
        return Ok(());
    }
    let non_instanced_glb = output_dir.join("non_instanced_meshes.glb");
    if !non_instanced_glb.exists() {
        error!(
            "{} not found; cannot run CSV post-processing",
            non_instanced_glb.display()
        );
        return Ok(());
    }

    let model = models::read_glb(&non_instanced_glb, 0)?;
    let mesh_names: BTreeSet<String> = model
        .document
        .meshes
        .iter()
        .filter_map(|mesh| mesh.name.clone())
        .collect();
    info!(
        "{} unique mesh name(s) in {}",
        mesh_names.len(),
        non_instanced_glb.display()
    );

    for entry in std::fs::read_dir(csv_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !entry.file_type()?.is_file() || !name.ends_with(ID_EXPORT_SUFFIX) {
            continue;
        }
        if let Err(err) = process_one_export(&path, &mesh_names, output_dir) {
            warn!("failed to process {}: {err}", path.display());
        }
    }
    Ok(())
}

fn process_one_export(
    path: &Path,
    mesh_names: &BTreeSet<String>,
    output_dir: &Path,
) -> Result<()> {
    info!("processing CSV export {}", path.display());
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    if lines.next().is_none() {
        warn!("{} is empty", path.display());
        return Ok(());
    }

    let mut non_instanced_rows = Vec::new();
    let mut instanced_rows = Vec::new();
    let mut matched: BTreeSet<&str> = BTreeSet::new();
    for (line_number, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (mesh_hash, element_id) = match line.split_once(',') {
            Some((hash, id)) => (hash.trim(), id.trim()),
            None => (line, ""),
        };
        if mesh_hash.is_empty() {
            warn!(
                "skipping row {} of {}: empty mesh hash",
                line_number + 2,
                path.display()
            );
            continue;
        }
        if mesh_names.contains(mesh_hash) {
            matched.insert(mesh_hash);
            non_instanced_rows.push((mesh_hash, element_id));
        } else {
            instanced_rows.push((mesh_hash, element_id));
        }
    }
    let glb_only: Vec<&String> = mesh_names
        .iter()
        .filter(|name| !matched.contains(name.as_str()))
        .collect();

    info!(
        "comparison: {} non-instanced, {} instanced (CSV only), {} instanced (GLB only)",
        non_instanced_rows.len(),
        instanced_rows.len(),
        glb_only.len()
    );

    let mut out = String::from("Mesh Name/Hash,Component ID,Status\n");
    for (hash, id) in &non_instanced_rows {
        out.push_str(&format!("\"{hash}\",\"{id}\",\"Non-Instanced\"\n"));
    }
    for (hash, id) in &instanced_rows {
        out.push_str(&format!("\"{hash}\",\"{id}\",\"Instanced\"\n"));
    }
    for name in glb_only {
        out.push_str(&format!("\"{name}\",\"\",\"Instanced\"\n"));
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let out_path = output_dir.join(format!("{stem}_results.csv"));
    std::fs::write(&out_path, out)?;
    info!("wrote {}", out_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorOptions, InstancingDetector};
    use crate::models::fixtures::triangle_model;

    #[test]
    fn test_stats_for_plain_grouping() {
        let models = vec![
            triangle_model(0, "dup", [0.0; 3]),
            triangle_model(1, "dup", [2.0, 0.0, 0.0]),
        ];
        let detection = InstancingDetector::new(DetectorOptions::default()).detect(&models);
        let stats = AnalysisStats::collect(&models, &detection);
        assert_eq!(stats.input_models, 2);
        assert_eq!(stats.initial_nodes, 2);
        assert_eq!(stats.initial_meshes, 2);
        assert_eq!(stats.initial_instances, 0);
        assert_eq!(stats.instanced_groups, 1);
        assert_eq!(stats.final_instances, 2);
        assert_eq!(stats.final_nodes, 1);
        assert_eq!(stats.total_displayed, 2);
        assert!((stats.node_reduction_pct() - 50.0).abs() < 1e-9);
        assert!((stats.final_ratio_pct() - 100.0).abs() < 1e-9);
        assert!((stats.initial_ratio_pct() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_csv_row_shape() {
        let stats = AnalysisStats {
            input_models: 2,
            initial_nodes: 4,
            initial_meshes: 4,
            initial_instances: 0,
            instanced_groups: 1,
            final_instances: 3,
            non_instanced_meshes: 1,
            final_nodes: 2,
            final_meshes: 2,
            total_displayed: 4,
        };
        let dir = std::env::temp_dir().join(format!("glbinstancer_rep_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("instancing_analysis.csv");
        stats.write_csv(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Input Models,"));
        assert_eq!(header.split(',').count(), 14);
        let row = lines.next().unwrap();
        assert_eq!(row.split(',').count(), 14);
        assert!(row.starts_with("2,4,4,0,1,3,1,2,2,4,50.00,0.00,75.00,75.00"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_id_export_classification() {
        let dir = std::env::temp_dir().join(format!("glbinstancer_csv_{}", std::process::id()));
        let csv_dir = dir.join("csv");
        let out_dir = dir.join("out");
        std::fs::create_dir_all(&csv_dir).unwrap();
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(
            csv_dir.join("building_IDExport.csv"),
            "Mesh Hash,Element ID\nkept_mesh,100\nabsent_mesh,200\n",
        )
        .unwrap();

        let names: BTreeSet<String> =
            ["kept_mesh".to_string(), "orphan_mesh".to_string()].into();
        process_one_export(
            &csv_dir.join("building_IDExport.csv"),
            &names,
            &out_dir,
        )
        .unwrap();

        let results =
            std::fs::read_to_string(out_dir.join("building_IDExport_results.csv")).unwrap();
        assert!(results.contains("\"kept_mesh\",\"100\",\"Non-Instanced\""));
        assert!(results.contains("\"absent_mesh\",\"200\",\"Instanced\""));
        assert!(results.contains("\"orphan_mesh\",\"\",\"Instanced\""));
        std::fs::remove_dir_all(&dir).ok();
    }
}
