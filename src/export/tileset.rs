//! Minimal 3D Tiles 1.1 manifest emission for generated GLB outputs.

use std::path::Path;

use serde_json::json;
use tracing::info;

use super::WriteOutcome;
use crate::error::Result;
use crate::math::BoundingBox;

/// Convert a y-up glTF box (center + three half-axes) to the z-up frame 3D
/// Tiles viewers expect.
fn box_to_z_up(b: [f64; 12]) -> [f64; 12] {
    [
        b[0], -b[2], b[1], // center
        b[3], b[4], b[5], // x half-axis
        b[6], b[11], b[8], // y half-axis takes the z extent
        b[9], b[10], b[7], // z half-axis takes the y extent
    ]
}

fn tile_for(outcome: &WriteOutcome, geometric_error: f64) -> serde_json::Value {
    json!({
        "boundingVolume": { "box": box_to_z_up(outcome.bounds.to_tileset_box()) },
        "geometricError": geometric_error,
        "refine": "REPLACE",
        "content": {
            "uri": outcome
                .path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
        },
    })
}

/// Write a manifest whose root tile spans all given outputs, with one child
/// tile per GLB.
pub fn write_tileset(
    outputs: &[&WriteOutcome],
    path: &Path,
    geometric_error: f64,
) -> Result<()> {
    let mut root_bounds = BoundingBox::default();
    for outcome in outputs {
        root_bounds.merge(&outcome.bounds);
    }
    let children: Vec<serde_json::Value> = outputs
        .iter()
        .map(|outcome| tile_for(outcome, geometric_error))
        .collect();
    let tileset = json!({
        "asset": { "version": "1.1" },
        "geometricError": geometric_error,
        "root": {
            "boundingVolume": { "box": box_to_z_up(root_bounds.to_tileset_box()) },
            "geometricError": geometric_error,
            "refine": "REPLACE",
            "children": children,
        },
    });
    std::fs::write(path, serde_json::to_string_pretty(&tileset)?)?;
    info!("wrote tileset {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use std::path::PathBuf;

    #[test]
    fn test_axis_swap() {
        // Center (1, 2, 3) with half extents (4, 5, 6) in y-up.
        let swapped = box_to_z_up([
            1.0, 2.0, 3.0, //
            4.0, 0.0, 0.0, //
            0.0, 5.0, 0.0, //
            0.0, 0.0, 6.0,
        ]);
        assert_eq!(&swapped[0..3], &[1.0, -3.0, 2.0]);
        assert_eq!(swapped[3], 4.0);
        assert_eq!(swapped[7], 6.0);
        assert_eq!(swapped[11], 5.0);
    }

    #[test]
    fn test_manifest_shape() {
        let outcome = WriteOutcome {
            path: PathBuf::from("/out/instanced_meshes.glb"),
            bounds: BoundingBox {
                min: DVec3::ZERO,
                max: DVec3::ONE,
            },
        };
        let dir = std::env::temp_dir().join(format!("glbinstancer_ts_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tileset_instanced.json");
        write_tileset(&[&outcome], &path, 2.5).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["asset"]["version"], "1.1");
        assert_eq!(value["root"]["refine"], "REPLACE");
        assert_eq!(value["root"]["children"].as_array().unwrap().len(), 1);
        assert_eq!(
            value["root"]["children"][0]["content"]["uri"],
            "instanced_meshes.glb"
        );
        assert_eq!(value["root"]["geometricError"], 2.5);
        std::fs::remove_dir_all(&dir).ok();
    }
}
