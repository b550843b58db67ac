//! Scene-graph traversal and instancing detection.
//!
//! Walks every model's default scene depth-first while accumulating world
//! transforms, classifies each encountered mesh by content signature into
//! candidate instance groups, and finalizes the groups against the instance
//! limit. Models whose file bytes are identical collapse onto one
//! representative id during finalization.

pub mod signature;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use glam::{DMat4, DQuat, DVec3};
use gltf_json as json;
use tracing::{debug, info, warn};

use crate::math::{BoundingBox, TransformComponents};
use crate::models::accessor;
use crate::models::gpu_instancing::{MeshGpuInstancing, ROTATION, SCALE, TRANSLATION};
use crate::models::LoadedModel;
use signature::SignatureOptions;

#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub geometry_tolerance: f64,
    pub normal_tolerance: f64,
    pub skip_attribute_data_hash: BTreeSet<String>,
    /// Minimum candidate count for a group to stay instanced.
    pub instance_limit: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            geometry_tolerance: 0.0,
            normal_tolerance: 0.0,
            skip_attribute_data_hash: BTreeSet::new(),
            instance_limit: 2,
        }
    }
}

/// One placement of a mesh in world space.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    pub model_id: usize,
    pub node_index: usize,
    pub mesh_index: usize,
    pub transform: TransformComponents,
}

/// A set of signature-equivalent mesh placements. The representative is the
/// first mesh that established the signature.
#[derive(Debug, Clone)]
pub struct InstancedGroup {
    pub signature: u64,
    pub model_id: usize,
    pub mesh_index: usize,
    pub mesh_name: Option<String>,
    /// Per-primitive local bounds of the representative; populated in
    /// tolerance mode only.
    pub primitive_bounds: Vec<BoundingBox>,
    pub instances: Vec<MeshInstance>,
}

#[derive(Debug, Clone)]
pub struct NonInstancedMesh {
    pub model_id: usize,
    pub mesh_index: usize,
    pub node_index: usize,
    pub transform: TransformComponents,
}

#[derive(Debug, Default)]
pub struct DetectionResult {
    pub instanced_groups: Vec<InstancedGroup>,
    pub non_instanced: Vec<NonInstancedMesh>,
}

/// Local transform of a node: explicit TRS wins over a matrix, identity
/// otherwise. Quaternions are stored `[x, y, z, w]` and re-normalized.
fn node_local_transform(node: &json::Node) -> DMat4 {
    if node.translation.is_some() || node.rotation.is_some() || node.scale.is_some() {
        let translation = node
            .translation
            .map(|t| DVec3::new(f64::from(t[0]), f64::from(t[1]), f64::from(t[2])))
            .unwrap_or(DVec3::ZERO);
        let rotation = node
            .rotation
            .map(|q| {
                DQuat::from_xyzw(
                    f64::from(q.0[0]),
                    f64::from(q.0[1]),
                    f64::from(q.0[2]),
                    f64::from(q.0[3]),
                )
                .normalize()
            })
            .unwrap_or(DQuat::IDENTITY);
        let scale = node
            .scale
            .map(|s| DVec3::new(f64::from(s[0]), f64::from(s[1]), f64::from(s[2])))
            .unwrap_or(DVec3::ONE);
        DMat4::from_scale_rotation_translation(scale, rotation, translation)
    } else if let Some(matrix) = node.matrix {
        DMat4::from_cols_array(&matrix.map(f64::from))
    } else {
        DMat4::IDENTITY
    }
}

pub struct InstancingDetector {
    options: SignatureOptions,
    instance_limit: usize,
    /// Memoized mesh signatures keyed by `(model_id, mesh_index)`; `None`
    /// marks a mesh whose signature could not be computed.
    signature_cache: HashMap<(usize, usize), Option<u64>>,
}

impl InstancingDetector {
    pub fn new(options: DetectorOptions) -> Self {
        if options.geometry_tolerance > 0.0 {
            info!(
                "instancing detector: tolerance mode (geometry {}, normal {})",
                options.geometry_tolerance, options.normal_tolerance
            );
        } else {
            info!("instancing detector: exact matching");
        }
        Self {
            options: SignatureOptions {
                geometry_tolerance: options.geometry_tolerance,
                normal_tolerance: options.normal_tolerance,
                skip_attribute_data_hash: options.skip_attribute_data_hash,
            },
            instance_limit: options.instance_limit.max(1),
            signature_cache: HashMap::new(),
        }
    }

    pub fn detect(&mut self, models: &[LoadedModel]) -> DetectionResult {
        // Whole-file duplicates collapse onto the first model with each hash.
        let mut class_for_hash: HashMap<&str, usize> = HashMap::new();
        let mut representative: HashMap<usize, usize> = HashMap::new();
        for model in models {
            let class = *class_for_hash
                .entry(model.file_hash.as_str())
                .or_insert(model.id);
            representative.insert(model.id, class);
            if class != model.id {
                info!(
                    "{} (id {}) is byte-identical to model id {}; treating its meshes as instances",
                    model.path.display(),
                    model.id,
                    class
                );
            }
        }

        let mut groups: BTreeMap<u64, InstancedGroup> = BTreeMap::new();
        let mut non_instanced = Vec::new();
        for model in models {
            let document = &model.document;
            if document.scenes.is_empty() {
                debug!("{} has no scenes; skipping traversal", model.path.display());
                continue;
            }
            let scene_index = document.scene.map(|s| s.value()).unwrap_or(0);
            let Some(scene) = document.scenes.get(scene_index) else {
                warn!(
                    "{} has an invalid default scene index {scene_index}; skipping",
                    model.path.display()
                );
                continue;
            };
            let mut path = Vec::new();
            for root in &scene.nodes {
                self.traverse_node(
                    model,
                    root.value(),
                    DMat4::IDENTITY,
                    &mut path,
                    &mut groups,
                    &mut non_instanced,
                );
            }
        }

        let class_of = |id: usize| representative.get(&id).copied().unwrap_or(id);
        let mut result = DetectionResult {
            non_instanced,
            ..Default::default()
        };
        for entry in &mut result.non_instanced {
            entry.model_id = class_of(entry.model_id);
        }
        for (_, mut group) in groups {
            if group.instances.len() >= self.instance_limit {
                group.model_id = class_of(group.model_id);
                for instance in &mut group.instances {
                    instance.model_id = class_of(instance.model_id);
                }
                result.instanced_groups.push(group);
            } else {
                for instance in group.instances {
                    result.non_instanced.push(NonInstancedMesh {
                        model_id: class_of(instance.model_id),
                        mesh_index: instance.mesh_index,
                        node_index: instance.node_index,
                        transform: instance.transform,
                    });
                }
            }
        }

        info!(
            "instancing detection complete: {} group(s) (limit {}), {} non-instanced mesh(es)",
            result.instanced_groups.len(),
            self.instance_limit,
            result.non_instanced.len()
        );
        result
    }

    fn traverse_node(
        &mut self,
        model: &LoadedModel,
        node_index: usize,
        parent_world: DMat4,
        path: &mut Vec<usize>,
        groups: &mut BTreeMap<u64, InstancedGroup>,
        non_instanced: &mut Vec<NonInstancedMesh>,
    ) {
        let Some(node) = model.document.nodes.get(node_index) else {
            warn!(
                "invalid node index {node_index} in {}",
                model.path.display()
            );
            return;
        };
        if path.contains(&node_index) {
            warn!(
                "node cycle involving index {node_index} in {}; not descending",
                model.path.display()
            );
            return;
        }
        let world = parent_world * node_local_transform(node);

        if let Some(mesh_index) = node.mesh.map(|m| m.value()) {
            if let Some(mesh) = model.document.meshes.get(mesh_index) {
                match MeshGpuInstancing::from_node(node) {
                    Some(extension) => self.visit_instanced_mesh(
                        model, node_index, mesh_index, mesh, &extension, world, groups,
                    ),
                    None => self.visit_plain_mesh(
                        model,
                        node_index,
                        mesh_index,
                        mesh,
                        world,
                        groups,
                        non_instanced,
                    ),
                }
            } else {
                warn!(
                    "node {node_index} in {} references invalid mesh index {mesh_index}",
                    model.path.display()
                );
            }
        }

        if let Some(children) = &node.children {
            path.push(node_index);
            for child in children {
                self.traverse_node(model, child.value(), world, path, groups, non_instanced);
            }
            path.pop();
        }
    }

    fn cached_signature(
        &mut self,
        model: &LoadedModel,
        mesh_index: usize,
        mesh: &json::Mesh,
    ) -> Option<u64> {
        let key = (model.id, mesh_index);
        if let Some(cached) = self.signature_cache.get(&key) {
            return *cached;
        }
        let computed = match signature::mesh_signature(model, mesh, &self.options) {
            Ok(signature) => Some(signature),
            Err(err) => {
                warn!(
                    "skipping mesh {mesh_index} of {}: {err}",
                    model.path.display()
                );
                None
            }
        };
        self.signature_cache.insert(key, computed);
        computed
    }

    fn new_group(
        &self,
        model: &LoadedModel,
        mesh_index: usize,
        mesh: &json::Mesh,
        group_signature: u64,
    ) -> InstancedGroup {
        InstancedGroup {
            signature: group_signature,
            model_id: model.id,
            mesh_index,
            mesh_name: mesh.name.clone(),
            primitive_bounds: if self.options.exact() {
                Vec::new()
            } else {
                mesh.primitives
                    .iter()
                    .map(|primitive| accessor::primitive_bounding_box(model, primitive))
                    .collect()
            },
            instances: Vec::new(),
        }
    }

    /// A node that already carries `EXT_mesh_gpu_instancing`: expand every
    /// declared instance into a candidate of the signature's group.
    #[allow(clippy::too_many_arguments)]
    fn visit_instanced_mesh(
        &mut self,
        model: &LoadedModel,
        node_index: usize,
        mesh_index: usize,
        mesh: &json::Mesh,
        extension: &MeshGpuInstancing,
        world: DMat4,
        groups: &mut BTreeMap<u64, InstancedGroup>,
    ) {
        let Some(group_signature) = self.cached_signature(model, mesh_index, mesh) else {
            return;
        };
        if extension.attributes.is_empty() {
            warn!(
                "node {node_index} in {} declares EXT_mesh_gpu_instancing without attributes",
                model.path.display()
            );
            return;
        }
        let Some(count) = extension.instance_count(&model.document) else {
            warn!(
                "node {node_index} in {}: cannot determine a consistent instance count",
                model.path.display()
            );
            return;
        };
        if count == 0 {
            return;
        }

        let read_stream3 = |name: &str| {
            extension
                .accessor(name)
                .and_then(|index| accessor::read_vec3_f32(model, index).ok().flatten())
        };
        let translations = read_stream3(TRANSLATION);
        let rotations = extension
            .accessor(ROTATION)
            .and_then(|index| accessor::read_vec4_f32(model, index).ok().flatten());
        let scales = read_stream3(SCALE);

        let group = groups
            .entry(group_signature)
            .or_insert_with(|| self.new_group(model, mesh_index, mesh, group_signature));
        for i in 0..count as usize {
            let translation = translations
                .as_ref()
                .and_then(|stream| stream.get(i))
                .map(|t| DVec3::new(f64::from(t[0]), f64::from(t[1]), f64::from(t[2])))
                .unwrap_or(DVec3::ZERO);
            let rotation = rotations
                .as_ref()
                .and_then(|stream| stream.get(i))
                .map(|q| {
                    DQuat::from_xyzw(
                        f64::from(q[0]),
                        f64::from(q[1]),
                        f64::from(q[2]),
                        f64::from(q[3]),
                    )
                    .normalize()
                })
                .unwrap_or(DQuat::IDENTITY);
            let scale = scales
                .as_ref()
                .and_then(|stream| stream.get(i))
                .map(|s| DVec3::new(f64::from(s[0]), f64::from(s[1]), f64::from(s[2])))
                .unwrap_or(DVec3::ONE);

            let instance_local = DMat4::from_scale_rotation_translation(scale, rotation, translation);
            group.instances.push(MeshInstance {
                model_id: model.id,
                node_index,
                mesh_index,
                transform: TransformComponents::from_matrix(&(world * instance_local)),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_plain_mesh(
        &mut self,
        model: &LoadedModel,
        node_index: usize,
        mesh_index: usize,
        mesh: &json::Mesh,
        world: DMat4,
        groups: &mut BTreeMap<u64, InstancedGroup>,
        non_instanced: &mut Vec<NonInstancedMesh>,
    ) {
        let Some(mesh_sig) = self.cached_signature(model, mesh_index, mesh) else {
            return;
        };
        let instance = MeshInstance {
            model_id: model.id,
            node_index,
            mesh_index,
            transform: TransformComponents::from_matrix(&world),
        };

        if self.options.exact() {
            groups
                .entry(mesh_sig)
                .or_insert_with(|| self.new_group(model, mesh_index, mesh, mesh_sig))
                .instances
                .push(instance);
            return;
        }

        // Tolerance mode: a signature match alone is not sufficient; the
        // candidate's per-primitive bounds must agree with the representative.
        match groups.get_mut(&mesh_sig) {
            Some(group) => {
                let bounds: Vec<BoundingBox> = mesh
                    .primitives
                    .iter()
                    .map(|primitive| accessor::primitive_bounding_box(model, primitive))
                    .collect();
                let compatible = group.primitive_bounds.len() == bounds.len()
                    && group
                        .primitive_bounds
                        .iter()
                        .zip(&bounds)
                        .all(|(a, b)| a.similar_to(b, self.options.geometry_tolerance));
                if compatible {
                    group.instances.push(instance);
                } else {
                    debug!(
                        "mesh {mesh_index} of {} matches signature {:#018x} but fails the \
                         bounding-box check; keeping it non-instanced",
                        model.path.display(),
                        mesh_sig
                    );
                    non_instanced.push(NonInstancedMesh {
                        model_id: instance.model_id,
                        mesh_index: instance.mesh_index,
                        node_index: instance.node_index,
                        transform: instance.transform,
                    });
                }
            }
            None => {
                let mut group = self.new_group(model, mesh_index, mesh, mesh_sig);
                group.instances.push(instance);
                groups.insert(mesh_sig, group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{triangle_model, ModelBuilder};

    fn detect_with(models: &[LoadedModel], options: DetectorOptions) -> DetectionResult {
        InstancingDetector::new(options).detect(models)
    }

    #[test]
    fn test_two_identical_meshes_group() {
        let models = vec![
            triangle_model(0, "cube", [0.0, 0.0, 0.0]),
            triangle_model(1, "cube", [10.0, 0.0, 0.0]),
        ];
        let result = detect_with(&models, DetectorOptions::default());
        assert_eq!(result.instanced_groups.len(), 1);
        assert_eq!(result.non_instanced.len(), 0);
        let group = &result.instanced_groups[0];
        assert_eq!(group.instances.len(), 2);
        assert_eq!(group.mesh_name.as_deref(), Some("cube"));
        let translations: Vec<f64> = group
            .instances
            .iter()
            .map(|i| i.transform.translation.x)
            .collect();
        assert!(translations.contains(&0.0) && translations.contains(&10.0));
    }

    #[test]
    fn test_instance_limit_demotes_small_groups() {
        let models = vec![
            triangle_model(0, "t", [0.0; 3]),
            triangle_model(1, "t", [1.0, 0.0, 0.0]),
            triangle_model(2, "t", [2.0, 0.0, 0.0]),
        ];
        let result = detect_with(
            &models,
            DetectorOptions {
                instance_limit: 5,
                ..Default::default()
            },
        );
        assert_eq!(result.instanced_groups.len(), 0);
        assert_eq!(result.non_instanced.len(), 3);
    }

    #[test]
    fn test_identical_files_collapse_to_one_representative() {
        // Same translation -> byte-identical files -> one content-hash class.
        let models = vec![
            triangle_model(0, "t", [0.0; 3]),
            triangle_model(1, "t", [0.0; 3]),
            triangle_model(2, "t", [0.0; 3]),
        ];
        let result = detect_with(&models, DetectorOptions::default());
        assert_eq!(result.instanced_groups.len(), 1);
        let group = &result.instanced_groups[0];
        assert_eq!(group.instances.len(), 3);
        assert!(group.instances.iter().all(|i| i.model_id == 0));
        assert_eq!(group.model_id, 0);
    }

    #[test]
    fn test_world_transform_accumulates_through_hierarchy() {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let indices = builder.indices_u16(&[0, 1, 2]);
        let mesh = builder.mesh("leaf", positions, Some(indices));
        let leaf = builder.node_with_mesh(mesh, Some([0.0, 0.0, 5.0]));
        let parent = builder.root.push(json::Node {
            children: Some(vec![leaf]),
            translation: Some([10.0, 0.0, 0.0]),
            scale: Some([2.0, 2.0, 2.0]),
            ..Default::default()
        });
        builder.scene(vec![parent]);
        let model = builder.build_model(0);

        let result = detect_with(&[model], DetectorOptions::default());
        // Single use stays below the default limit of 2.
        assert_eq!(result.non_instanced.len(), 1);
        let transform = &result.non_instanced[0].transform;
        assert!((transform.translation - glam::DVec3::new(10.0, 0.0, 10.0)).length() < 1e-9);
        assert!((transform.scale - glam::DVec3::splat(2.0)).length() < 1e-9);
    }

    #[test]
    fn test_matrix_node_transform() {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let mesh = builder.mesh("m", positions, None);
        let node = builder.root.push(json::Node {
            mesh: Some(mesh),
            matrix: Some(
                glam::Mat4::from_translation(glam::Vec3::new(3.0, 4.0, 5.0)).to_cols_array(),
            ),
            ..Default::default()
        });
        builder.scene(vec![node]);
        let model = builder.build_model(0);

        let result = detect_with(&[model], DetectorOptions::default());
        assert_eq!(result.non_instanced.len(), 1);
        let translation = result.non_instanced[0].transform.translation;
        assert!((translation - glam::DVec3::new(3.0, 4.0, 5.0)).length() < 1e-9);
    }

    #[test]
    fn test_tolerance_mode_groups_jittered_positions() {
        let jittered = |id: usize, offset: f32, jitter: f32| {
            let mut builder = ModelBuilder::new();
            let positions = builder.positions(&[
                [jitter, 0.0, 0.0],
                [1.0 + jitter, 0.0, 0.0],
                [jitter, 1.0, 0.0],
            ]);
            let indices = builder.indices_u16(&[0, 1, 2]);
            let mesh = builder.mesh("j", positions, Some(indices));
            let node = builder.node_with_mesh(mesh, Some([offset, 0.0, 0.0]));
            builder.scene(vec![node]);
            builder.build_model(id)
        };
        let models = vec![jittered(0, 0.0, 0.0), jittered(1, 10.0, 1e-5)];

        // Exact mode: the 1e-5 jitter splits the signatures.
        let exact = detect_with(&models, DetectorOptions::default());
        assert_eq!(exact.instanced_groups.len(), 0);
        assert_eq!(exact.non_instanced.len(), 2);

        // Tolerance mode: POSITION data is excluded and the bounds agree.
        let tolerant = detect_with(
            &models,
            DetectorOptions {
                geometry_tolerance: 1e-4,
                ..Default::default()
            },
        );
        assert_eq!(tolerant.instanced_groups.len(), 1);
        assert_eq!(tolerant.instanced_groups[0].instances.len(), 2);
    }

    #[test]
    fn test_tolerance_mode_rejects_moved_geometry() {
        // Same topology and vertex count, but one triangle is shifted by a
        // whole unit inside its local space: signatures match (POSITION is
        // not hashed) while the bounding boxes differ.
        let shifted = |id: usize, shift: f32| {
            let mut builder = ModelBuilder::new();
            let positions = builder.positions(&[
                [shift, 0.0, 0.0],
                [1.0 + shift, 0.0, 0.0],
                [shift, 1.0, 0.0],
            ]);
            let indices = builder.indices_u16(&[0, 1, 2]);
            let mesh = builder.mesh("s", positions, Some(indices));
            let node = builder.node_with_mesh(mesh, None);
            builder.scene(vec![node]);
            builder.build_model(id)
        };
        let models = vec![shifted(0, 0.0), shifted(1, 1.0)];
        let result = detect_with(
            &models,
            DetectorOptions {
                geometry_tolerance: 1e-4,
                ..Default::default()
            },
        );
        assert_eq!(result.instanced_groups.len(), 0);
        assert_eq!(result.non_instanced.len(), 2);
    }

    #[test]
    fn test_inbound_gpu_instancing_expands_instances() {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let indices = builder.indices_u16(&[0, 1, 2]);
        let mesh = builder.mesh("inst", positions, Some(indices));
        let translations = builder.positions(&[
            [0.0, 0.0, 0.0],
            [5.0, 0.0, 0.0],
            [0.0, 5.0, 0.0],
            [0.0, 0.0, 5.0],
        ]);
        let node = builder.root.push(json::Node {
            mesh: Some(mesh),
            translation: Some([100.0, 0.0, 0.0]),
            ..Default::default()
        });
        let mut ext = MeshGpuInstancing::default();
        ext.attributes.insert(TRANSLATION.to_string(), translations);
        ext.apply_to_node(&mut builder.root.nodes[node.value()]);
        builder.scene(vec![node]);
        let model = builder.build_model(0);

        let result = detect_with(&[model], DetectorOptions::default());
        assert_eq!(result.instanced_groups.len(), 1);
        let group = &result.instanced_groups[0];
        assert_eq!(group.instances.len(), 4);
        // The node's own transform composes with each instance's TRS.
        let xs: Vec<f64> = group
            .instances
            .iter()
            .map(|i| i.transform.translation.x)
            .collect();
        assert!(xs.contains(&100.0) && xs.contains(&105.0));
    }

    #[test]
    fn test_inbound_instances_merge_with_plain_candidates() {
        // One model with a 4-instance node plus two plain models of the same
        // triangle: one group of 6.
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let indices = builder.indices_u16(&[0, 1, 2]);
        let mesh = builder.mesh("tri", positions, Some(indices));
        let translations = builder.positions(&[
            [0.0; 3],
            [5.0, 0.0, 0.0],
            [0.0, 5.0, 0.0],
            [0.0, 0.0, 5.0],
        ]);
        let node = builder.node_with_mesh(mesh, None);
        let mut ext = MeshGpuInstancing::default();
        ext.attributes.insert(TRANSLATION.to_string(), translations);
        ext.apply_to_node(&mut builder.root.nodes[node.value()]);
        builder.scene(vec![node]);
        let instanced = builder.build_model(0);

        let models = vec![
            instanced,
            triangle_model(1, "tri", [20.0, 0.0, 0.0]),
            triangle_model(2, "tri", [30.0, 0.0, 0.0]),
        ];
        let result = detect_with(&models, DetectorOptions::default());
        assert_eq!(result.instanced_groups.len(), 1);
        assert_eq!(result.instanced_groups[0].instances.len(), 6);
    }

    #[test]
    fn test_mismatched_instance_counts_are_skipped() {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let mesh = builder.mesh("bad", positions, None);
        let translations = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0]]);
        let scales = builder.positions(&[[1.0; 3]]);
        let node = builder.node_with_mesh(mesh, None);
        let mut ext = MeshGpuInstancing::default();
        ext.attributes.insert(TRANSLATION.to_string(), translations);
        ext.attributes.insert(SCALE.to_string(), scales);
        ext.apply_to_node(&mut builder.root.nodes[node.value()]);
        builder.scene(vec![node]);
        let model = builder.build_model(0);

        let result = detect_with(&[model], DetectorOptions::default());
        assert!(result.instanced_groups.is_empty());
        assert!(result.non_instanced.is_empty());
    }

    #[test]
    fn test_meshes_without_scene_reference_are_ignored() {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        builder.mesh("orphan", positions, None);
        // A scene with no nodes at all.
        builder.scene(vec![]);
        let model = builder.build_model(0);
        let result = detect_with(&[model], DetectorOptions::default());
        assert!(result.instanced_groups.is_empty());
        assert!(result.non_instanced.is_empty());
    }

    #[test]
    fn test_signature_cache_reuses_mesh_signatures() {
        // Two nodes referencing the same mesh: one group with two instances,
        // one signature computation.
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let indices = builder.indices_u16(&[0, 1, 2]);
        let mesh = builder.mesh("shared", positions, Some(indices));
        let a = builder.node_with_mesh(mesh, Some([0.0; 3]));
        let b = builder.node_with_mesh(mesh, Some([7.0, 0.0, 0.0]));
        builder.scene(vec![a, b]);
        let model = builder.build_model(0);

        let mut detector = InstancingDetector::new(DetectorOptions::default());
        let result = detector.detect(&[model]);
        assert_eq!(result.instanced_groups.len(), 1);
        assert_eq!(result.instanced_groups[0].instances.len(), 2);
        assert_eq!(detector.signature_cache.len(), 1);
    }

    #[test]
    fn test_default_trs_helpers() {
        let node = json::Node::default();
        assert_eq!(node_local_transform(&node), DMat4::IDENTITY);
        let node = json::Node {
            translation: Some([1.0, 2.0, 3.0]),
            ..Default::default()
        };
        let transform = node_local_transform(&node);
        assert_eq!(transform.w_axis, glam::DVec4::new(1.0, 2.0, 3.0, 1.0));
    }
}
