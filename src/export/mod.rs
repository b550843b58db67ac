//! GLB assembly.
//!
//! Builds output documents by copy-migrating resources from many source
//! models into a single consolidated binary buffer, fabricating per-instance
//! TRS accessors, and emitting `EXT_mesh_gpu_instancing` nodes.

pub mod report;
pub mod tileset;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use gltf_json as json;
use json::validation::Checked::Valid;
use json::validation::USize64;
use tracing::{debug, info, warn};

use crate::detect::{DetectionResult, MeshInstance};
use crate::error::{InstancingError, Result};
use crate::math::{BoundingBox, TransformComponents};
use crate::models::accessor::{self, checked, element_size};
use crate::models::gpu_instancing::{
    MeshGpuInstancing, EXT_MESH_GPU_INSTANCING, ROTATION, SCALE, TRANSLATION,
};
use crate::models::LoadedModel;

/// Which part of a detection result a combined output carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    Full,
    InstancedOnly,
    NonInstancedOnly,
}

/// Per-category `(source model id, source index) -> output index` tables.
/// Created per output document and discarded afterwards, so each source
/// resource is resolved at most once per GLB.
#[derive(Default)]
struct ResourceRemap {
    buffer_views: HashMap<(usize, usize), json::Index<json::buffer::View>>,
    accessors: HashMap<(usize, usize), json::Index<json::Accessor>>,
    materials: HashMap<(usize, usize), json::Index<json::Material>>,
    textures: HashMap<(usize, usize), json::Index<json::Texture>>,
    samplers: HashMap<(usize, usize), json::Index<json::texture::Sampler>>,
    images: HashMap<(usize, usize), json::Index<json::Image>>,
}

/// A written GLB plus the world-space bounds of everything inside it.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub bounds: BoundingBox,
}

fn model_by_id(models: &[LoadedModel], id: usize) -> Option<&LoadedModel> {
    models.iter().find(|model| model.id == id)
}

/// Restrict a mesh name to `[A-Za-z0-9_.-]` for use in file names.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Claim `base`, or the first `base_<n>` that is still free.
fn unique_file_name(used: &mut HashSet<String>, base: &str) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{base}_{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

pub struct GlbWriter {
    doc: json::Root,
    buffer: Vec<u8>,
}

impl Default for GlbWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GlbWriter {
    pub fn new() -> Self {
        let mut writer = Self {
            doc: json::Root::default(),
            buffer: Vec::new(),
        };
        writer.reset();
        writer
    }

    fn reset(&mut self) {
        self.doc = json::Root {
            asset: json::Asset {
                generator: Some(concat!("glbinstancer ", env!("CARGO_PKG_VERSION")).to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        // The one consolidated buffer; its final length is stamped on write.
        self.doc.buffers.push(json::Buffer {
            byte_length: USize64(0),
            name: None,
            uri: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.buffer.clear();
    }

    /// Append data to the consolidated buffer, 4-byte aligned, and create a
    /// bufferView covering it.
    fn push_data(
        &mut self,
        data: &[u8],
        byte_stride: Option<usize>,
        target: Option<json::buffer::Target>,
    ) -> json::Index<json::buffer::View> {
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
        let byte_offset = self.buffer.len();
        self.buffer.extend_from_slice(data);
        self.doc.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: USize64::from(data.len()),
            byte_offset: Some(USize64::from(byte_offset)),
            byte_stride: byte_stride.map(json::buffer::Stride),
            name: None,
            target: target.map(Valid),
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    fn note_extension_used(&mut self, name: &str) {
        if !self.doc.extensions_used.iter().any(|used| used == name) {
            self.doc.extensions_used.push(name.to_string());
        }
    }

    /// Copy a bufferView's raw byte range (used for embedded images).
    fn copy_buffer_view(
        &mut self,
        model: &LoadedModel,
        view_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::buffer::View>> {
        let key = (model.id, view_index);
        if let Some(&mapped) = remap.buffer_views.get(&key) {
            return Ok(mapped);
        }
        let view =
            model
                .document
                .buffer_views
                .get(view_index)
                .ok_or(InstancingError::InvalidIndex {
                    kind: "bufferView",
                    index: view_index,
                })?;
        let data = model.buffer_data(view.buffer.value()).ok_or(
            InstancingError::AccessorDataUnavailable {
                accessor: view_index,
            },
        )?;
        let offset = view.byte_offset.map(|o| o.0 as usize).unwrap_or(0);
        let length = view.byte_length.0 as usize;
        if offset + length > data.len() {
            return Err(InstancingError::BufferViewOutOfBounds {
                view: view_index,
                offset,
                length,
                buffer_len: data.len(),
            });
        }
        let stride = view.byte_stride.map(|s| s.0);
        let target = view.target.and_then(|t| checked(&t));
        let copied = self.push_data(&data[offset..offset + length], stride, target);
        remap.buffer_views.insert(key, copied);
        Ok(copied)
    }

    /// Copy an accessor, materializing its elements contiguously into the
    /// output buffer. The copy matches the source in every declared field
    /// except `byte_offset` (zero) and `buffer_view` (fresh).
    fn copy_accessor(
        &mut self,
        model: &LoadedModel,
        accessor_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::Accessor>> {
        let key = (model.id, accessor_index);
        if let Some(&mapped) = remap.accessors.get(&key) {
            return Ok(mapped);
        }
        let source =
            model
                .document
                .accessors
                .get(accessor_index)
                .ok_or(InstancingError::InvalidIndex {
                    kind: "accessor",
                    index: accessor_index,
                })?;
        let mut copy = source.clone();
        // Sparse substitution would reference views of the source document.
        copy.sparse = None;
        if source.buffer_view.is_some() {
            let bytes = accessor::read_accessor_bytes(model, accessor_index)?.ok_or(
                InstancingError::AccessorDataUnavailable {
                    accessor: accessor_index,
                },
            )?;
            let view = self.push_data(&bytes, None, None);
            copy.buffer_view = Some(view);
            copy.byte_offset = Some(USize64(0));
        }
        let copied = self.doc.push(copy);
        remap.accessors.insert(key, copied);
        Ok(copied)
    }

    /// Stamp the buffer target (and, for vertex attributes, the tight stride
    /// where glTF allows one) on the view backing a copied accessor.
    fn set_view_layout(
        &mut self,
        accessor: json::Index<json::Accessor>,
        target: json::buffer::Target,
        vertex_attribute: bool,
    ) {
        let Some(entry) = self.doc.accessors.get(accessor.value()) else {
            return;
        };
        let Some(view_index) = entry.buffer_view else {
            return;
        };
        let stride = if vertex_attribute {
            // byteStride must be a multiple of 4 in [4, 252]; tightly packed
            // data may simply omit it.
            element_size(entry).filter(|size| size % 4 == 0 && *size <= 252)
        } else {
            None
        };
        if let Some(view) = self.doc.buffer_views.get_mut(view_index.value()) {
            view.target = Some(Valid(target));
            if let Some(stride) = stride {
                view.byte_stride = Some(json::buffer::Stride(stride));
            }
        }
    }

    fn copy_sampler(
        &mut self,
        model: &LoadedModel,
        sampler_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::texture::Sampler>> {
        let key = (model.id, sampler_index);
        if let Some(&mapped) = remap.samplers.get(&key) {
            return Ok(mapped);
        }
        let sampler =
            model
                .document
                .samplers
                .get(sampler_index)
                .ok_or(InstancingError::InvalidIndex {
                    kind: "sampler",
                    index: sampler_index,
                })?;
        let copied = self.doc.push(sampler.clone());
        remap.samplers.insert(key, copied);
        Ok(copied)
    }

    fn copy_image(
        &mut self,
        model: &LoadedModel,
        image_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::Image>> {
        let key = (model.id, image_index);
        if let Some(&mapped) = remap.images.get(&key) {
            return Ok(mapped);
        }
        let image = model
            .document
            .images
            .get(image_index)
            .ok_or(InstancingError::InvalidIndex {
                kind: "image",
                index: image_index,
            })?;
        let mut copy = image.clone();
        if let Some(view) = image.buffer_view {
            copy.buffer_view = Some(self.copy_buffer_view(model, view.value(), remap)?);
        } else if let Some(uri) = &image.uri {
            debug!(
                "image {image_index} of {} keeps external uri {uri}",
                model.path.display()
            );
        }
        let copied = self.doc.push(copy);
        remap.images.insert(key, copied);
        Ok(copied)
    }

    fn copy_texture(
        &mut self,
        model: &LoadedModel,
        texture_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::Texture>> {
        let key = (model.id, texture_index);
        if let Some(&mapped) = remap.textures.get(&key) {
            return Ok(mapped);
        }
        let texture =
            model
                .document
                .textures
                .get(texture_index)
                .ok_or(InstancingError::InvalidIndex {
                    kind: "texture",
                    index: texture_index,
                })?;
        let mut copy = texture.clone();
        if let Some(sampler) = texture.sampler {
            copy.sampler = Some(self.copy_sampler(model, sampler.value(), remap)?);
        }
        copy.source = self.copy_image(model, texture.source.value(), remap)?;
        let copied = self.doc.push(copy);
        remap.textures.insert(key, copied);
        Ok(copied)
    }

    /// Copy a material and every texture it references. Extension keys seen
    /// on the source material are recorded in `extensionsUsed`.
    fn copy_material(
        &mut self,
        model: &LoadedModel,
        material_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::Material>> {
        let key = (model.id, material_index);
        if let Some(&mapped) = remap.materials.get(&key) {
            return Ok(mapped);
        }
        let material =
            model
                .document
                .materials
                .get(material_index)
                .ok_or(InstancingError::InvalidIndex {
                    kind: "material",
                    index: material_index,
                })?;
        if let Some(extensions) = &material.extensions {
            let names: Vec<String> = extensions.others.keys().cloned().collect();
            for name in names {
                self.note_extension_used(&name);
            }
        }

        let mut copy = material.clone();
        if let Some(input) = &material.pbr_metallic_roughness.base_color_texture {
            copy.pbr_metallic_roughness.base_color_texture = Some(json::texture::Info {
                index: self.copy_texture(model, input.index.value(), remap)?,
                ..input.clone()
            });
        }
        if let Some(input) = &material.pbr_metallic_roughness.metallic_roughness_texture {
            copy.pbr_metallic_roughness.metallic_roughness_texture = Some(json::texture::Info {
                index: self.copy_texture(model, input.index.value(), remap)?,
                ..input.clone()
            });
        }
        if let Some(input) = &material.normal_texture {
            copy.normal_texture = Some(json::material::NormalTexture {
                index: self.copy_texture(model, input.index.value(), remap)?,
                ..input.clone()
            });
        }
        if let Some(input) = &material.occlusion_texture {
            copy.occlusion_texture = Some(json::material::OcclusionTexture {
                index: self.copy_texture(model, input.index.value(), remap)?,
                ..input.clone()
            });
        }
        if let Some(input) = &material.emissive_texture {
            copy.emissive_texture = Some(json::texture::Info {
                index: self.copy_texture(model, input.index.value(), remap)?,
                ..input.clone()
            });
        }

        let copied = self.doc.push(copy);
        remap.materials.insert(key, copied);
        Ok(copied)
    }

    /// Copy a mesh with all its primitives, accessors, morph targets, and
    /// materials. Attribute accessors are copied in ascending semantic-name
    /// order so output indices are independent of source declaration order.
    fn copy_mesh(
        &mut self,
        model: &LoadedModel,
        mesh_index: usize,
        remap: &mut ResourceRemap,
    ) -> Result<json::Index<json::Mesh>> {
        let mesh = model
            .document
            .meshes
            .get(mesh_index)
            .ok_or(InstancingError::InvalidIndex {
                kind: "mesh",
                index: mesh_index,
            })?;

        let mut primitives = Vec::with_capacity(mesh.primitives.len());
        for source in &mesh.primitives {
            let material = match source.material {
                Some(index) => Some(self.copy_material(model, index.value(), remap)?),
                None => None,
            };

            let indices = match source.indices {
                Some(index) => {
                    let copied = self.copy_accessor(model, index.value(), remap)?;
                    self.set_view_layout(copied, json::buffer::Target::ElementArrayBuffer, false);
                    Some(copied)
                }
                None => None,
            };

            let mut sorted: Vec<(String, json::mesh::Semantic, json::Index<json::Accessor>)> =
                source
                    .attributes
                    .iter()
                    .filter_map(|(semantic, index)| match semantic {
                        Valid(semantic) => {
                            Some((accessor::semantic_name(semantic), semantic.clone(), *index))
                        }
                        _ => {
                            warn!("dropping attribute with invalid semantic on mesh {mesh_index}");
                            None
                        }
                    })
                    .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));

            let mut attributes = BTreeMap::new();
            for (_, semantic, index) in sorted {
                let copied = self.copy_accessor(model, index.value(), remap)?;
                self.set_view_layout(copied, json::buffer::Target::ArrayBuffer, true);
                attributes.insert(Valid(semantic), copied);
            }

            let targets = match &source.targets {
                Some(list) => {
                    let mut copied_targets = Vec::with_capacity(list.len());
                    for target in list {
                        let positions = match target.positions {
                            Some(index) => {
                                Some(self.copy_accessor(model, index.value(), remap)?)
                            }
                            None => None,
                        };
                        let normals = match target.normals {
                            Some(index) => {
                                Some(self.copy_accessor(model, index.value(), remap)?)
                            }
                            None => None,
                        };
                        let tangents = match target.tangents {
                            Some(index) => {
                                Some(self.copy_accessor(model, index.value(), remap)?)
                            }
                            None => None,
                        };
                        copied_targets.push(json::mesh::MorphTarget {
                            positions,
                            normals,
                            tangents,
                        });
                    }
                    Some(copied_targets)
                }
                None => None,
            };

            primitives.push(json::mesh::Primitive {
                attributes,
                extensions: Default::default(),
                extras: Default::default(),
                indices,
                material,
                mode: source.mode,
                targets,
            });
        }

        let target_count = primitives
            .iter()
            .filter_map(|p| p.targets.as_ref().map(|t| t.len()))
            .max()
            .unwrap_or(0);
        let weights = match (&mesh.weights, target_count) {
            (Some(weights), _) => Some(weights.clone()),
            (None, 0) => None,
            (None, count) => Some(vec![0.0; count]),
        };

        Ok(self.doc.push(json::Mesh {
            extensions: Default::default(),
            extras: Default::default(),
            name: mesh.name.clone(),
            primitives,
            weights,
        }))
    }

    fn push_trs_accessor(
        &mut self,
        data: &[u8],
        type_: json::accessor::Type,
        count: usize,
    ) -> json::Index<json::Accessor> {
        let view = self.push_data(data, None, None);
        self.doc.push(json::Accessor {
            buffer_view: Some(view),
            byte_offset: Some(USize64(0)),
            count: USize64::from(count),
            component_type: Valid(json::accessor::GenericComponentType(
                json::accessor::ComponentType::F32,
            )),
            extensions: Default::default(),
            extras: Default::default(),
            type_: Valid(type_),
            min: None,
            max: None,
            name: None,
            normalized: false,
            sparse: None,
        })
    }

    /// Fabricate the TRANSLATION / ROTATION / SCALE accessors for a group of
    /// instances. Rotations are stored `[x, y, z, w]`.
    fn create_instance_trs_accessors(
        &mut self,
        instances: &[MeshInstance],
    ) -> (
        json::Index<json::Accessor>,
        json::Index<json::Accessor>,
        json::Index<json::Accessor>,
    ) {
        let mut translation = Vec::with_capacity(instances.len() * 12);
        let mut rotation = Vec::with_capacity(instances.len() * 16);
        let mut scale = Vec::with_capacity(instances.len() * 12);
        for instance in instances {
            let transform = &instance.transform;
            for component in [
                transform.translation.x,
                transform.translation.y,
                transform.translation.z,
            ] {
                translation.extend_from_slice(&(component as f32).to_le_bytes());
            }
            for component in [
                transform.rotation.x,
                transform.rotation.y,
                transform.rotation.z,
                transform.rotation.w,
            ] {
                rotation.extend_from_slice(&(component as f32).to_le_bytes());
            }
            for component in [transform.scale.x, transform.scale.y, transform.scale.z] {
                scale.extend_from_slice(&(component as f32).to_le_bytes());
            }
        }
        (
            self.push_trs_accessor(&translation, json::accessor::Type::Vec3, instances.len()),
            self.push_trs_accessor(&rotation, json::accessor::Type::Vec4, instances.len()),
            self.push_trs_accessor(&scale, json::accessor::Type::Vec3, instances.len()),
        )
    }

    fn create_instanced_node(
        &mut self,
        mesh: json::Index<json::Mesh>,
        instances: &[MeshInstance],
        name: Option<&str>,
    ) -> json::Index<json::Node> {
        let (translation, rotation, scale) = self.create_instance_trs_accessors(instances);
        let mut node = json::Node {
            mesh: Some(mesh),
            name: Some(
                name.map(str::to_string)
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("instanced_node_mesh_{}", mesh.value())),
            ),
            ..Default::default()
        };
        let mut extension = MeshGpuInstancing::default();
        extension
            .attributes
            .insert(TRANSLATION.to_string(), translation);
        extension.attributes.insert(ROTATION.to_string(), rotation);
        extension.attributes.insert(SCALE.to_string(), scale);
        extension.apply_to_node(&mut node);
        self.note_extension_used(EXT_MESH_GPU_INSTANCING);
        self.doc.push(node)
    }

    /// A plain node; TRS fields are emitted only when non-identity.
    fn create_plain_node(
        &mut self,
        mesh: json::Index<json::Mesh>,
        transform: &TransformComponents,
    ) -> json::Index<json::Node> {
        const EPSILON: f64 = 1e-10;
        let mut node = json::Node {
            mesh: Some(mesh),
            ..Default::default()
        };
        let t = transform.translation;
        if t.abs().max_element() > EPSILON {
            node.translation = Some([t.x as f32, t.y as f32, t.z as f32]);
        }
        let q = transform.rotation;
        if q.x.abs() > EPSILON
            || q.y.abs() > EPSILON
            || q.z.abs() > EPSILON
            || (q.w - 1.0).abs() > EPSILON
        {
            node.rotation = Some(json::scene::UnitQuaternion([
                q.x as f32, q.y as f32, q.z as f32, q.w as f32,
            ]));
        }
        let s = transform.scale;
        if (s.x - 1.0).abs() > EPSILON
            || (s.y - 1.0).abs() > EPSILON
            || (s.z - 1.0).abs() > EPSILON
        {
            node.scale = Some([s.x as f32, s.y as f32, s.z as f32]);
        }
        self.doc.push(node)
    }

    /// Build a combined output for the selected emit mode, returning the GLB
    /// bytes and the world-space bounds of everything emitted.
    pub fn build_combined(
        &mut self,
        models: &[LoadedModel],
        detection: &DetectionResult,
        mode: EmitMode,
    ) -> Result<(Vec<u8>, BoundingBox)> {
        self.reset();
        let mut remap = ResourceRemap::default();
        let mut roots = Vec::new();
        let mut bounds = BoundingBox::default();

        if mode != EmitMode::NonInstancedOnly {
            for group in &detection.instanced_groups {
                if group.instances.is_empty() {
                    continue;
                }
                let Some(source) = model_by_id(models, group.model_id) else {
                    warn!("no loaded model with id {}; skipping group", group.model_id);
                    continue;
                };
                let mesh = match self.copy_mesh(source, group.mesh_index, &mut remap) {
                    Ok(mesh) => mesh,
                    Err(err) => {
                        warn!(
                            "skipping instanced group for mesh {} of {}: {err}",
                            group.mesh_index,
                            source.path.display()
                        );
                        continue;
                    }
                };
                roots.push(self.create_instanced_node(
                    mesh,
                    &group.instances,
                    group.mesh_name.as_deref(),
                ));
                let local = accessor::mesh_bounding_box(
                    source,
                    &source.document.meshes[group.mesh_index],
                );
                if local.is_valid() {
                    for instance in &group.instances {
                        bounds.merge(&local.transformed(&instance.transform.to_matrix()));
                    }
                }
            }
        }

        if mode != EmitMode::InstancedOnly {
            for entry in &detection.non_instanced {
                let Some(source) = model_by_id(models, entry.model_id) else {
                    warn!("no loaded model with id {}; skipping mesh", entry.model_id);
                    continue;
                };
                let mesh = match self.copy_mesh(source, entry.mesh_index, &mut remap) {
                    Ok(mesh) => mesh,
                    Err(err) => {
                        warn!(
                            "skipping mesh {} of {}: {err}",
                            entry.mesh_index,
                            source.path.display()
                        );
                        continue;
                    }
                };
                roots.push(self.create_plain_node(mesh, &entry.transform));
                let local = accessor::mesh_bounding_box(
                    source,
                    &source.document.meshes[entry.mesh_index],
                );
                if local.is_valid() {
                    bounds.merge(&local.transformed(&entry.transform.to_matrix()));
                }
            }
        }

        if roots.is_empty() {
            info!("no meshes were emitted for {mode:?}; output will be empty");
        } else {
            let scene = self.doc.push(json::Scene {
                nodes: roots,
                name: None,
                extensions: Default::default(),
                extras: Default::default(),
            });
            self.doc.scene = Some(scene);
        }

        Ok((self.finish()?, bounds))
    }

    pub fn write_combined(
        &mut self,
        models: &[LoadedModel],
        detection: &DetectionResult,
        path: &Path,
        mode: EmitMode,
    ) -> Result<WriteOutcome> {
        let (bytes, bounds) = self.build_combined(models, detection, mode)?;
        std::fs::write(path, &bytes)?;
        info!("wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(WriteOutcome {
            path: path.to_path_buf(),
            bounds,
        })
    }

    /// Emit one GLB per mesh of each source model, preserving the originating
    /// node's TRS, or its `EXT_mesh_gpu_instancing` extension with accessor
    /// indices remapped. Failures are logged and skipped; the written paths
    /// are returned.
    pub fn write_segmented(
        &mut self,
        models: &[LoadedModel],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut used_names = HashSet::new();
        for model in models {
            if model.document.meshes.is_empty() {
                info!("{} has no meshes to segment", model.path.display());
                continue;
            }
            let stem = model
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("model")
                .to_string();
            info!(
                "segmenting {} meshes from {}",
                model.document.meshes.len(),
                model.path.display()
            );

            for mesh_index in 0..model.document.meshes.len() {
                self.reset();
                let mut remap = ResourceRemap::default();
                let mesh = match self.copy_mesh(model, mesh_index, &mut remap) {
                    Ok(mesh) => mesh,
                    Err(err) => {
                        warn!(
                            "failed to copy mesh {mesh_index} of {}: {err}",
                            model.path.display()
                        );
                        continue;
                    }
                };
                let source_mesh = &model.document.meshes[mesh_index];
                let mut node = json::Node {
                    mesh: Some(mesh),
                    name: Some(
                        source_mesh
                            .name
                            .clone()
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| format!("{stem}_mesh_{mesh_index}")),
                    ),
                    ..Default::default()
                };

                // A node that instances this mesh wins over a plain reference.
                let references_mesh =
                    |n: &&json::Node| n.mesh.map(|m| m.value()) == Some(mesh_index);
                let instancing_source = model
                    .document
                    .nodes
                    .iter()
                    .filter(references_mesh)
                    .find_map(|n| MeshGpuInstancing::from_node(n));
                if let Some(extension) = instancing_source {
                    let mut remapped = MeshGpuInstancing::default();
                    for (attribute, index) in &extension.attributes {
                        match self.copy_accessor(model, index.value(), &mut remap) {
                            Ok(copied) => {
                                remapped.attributes.insert(attribute.clone(), copied);
                            }
                            Err(err) => warn!(
                                "failed to copy instancing accessor {attribute} for mesh \
                                 {mesh_index}: {err}"
                            ),
                        }
                    }
                    if !remapped.attributes.is_empty() {
                        remapped.apply_to_node(&mut node);
                        self.note_extension_used(EXT_MESH_GPU_INSTANCING);
                        if model
                            .document
                            .extensions_required
                            .iter()
                            .any(|e| e == EXT_MESH_GPU_INSTANCING)
                        {
                            self.doc
                                .extensions_required
                                .push(EXT_MESH_GPU_INSTANCING.to_string());
                        }
                    }
                } else if let Some(source_node) =
                    model.document.nodes.iter().find(references_mesh)
                {
                    node.translation = source_node.translation;
                    node.rotation = source_node.rotation;
                    node.scale = source_node.scale;
                    node.matrix = source_node.matrix;
                }

                let node_index = self.doc.push(node);
                let scene_name = source_mesh
                    .name
                    .as_ref()
                    .map(|n| format!("scene_for_{n}"))
                    .unwrap_or_else(|| format!("scene_for_mesh_{mesh_index}"));
                let scene = self.doc.push(json::Scene {
                    nodes: vec![node_index],
                    name: Some(scene_name),
                    extensions: Default::default(),
                    extras: Default::default(),
                });
                self.doc.scene = Some(scene);

                let mesh_part = source_mesh
                    .name
                    .as_deref()
                    .filter(|n| !n.is_empty())
                    .map(sanitize_name)
                    .unwrap_or_else(|| format!("mesh_{mesh_index}"));
                let file_name = unique_file_name(&mut used_names, &format!("{stem}_{mesh_part}"));
                let out_path = output_dir.join(format!("{file_name}.glb"));
                match self.finish() {
                    Ok(bytes) => match std::fs::write(&out_path, bytes) {
                        Ok(()) => {
                            debug!("wrote segmented GLB {}", out_path.display());
                            written.push(out_path);
                        }
                        Err(err) => warn!("failed to write {}: {err}", out_path.display()),
                    },
                    Err(err) => {
                        warn!("failed to serialize segmented mesh {mesh_index}: {err}")
                    }
                }
            }
        }
        Ok(written)
    }

    /// Drop accessors, bufferViews, and buffers nothing references, rewriting
    /// the surviving indices, then serialize to GLB bytes.
    fn finish(&mut self) -> Result<Vec<u8>> {
        self.prune_unused();
        if let Some(buffer) = self.doc.buffers.first_mut() {
            buffer.byte_length = USize64::from(self.buffer.len());
        }
        let json_string = json::serialize::to_string(&self.doc)
            .map_err(|err| InstancingError::Serialize(err.to_string()))?;
        let glb = gltf::binary::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                // Computed during serialization.
                length: 0,
            },
            json: Cow::Owned(json_string.into_bytes()),
            bin: if self.buffer.is_empty() {
                None
            } else {
                Some(Cow::Owned(self.buffer.clone()))
            },
        };
        glb.to_vec()
            .map_err(|err| InstancingError::Serialize(err.to_string()))
    }

    fn prune_unused(&mut self) {
        // Accessors referenced by primitives, morph targets, and instancing
        // extensions survive.
        let mut used_accessors = vec![false; self.doc.accessors.len()];
        fn mark<T>(index: json::Index<T>, used: &mut [bool]) {
            if let Some(slot) = used.get_mut(index.value()) {
                *slot = true;
            }
        }
        for mesh in &self.doc.meshes {
            for primitive in &mesh.primitives {
                if let Some(index) = primitive.indices {
                    mark(index, &mut used_accessors);
                }
                for index in primitive.attributes.values() {
                    mark(*index, &mut used_accessors);
                }
                if let Some(targets) = &primitive.targets {
                    for target in targets {
                        for index in [target.positions, target.normals, target.tangents]
                            .into_iter()
                            .flatten()
                        {
                            mark(index, &mut used_accessors);
                        }
                    }
                }
            }
        }
        for node in &self.doc.nodes {
            if let Some(extension) = MeshGpuInstancing::from_node(node) {
                for index in extension.attributes.values() {
                    mark(*index, &mut used_accessors);
                }
            }
        }

        let accessor_map = retain_used(&mut self.doc.accessors, &used_accessors);

        // Views referenced by surviving accessors and by images survive.
        let mut used_views = vec![false; self.doc.buffer_views.len()];
        for entry in &self.doc.accessors {
            if let Some(view) = entry.buffer_view {
                mark(view, &mut used_views);
            }
        }
        for image in &self.doc.images {
            if let Some(view) = image.buffer_view {
                mark(view, &mut used_views);
            }
        }
        let view_map = retain_used(&mut self.doc.buffer_views, &used_views);

        // Rewrite every accessor reference.
        let remap_accessor = |index: json::Index<json::Accessor>| {
            accessor_map[index.value()].map(json::Index::new)
        };
        for mesh in &mut self.doc.meshes {
            for primitive in &mut mesh.primitives {
                primitive.indices = primitive.indices.and_then(remap_accessor);
                for index in primitive.attributes.values_mut() {
                    if let Some(new_index) = remap_accessor(*index) {
                        *index = new_index;
                    }
                }
                if let Some(targets) = &mut primitive.targets {
                    for target in targets {
                        target.positions = target.positions.and_then(remap_accessor);
                        target.normals = target.normals.and_then(remap_accessor);
                        target.tangents = target.tangents.and_then(remap_accessor);
                    }
                }
            }
        }
        for node in &mut self.doc.nodes {
            if let Some(extension) = MeshGpuInstancing::from_node(node) {
                let mut rewritten = MeshGpuInstancing::default();
                for (attribute, index) in &extension.attributes {
                    if let Some(new_index) = remap_accessor(*index) {
                        rewritten.attributes.insert(attribute.clone(), new_index);
                    }
                }
                rewritten.apply_to_node(node);
            }
        }

        // Rewrite every view reference.
        for entry in &mut self.doc.accessors {
            entry.buffer_view = entry
                .buffer_view
                .and_then(|view| view_map[view.value()].map(json::Index::new));
        }
        for image in &mut self.doc.images {
            image.buffer_view = image
                .buffer_view
                .and_then(|view| view_map[view.value()].map(json::Index::new));
        }

        // The consolidated buffer goes when nothing points at it.
        if self.doc.buffer_views.is_empty() && self.buffer.is_empty() {
            self.doc.buffers.clear();
        }
    }
}

/// Retain `items[i]` where `used[i]`, returning the old-index -> new-index
/// mapping.
fn retain_used<T>(items: &mut Vec<T>, used: &[bool]) -> Vec<Option<u32>> {
    let mut mapping = vec![None; items.len()];
    let mut next = 0u32;
    for (index, flag) in used.iter().enumerate() {
        if *flag {
            mapping[index] = Some(next);
            next += 1;
        }
    }
    let mut index = 0;
    items.retain(|_| {
        let keep = used[index];
        index += 1;
        keep
    });
    mapping
}
