//! 64-bit content signatures for mesh primitives.
//!
//! Equal signatures are a necessary condition for instancing equivalence:
//! sufficient in exact mode, and refined by bounding-box comparison in
//! tolerance mode (see the detector).

use std::collections::BTreeSet;

use gltf_json as json;

use crate::error::Result;
use crate::models::accessor::{self, checked, semantic_name};
use crate::models::LoadedModel;

/// Matching policy for the signature engine.
#[derive(Debug, Clone, Default)]
pub struct SignatureOptions {
    pub geometry_tolerance: f64,
    pub normal_tolerance: f64,
    /// Attributes whose data is excluded from the hash in tolerance mode.
    /// Their names and accessor metadata are still mixed in.
    pub skip_attribute_data_hash: BTreeSet<String>,
}

impl SignatureOptions {
    pub fn exact(&self) -> bool {
        self.geometry_tolerance <= 1e-9
    }
}

/// Boost-style hash mix.
pub fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value
        .wrapping_add(0x9E37_79B9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Stable 64-bit FNV-1a over a byte stream.
fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash = 0xCBF2_9CE4_8422_2325u64;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

fn hash_str(value: &str) -> u64 {
    hash_bytes(value.as_bytes())
}

const MISSING: u64 = u64::MAX;
/// Mixed into every fallback hash so a fallback can never collide with a
/// data hash of the same metadata.
const FALLBACK_MARKER: u64 = 0xFA11_BACC_0000_0001;
const NO_MIN: u64 = 0xDECA_FBAD;
const NO_MAX: u64 = 0xBAAD_F00D;

fn type_tag(accessor: &json::Accessor) -> u64 {
    checked(&accessor.type_).map(|t| t as u64).unwrap_or(MISSING)
}

fn component_tag(accessor: &json::Accessor) -> u64 {
    checked(&accessor.component_type)
        .map(|c| c.0 as u64)
        .unwrap_or(MISSING)
}

fn mode_tag(primitive: &json::mesh::Primitive) -> u64 {
    checked(&primitive.mode).map(|m| m as u64).unwrap_or(MISSING)
}

/// Degraded hash for an accessor whose data cannot be materialized: declared
/// shape plus min/max (or absence sentinels) plus a marker.
fn fallback_hash(accessor: &json::Accessor) -> u64 {
    let mut seed = 0u64;
    hash_combine(&mut seed, type_tag(accessor));
    hash_combine(&mut seed, component_tag(accessor));
    hash_combine(&mut seed, accessor.count.0);
    hash_combine(&mut seed, u64::from(accessor.normalized));
    match accessor.min.as_ref().and_then(|v| v.as_array()) {
        Some(values) if !values.is_empty() => {
            for value in values {
                hash_combine(&mut seed, value.as_f64().unwrap_or(f64::NAN).to_bits());
            }
        }
        _ => hash_combine(&mut seed, NO_MIN),
    }
    match accessor.max.as_ref().and_then(|v| v.as_array()) {
        Some(values) if !values.is_empty() => {
            for value in values {
                hash_combine(&mut seed, value.as_f64().unwrap_or(f64::NAN).to_bits());
            }
        }
        _ => hash_combine(&mut seed, NO_MAX),
    }
    hash_combine(&mut seed, FALLBACK_MARKER);
    seed
}

/// Hash an accessor's content. A positive `quantize_tolerance` quantizes
/// `VEC3`/`FLOAT` components as `round(c / tolerance)` (used for NORMAL);
/// everything else hashes the exact element bytes. Unresolvable data falls
/// back to [`fallback_hash`]; out-of-range reads are errors.
fn hash_accessor_data(
    model: &LoadedModel,
    accessor_index: usize,
    quantize_tolerance: f64,
) -> Result<u64> {
    let Some(accessor) = model.document.accessors.get(accessor_index) else {
        // Dangling attribute accessor; mirror the placeholder the callers use.
        return Ok(MISSING);
    };

    if quantize_tolerance > 1e-9 {
        if let Some(vectors) = accessor::read_vec3_f32(model, accessor_index)? {
            let mut seed = 0u64;
            for vector in vectors {
                for component in vector {
                    let quantized = (f64::from(component) / quantize_tolerance).round();
                    hash_combine(&mut seed, quantized.to_bits());
                }
            }
            return Ok(seed);
        }
    }

    match accessor::read_accessor_bytes(model, accessor_index)? {
        Some(bytes) => Ok(hash_bytes(&bytes)),
        None => Ok(fallback_hash(accessor)),
    }
}

/// Primitive attributes with valid semantics, in ascending name order.
fn sorted_attributes(primitive: &json::mesh::Primitive) -> Vec<(String, usize)> {
    let mut attributes: Vec<(String, usize)> = primitive
        .attributes
        .iter()
        .filter_map(|(semantic, index)| match semantic {
            json::validation::Checked::Valid(semantic) => {
                Some((semantic_name(semantic), index.value()))
            }
            json::validation::Checked::Invalid => None,
        })
        .collect();
    attributes.sort();
    attributes
}

fn hash_indices(model: &LoadedModel, primitive: &json::mesh::Primitive, seed: &mut u64) -> Result<()> {
    match primitive
        .indices
        .and_then(|index| model.document.accessors.get(index.value()).map(|a| (index, a)))
    {
        Some((index, accessor)) => {
            hash_combine(seed, type_tag(accessor));
            hash_combine(seed, component_tag(accessor));
            hash_combine(seed, accessor.count.0);
            hash_combine(seed, hash_accessor_data(model, index.value(), 0.0)?);
        }
        None => {
            hash_combine(seed, MISSING);
            hash_combine(seed, MISSING);
            hash_combine(seed, 0);
            hash_combine(seed, MISSING);
        }
    }
    Ok(())
}

fn hash_morph_targets(
    model: &LoadedModel,
    primitive: &json::mesh::Primitive,
    seed: &mut u64,
) -> Result<()> {
    let Some(targets) = &primitive.targets else {
        return Ok(());
    };
    for target in targets {
        // Lexicographic name order.
        let entries = [
            ("NORMAL", target.normals),
            ("POSITION", target.positions),
            ("TANGENT", target.tangents),
        ];
        for (name, index) in entries {
            let Some(index) = index else { continue };
            hash_combine(seed, hash_str(name));
            match model.document.accessors.get(index.value()) {
                Some(accessor) => {
                    hash_combine(seed, type_tag(accessor));
                    hash_combine(seed, component_tag(accessor));
                    hash_combine(seed, hash_accessor_data(model, index.value(), 0.0)?);
                }
                None => hash_combine(seed, MISSING),
            }
        }
    }
    Ok(())
}

fn primitive_signature_exact(
    model: &LoadedModel,
    primitive: &json::mesh::Primitive,
) -> Result<u64> {
    let mut seed = 0u64;
    hash_combine(
        &mut seed,
        primitive
            .material
            .map(|m| m.value() as u64)
            .unwrap_or(MISSING),
    );
    hash_combine(&mut seed, mode_tag(primitive));
    hash_indices(model, primitive, &mut seed)?;

    for (name, accessor_index) in sorted_attributes(primitive) {
        hash_combine(&mut seed, hash_str(&name));
        match model.document.accessors.get(accessor_index) {
            Some(accessor) => {
                hash_combine(&mut seed, type_tag(accessor));
                hash_combine(&mut seed, component_tag(accessor));
                hash_combine(&mut seed, accessor.count.0);
                hash_combine(&mut seed, u64::from(accessor.normalized));
                hash_combine(&mut seed, hash_accessor_data(model, accessor_index, 0.0)?);
            }
            None => hash_combine(&mut seed, MISSING),
        }
    }

    hash_morph_targets(model, primitive, &mut seed)?;
    Ok(seed)
}

fn primitive_signature_tolerance(
    model: &LoadedModel,
    primitive: &json::mesh::Primitive,
    options: &SignatureOptions,
) -> Result<u64> {
    let mut seed = 0u64;
    hash_combine(
        &mut seed,
        primitive
            .material
            .map(|m| m.value() as u64)
            .unwrap_or(MISSING),
    );
    hash_combine(&mut seed, mode_tag(primitive));
    hash_indices(model, primitive, &mut seed)?;

    for (name, accessor_index) in sorted_attributes(primitive) {
        hash_combine(&mut seed, hash_str(&name));
        let Some(accessor) = model.document.accessors.get(accessor_index) else {
            hash_combine(&mut seed, MISSING);
            continue;
        };
        hash_combine(&mut seed, type_tag(accessor));
        hash_combine(&mut seed, component_tag(accessor));
        hash_combine(&mut seed, accessor.count.0);
        hash_combine(&mut seed, u64::from(accessor.normalized));

        // POSITION similarity is validated by bounding boxes later, and
        // caller-skipped attributes keep topology via the metadata above.
        if name == "POSITION" || options.skip_attribute_data_hash.contains(&name) {
            continue;
        }
        let quantize = if name == "NORMAL" && options.normal_tolerance > 1e-9 {
            options.normal_tolerance
        } else {
            0.0
        };
        hash_combine(&mut seed, hash_accessor_data(model, accessor_index, quantize)?);
    }

    hash_morph_targets(model, primitive, &mut seed)?;
    Ok(seed)
}

pub fn primitive_signature(
    model: &LoadedModel,
    primitive: &json::mesh::Primitive,
    options: &SignatureOptions,
) -> Result<u64> {
    if options.exact() {
        primitive_signature_exact(model, primitive)
    } else {
        primitive_signature_tolerance(model, primitive, options)
    }
}

/// Mesh signature: the mix of its primitive signatures, in order.
pub fn mesh_signature(
    model: &LoadedModel,
    mesh: &json::Mesh,
    options: &SignatureOptions,
) -> Result<u64> {
    let mut seed = 0u64;
    for primitive in &mesh.primitives {
        hash_combine(&mut seed, primitive_signature(model, primitive, options)?);
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::ModelBuilder;
    use json::validation::Checked::Valid;
    use std::collections::BTreeMap;

    const TRI: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

    fn exact() -> SignatureOptions {
        SignatureOptions::default()
    }

    fn tolerant(tolerance: f64) -> SignatureOptions {
        SignatureOptions {
            geometry_tolerance: tolerance,
            ..Default::default()
        }
    }

    fn one_mesh_model(points: &[[f32; 3]]) -> crate::models::LoadedModel {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(points);
        let indices = builder.indices_u16(&[0, 1, 2]);
        builder.mesh("m", positions, Some(indices));
        builder.build_model(0)
    }

    fn signature_of(model: &crate::models::LoadedModel, options: &SignatureOptions) -> u64 {
        mesh_signature(model, &model.document.meshes[0], options).unwrap()
    }

    #[test]
    fn test_identical_meshes_share_signature() {
        let a = one_mesh_model(&TRI);
        let b = one_mesh_model(&TRI);
        assert_eq!(signature_of(&a, &exact()), signature_of(&b, &exact()));
    }

    #[test]
    fn test_position_bytes_change_signature_in_exact_mode() {
        let a = one_mesh_model(&TRI);
        let b = one_mesh_model(&[[1e-5, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_ne!(signature_of(&a, &exact()), signature_of(&b, &exact()));
    }

    #[test]
    fn test_position_bytes_ignored_in_tolerance_mode() {
        let a = one_mesh_model(&TRI);
        let b = one_mesh_model(&[[1e-5, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let options = tolerant(1e-4);
        assert_eq!(signature_of(&a, &options), signature_of(&b, &options));
    }

    #[test]
    fn test_vertex_count_still_matters_in_tolerance_mode() {
        let a = one_mesh_model(&TRI);
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ]);
        let indices = builder.indices_u16(&[0, 1, 2]);
        builder.mesh("m", positions, Some(indices));
        let b = builder.build_model(0);
        let options = tolerant(1e-4);
        assert_ne!(signature_of(&a, &options), signature_of(&b, &options));
    }

    #[test]
    fn test_interleaved_and_packed_layouts_hash_alike() {
        // Same logical positions, one model interleaved with padding floats.
        let packed = one_mesh_model(&TRI);

        let mut builder = ModelBuilder::new();
        let mut interleaved = Vec::new();
        for point in TRI {
            for component in point {
                interleaved.extend_from_slice(&component.to_le_bytes());
            }
            interleaved.extend_from_slice(&7.25f32.to_le_bytes()); // padding
        }
        let view = builder.push_view(&interleaved, Some(16));
        let positions = builder.push_accessor(
            view,
            0,
            3,
            json::accessor::Type::Vec3,
            json::accessor::ComponentType::F32,
            Some(json::Value::from(vec![0.0, 0.0, 0.0])),
            Some(json::Value::from(vec![1.0, 1.0, 0.0])),
        );
        let indices = builder.indices_u16(&[0, 1, 2]);
        builder.mesh("m", positions, Some(indices));
        let strided = builder.build_model(1);

        assert_eq!(signature_of(&packed, &exact()), signature_of(&strided, &exact()));
    }

    #[test]
    fn test_normal_quantization_tolerates_jitter() {
        let build = |ny: f32| {
            let mut builder = ModelBuilder::new();
            let positions = builder.positions(&TRI);
            let normals = builder.positions(&[[0.0, ny, 0.0], [0.0, ny, 0.0], [0.0, ny, 0.0]]);
            let indices = builder.indices_u16(&[0, 1, 2]);
            let mesh = builder.mesh("m", positions, Some(indices));
            builder.root.meshes[mesh.value()].primitives[0]
                .attributes
                .insert(Valid(json::mesh::Semantic::Normals), normals);
            builder.build_model(0)
        };
        let a = build(1.0);
        let b = build(1.0 + 1e-6);
        let c = build(0.0);

        let strict = tolerant(1e-4);
        assert_ne!(signature_of(&a, &strict), signature_of(&b, &strict));

        let loose = SignatureOptions {
            geometry_tolerance: 1e-4,
            normal_tolerance: 1e-2,
            ..Default::default()
        };
        assert_eq!(signature_of(&a, &loose), signature_of(&b, &loose));
        assert_ne!(signature_of(&a, &loose), signature_of(&c, &loose));
    }

    #[test]
    fn test_skip_attribute_data_hash() {
        let build = |u: f32| {
            let mut builder = ModelBuilder::new();
            let positions = builder.positions(&TRI);
            let uvs = builder.positions(&[[u, 0.0, 0.0], [0.0, u, 0.0], [0.0, 0.0, u]]);
            let indices = builder.indices_u16(&[0, 1, 2]);
            let mesh = builder.mesh("m", positions, Some(indices));
            builder.root.meshes[mesh.value()].primitives[0]
                .attributes
                .insert(Valid(json::mesh::Semantic::TexCoords(0)), uvs);
            builder.build_model(0)
        };
        let a = build(0.25);
        let b = build(0.75);

        let plain = tolerant(1e-4);
        assert_ne!(signature_of(&a, &plain), signature_of(&b, &plain));

        let skipping = SignatureOptions {
            geometry_tolerance: 1e-4,
            skip_attribute_data_hash: ["TEXCOORD_0".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(signature_of(&a, &skipping), signature_of(&b, &skipping));
    }

    #[test]
    fn test_fallback_hash_never_collides_with_data_hash() {
        let resolved = one_mesh_model(&TRI);
        let mut unresolved = one_mesh_model(&TRI);
        unresolved.document.buffers[0].uri = Some("missing.bin".to_string());
        assert_ne!(
            signature_of(&resolved, &exact()),
            signature_of(&unresolved, &exact())
        );
        // The fallback itself is deterministic.
        let mut again = one_mesh_model(&TRI);
        again.document.buffers[0].uri = Some("missing.bin".to_string());
        assert_eq!(
            signature_of(&unresolved, &exact()),
            signature_of(&again, &exact())
        );
    }

    #[test]
    fn test_material_index_contributes() {
        let mut builder = ModelBuilder::new();
        let positions = builder.positions(&TRI);
        let indices = builder.indices_u16(&[0, 1, 2]);
        let mesh = builder.mesh("m", positions, Some(indices));
        let material = builder.root.push(json::Material::default());
        builder.root.meshes[mesh.value()].primitives[0].material = Some(material);
        let with_material = builder.build_model(0);
        let without_material = one_mesh_model(&TRI);
        assert_ne!(
            signature_of(&with_material, &exact()),
            signature_of(&without_material, &exact())
        );
    }

    #[test]
    fn test_attribute_order_is_lexicographic() {
        // BTreeMap already normalizes declaration order, so equal content in
        // any insertion order must hash identically.
        let build = |swap: bool| {
            let mut builder = ModelBuilder::new();
            let positions = builder.positions(&TRI);
            let normals = builder.positions(&[[0.0, 1.0, 0.0]; 3]);
            let indices = builder.indices_u16(&[0, 1, 2]);
            let mesh = builder.mesh("m", positions, Some(indices));
            let attributes: &mut BTreeMap<_, _> =
                &mut builder.root.meshes[mesh.value()].primitives[0].attributes;
            if swap {
                attributes.insert(Valid(json::mesh::Semantic::Normals), normals);
            } else {
                let previous = attributes.clone();
                attributes.clear();
                attributes.insert(Valid(json::mesh::Semantic::Normals), normals);
                attributes.extend(previous);
            }
            builder.build_model(0)
        };
        assert_eq!(
            signature_of(&build(false), &exact()),
            signature_of(&build(true), &exact())
        );
    }
}
