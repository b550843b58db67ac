//! Byte-level access to accessor data.
//!
//! All reads materialize the exact element sequence an accessor describes:
//! element `i` lives at `view.byte_offset + accessor.byte_offset + i * stride`
//! where the stride falls back to the element size for tightly packed data.
//! This de-interleaves shared vertex buffers and is used both by the signature
//! engine and by the assembler's accessor copies.

use glam::DVec3;
use gltf_json as json;
use json::validation::Checked;

use super::LoadedModel;
use crate::error::{InstancingError, Result};
use crate::math::BoundingBox;

pub fn checked<T: Copy>(value: &Checked<T>) -> Option<T> {
    match value {
        Checked::Valid(inner) => Some(*inner),
        Checked::Invalid => None,
    }
}

/// Size in bytes of one element described by an accessor, when its type and
/// component type are well-formed.
pub fn element_size(accessor: &json::Accessor) -> Option<usize> {
    let type_ = checked(&accessor.type_)?;
    let component = checked(&accessor.component_type)?;
    Some(type_.multiplicity() * component.0.size())
}

/// Attribute semantic rendered as its glTF name (`POSITION`, `TEXCOORD_0`, …).
pub fn semantic_name(semantic: &json::mesh::Semantic) -> String {
    use json::mesh::Semantic;
    match semantic {
        Semantic::Positions => "POSITION".to_string(),
        Semantic::Normals => "NORMAL".to_string(),
        Semantic::Tangents => "TANGENT".to_string(),
        Semantic::Colors(set) => format!("COLOR_{set}"),
        Semantic::TexCoords(set) => format!("TEXCOORD_{set}"),
        Semantic::Joints(set) => format!("JOINTS_{set}"),
        Semantic::Weights(set) => format!("WEIGHTS_{set}"),
    }
}

/// Materialize the bytes of every element of an accessor, in order.
///
/// Returns `Ok(None)` when the accessor has no buffer view or the referenced
/// buffer's bytes are not in memory (external URI); structurally invalid
/// references and out-of-range reads are errors.
pub fn read_accessor_bytes(model: &LoadedModel, accessor_index: usize) -> Result<Option<Vec<u8>>> {
    let document = &model.document;
    let accessor =
        document
            .accessors
            .get(accessor_index)
            .ok_or(InstancingError::InvalidIndex {
                kind: "accessor",
                index: accessor_index,
            })?;
    let Some(view_index) = accessor.buffer_view else {
        return Ok(None);
    };
    let view =
        document
            .buffer_views
            .get(view_index.value())
            .ok_or(InstancingError::InvalidIndex {
                kind: "bufferView",
                index: view_index.value(),
            })?;
    if document.buffers.get(view.buffer.value()).is_none() {
        return Err(InstancingError::InvalidIndex {
            kind: "buffer",
            index: view.buffer.value(),
        });
    }
    let Some(buffer) = model.buffer_data(view.buffer.value()) else {
        return Ok(None);
    };

    let element = element_size(accessor).ok_or(InstancingError::MalformedAccessor {
        accessor: accessor_index,
    })?;
    let count = accessor.count.0 as usize;
    if count == 0 || element == 0 {
        return Ok(Some(Vec::new()));
    }
    let stride = view.byte_stride.map(|s| s.0).unwrap_or(element);
    let base = view.byte_offset.map(|o| o.0 as usize).unwrap_or(0)
        + accessor.byte_offset.map(|o| o.0 as usize).unwrap_or(0);
    let out_of_bounds = InstancingError::AccessorOutOfBounds {
        accessor: accessor_index,
        offset: base,
        stride,
        count,
        buffer_len: buffer.len(),
    };
    if stride < element || base + (count - 1) * stride + element > buffer.len() {
        return Err(out_of_bounds);
    }

    let mut out = Vec::with_capacity(count * element);
    for i in 0..count {
        let start = base + i * stride;
        out.extend_from_slice(&buffer[start..start + element]);
    }
    Ok(Some(out))
}

/// Read a `VEC3`/`FLOAT` accessor. `Ok(None)` when the accessor has another
/// shape or its data is not in memory.
pub fn read_vec3_f32(model: &LoadedModel, accessor_index: usize) -> Result<Option<Vec<[f32; 3]>>> {
    read_f32_elements::<3>(model, accessor_index, json::accessor::Type::Vec3)
}

/// Read a `VEC4`/`FLOAT` accessor. `Ok(None)` when the accessor has another
/// shape or its data is not in memory.
pub fn read_vec4_f32(model: &LoadedModel, accessor_index: usize) -> Result<Option<Vec<[f32; 4]>>> {
    read_f32_elements::<4>(model, accessor_index, json::accessor::Type::Vec4)
}

fn read_f32_elements<const N: usize>(
    model: &LoadedModel,
    accessor_index: usize,
    expected: json::accessor::Type,
) -> Result<Option<Vec<[f32; N]>>> {
    let Some(accessor) = model.document.accessors.get(accessor_index) else {
        return Err(InstancingError::InvalidIndex {
            kind: "accessor",
            index: accessor_index,
        });
    };
    let shape_matches = checked(&accessor.type_) == Some(expected)
        && checked(&accessor.component_type).map(|c| c.0)
            == Some(json::accessor::ComponentType::F32);
    if !shape_matches {
        return Ok(None);
    }
    let Some(bytes) = read_accessor_bytes(model, accessor_index)? else {
        return Ok(None);
    };
    let elements = bytes
        .chunks_exact(N * 4)
        .map(|chunk| {
            let mut element = [0f32; N];
            for (slot, value) in element.iter_mut().zip(chunk.chunks_exact(4)) {
                *slot = f32::from_le_bytes([value[0], value[1], value[2], value[3]]);
            }
            element
        })
        .collect();
    Ok(Some(elements))
}

fn vec3_from_json(value: &Option<json::Value>) -> Option<DVec3> {
    let array = value.as_ref()?.as_array()?;
    if array.len() < 3 {
        return None;
    }
    Some(DVec3::new(
        array[0].as_f64()?,
        array[1].as_f64()?,
        array[2].as_f64()?,
    ))
}

/// Local-space bounds of a primitive, from the POSITION accessor's declared
/// min/max when present, else by scanning the vertex data. Invalid (empty)
/// when neither is available.
pub fn primitive_bounding_box(model: &LoadedModel, primitive: &json::mesh::Primitive) -> BoundingBox {
    let position = primitive.attributes.iter().find_map(|(semantic, index)| {
        matches!(semantic, Checked::Valid(json::mesh::Semantic::Positions)).then(|| index.value())
    });
    let Some(accessor_index) = position else {
        return BoundingBox::default();
    };
    let Some(accessor) = model.document.accessors.get(accessor_index) else {
        return BoundingBox::default();
    };

    if let (Some(min), Some(max)) = (vec3_from_json(&accessor.min), vec3_from_json(&accessor.max))
    {
        return BoundingBox { min, max };
    }

    let mut bounds = BoundingBox::default();
    if let Ok(Some(positions)) = read_vec3_f32(model, accessor_index) {
        for position in positions {
            bounds.expand(DVec3::new(
                f64::from(position[0]),
                f64::from(position[1]),
                f64::from(position[2]),
            ));
        }
    }
    bounds
}

/// Union of all primitive bounds of a mesh.
pub fn mesh_bounding_box(model: &LoadedModel, mesh: &json::Mesh) -> BoundingBox {
    let mut bounds = BoundingBox::default();
    for primitive in &mesh.primitives {
        bounds.merge(&primitive_bounding_box(model, primitive));
    }
    bounds
}
