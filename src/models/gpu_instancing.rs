//! Typed view of the `EXT_mesh_gpu_instancing` node extension.
//!
//! Inbound payloads arrive as raw JSON in the node's extension map; they are
//! resolved into this struct once, at the point of use, and written back the
//! same way. Unknown per-instance attributes are preserved.

use std::collections::BTreeMap;

use gltf_json as json;
use serde::Deserialize;
use tracing::warn;

pub const EXT_MESH_GPU_INSTANCING: &str = "EXT_mesh_gpu_instancing";

pub const TRANSLATION: &str = "TRANSLATION";
pub const ROTATION: &str = "ROTATION";
pub const SCALE: &str = "SCALE";

/// Per-instance attribute accessors declared on a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeshGpuInstancing {
    #[serde(default)]
    pub attributes: BTreeMap<String, json::Index<json::Accessor>>,
}

impl MeshGpuInstancing {
    /// Parse the extension off a node, if present. Malformed payloads are
    /// reported and treated as absent.
    pub fn from_node(node: &json::Node) -> Option<Self> {
        let raw = node.extensions.as_ref()?.others.get(EXT_MESH_GPU_INSTANCING)?;
        match serde_json::from_value(raw.clone()) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!("malformed EXT_mesh_gpu_instancing payload: {err}");
                None
            }
        }
    }

    pub fn accessor(&self, attribute: &str) -> Option<usize> {
        self.attributes.get(attribute).map(|index| index.value())
    }

    /// The shared instance count, when every declared attribute accessor
    /// exists and agrees on it. `None` for an empty attribute set, a dangling
    /// accessor index, or mismatched counts.
    pub fn instance_count(&self, document: &json::Root) -> Option<u64> {
        let mut count = None;
        for index in self.attributes.values() {
            let accessor = document.accessors.get(index.value())?;
            match count {
                None => count = Some(accessor.count.0),
                Some(existing) if existing != accessor.count.0 => return None,
                Some(_) => {}
            }
        }
        count
    }

    fn to_value(&self) -> serde_json::Value {
        let attributes: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .map(|(name, index)| (name.clone(), serde_json::Value::from(index.value() as u64)))
            .collect();
        serde_json::json!({ "attributes": attributes })
    }

    /// Install (or replace) the extension payload on a node.
    pub fn apply_to_node(&self, node: &mut json::Node) {
        let extensions = node.extensions.get_or_insert_with(Default::default);
        extensions
            .others
            .insert(EXT_MESH_GPU_INSTANCING.to_string(), self.to_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_node() {
        let mut ext = MeshGpuInstancing::default();
        ext.attributes
            .insert(TRANSLATION.to_string(), json::Index::new(3));
        ext.attributes.insert(ROTATION.to_string(), json::Index::new(4));

        let mut node = json::Node::default();
        ext.apply_to_node(&mut node);
        let parsed = MeshGpuInstancing::from_node(&node).unwrap();
        assert_eq!(parsed.accessor(TRANSLATION), Some(3));
        assert_eq!(parsed.accessor(ROTATION), Some(4));
        assert_eq!(parsed.accessor(SCALE), None);
    }

    #[test]
    fn test_absent_extension() {
        let node = json::Node::default();
        assert!(MeshGpuInstancing::from_node(&node).is_none());
    }

    #[test]
    fn test_malformed_payload_is_ignored() {
        let mut node = json::Node::default();
        let extensions = node.extensions.get_or_insert_with(Default::default);
        extensions.others.insert(
            EXT_MESH_GPU_INSTANCING.to_string(),
            serde_json::json!({ "attributes": "not-a-map" }),
        );
        assert!(MeshGpuInstancing::from_node(&node).is_none());
    }

    #[test]
    fn test_instance_count_consistency() {
        use crate::models::fixtures::ModelBuilder;

        let mut builder = ModelBuilder::new();
        let translations = builder.positions(&[[0.0; 3], [1.0, 0.0, 0.0]]);
        let scales = builder.positions(&[[1.0; 3]]);
        let model = builder.build_model(0);

        let mut ext = MeshGpuInstancing::default();
        ext.attributes.insert(TRANSLATION.to_string(), translations);
        assert_eq!(ext.instance_count(&model.document), Some(2));

        ext.attributes.insert(SCALE.to_string(), scales);
        assert_eq!(ext.instance_count(&model.document), None);
    }
}
