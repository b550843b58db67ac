//! Loading and in-memory representation of source GLB models.

pub mod accessor;
pub mod gpu_instancing;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use gltf_json as json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{InstancingError, Result};

/// A parsed GLB document together with its binary chunk, origin path,
/// whole-file content hash, and the stable id assigned at load time.
pub struct LoadedModel {
    pub document: json::Root,
    pub blob: Vec<u8>,
    pub path: PathBuf,
    pub file_hash: String,
    pub id: usize,
}

impl LoadedModel {
    pub fn from_bytes(bytes: &[u8], path: &Path, id: usize) -> Result<Self> {
        let glb = gltf::binary::Glb::from_slice(bytes)
            .map_err(|err| InstancingError::Glb(err.to_string()))?;
        let document: json::Root = json::deserialize::from_slice(&glb.json)?;
        let blob = glb.bin.map(|bin| bin.into_owned()).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let file_hash = digest.iter().map(|b| format!("{b:02x}")).collect();

        Ok(Self {
            document,
            blob,
            path: path.to_path_buf(),
            file_hash,
            id,
        })
    }

    /// Raw bytes backing a buffer, when they are available in memory.
    ///
    /// In a GLB the first buffer, when it carries no URI, refers to the BIN
    /// chunk. Buffers with external URIs are not resolved.
    pub fn buffer_data(&self, buffer: usize) -> Option<&[u8]> {
        let definition = self.document.buffers.get(buffer)?;
        if buffer == 0 && definition.uri.is_none() && !self.blob.is_empty() {
            Some(&self.blob)
        } else {
            None
        }
    }
}

/// Read and parse a single GLB file.
pub fn read_glb(path: &Path, id: usize) -> Result<LoadedModel> {
    debug!("reading GLB {}", path.display());
    let bytes = std::fs::read(path)?;
    let model = LoadedModel::from_bytes(&bytes, path, id)?;
    info!(
        "loaded {} ({} nodes, {} meshes)",
        path.display(),
        model.document.nodes.len(),
        model.document.meshes.len()
    );
    Ok(model)
}

/// Load every path in order, assigning sequential ids. Files that fail to
/// parse are skipped with a warning.
pub fn load_models(paths: &BTreeSet<PathBuf>) -> Vec<LoadedModel> {
    let mut models = Vec::with_capacity(paths.len());
    for path in paths {
        match read_glb(path, models.len()) {
            Ok(model) => models.push(model),
            Err(err) => warn!("skipping {}: {err}", path.display()),
        }
    }
    models
}

/// Enumerate candidate GLB files under a directory.
///
/// `.glb` files (case-insensitive extension) are collected directly;
/// `tileset.json` manifests are mined for `uri`/`url` references. Paths are
/// canonicalized where possible and returned sorted for deterministic load
/// order.
pub fn discover_glb_files(root: &Path, recursive: bool) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("directory walk error under {}: {err}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if extension.eq_ignore_ascii_case("glb") {
            found.insert(canonical_or_original(path));
        } else if extension.eq_ignore_ascii_case("json") {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.contains("tileset.json") {
                continue;
            }
            for referenced in extract_glb_paths_from_tileset(path) {
                if referenced.exists() {
                    found.insert(canonical_or_original(&referenced));
                } else {
                    warn!(
                        "GLB referenced in {} not found: {}",
                        path.display(),
                        referenced.display()
                    );
                }
            }
        }
    }
    info!("discovered {} unique GLB file(s)", found.len());
    found
}

/// Mine a 3D Tiles manifest for model references: every string value under a
/// `uri` or `url` key ending in `.glb` or `.gltf`, resolved relative to the
/// manifest's directory.
pub fn extract_glb_paths_from_tileset(tileset_path: &Path) -> Vec<PathBuf> {
    let bytes = match std::fs::read(tileset_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("could not read tileset {}: {err}", tileset_path.display());
            return Vec::new();
        }
    };
    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            warn!("failed to parse tileset {}: {err}", tileset_path.display());
            return Vec::new();
        }
    };
    let base = tileset_path.parent().unwrap_or_else(|| Path::new("."));
    let mut uris = BTreeSet::new();
    collect_content_uris(&value, base, &mut uris);
    if !uris.is_empty() {
        debug!(
            "tileset {} references {} model file(s)",
            tileset_path.display(),
            uris.len()
        );
    }
    uris.into_iter().collect()
}

fn collect_content_uris(value: &serde_json::Value, base: &Path, out: &mut BTreeSet<PathBuf>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                if let ("uri" | "url", serde_json::Value::String(uri)) = (key.as_str(), child) {
                    if uri.ends_with(".glb") || uri.ends_with(".gltf") {
                        out.insert(canonical_or_original(&base.join(uri)));
                    }
                } else {
                    collect_content_uris(child, base, out);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_content_uris(item, base, out);
            }
        }
        _ => {}
    }
}

fn canonical_or_original(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
