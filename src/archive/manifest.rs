//! `docker save` metadata documents
//!
//! ```text
//! manifest.json      [{"Config":"<id>.json","RepoTags":[...],"Layers":["<v1>/layer.tar",...]}]
//! repositories       {"<repo>":{"<tag>":"<top v1 id>"}}
//! <v1>/VERSION       1.0
//! <v1>/json          {"id":"<v1>","parent":"<parent v1>","created":"1970-01-01T00:00:00Z"}
//! ```

use crate::digest::{chain_ids, legacy_layer_id, LEGACY_CREATED};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contents of each layer's `VERSION` file
pub const LAYER_VERSION: &str = "1.0";

/// Name of the layer tar inside a layer directory
pub const LAYER_TAR: &str = "layer.tar";

/// Naming of one layer inside the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    pub position: usize,
    pub diff_id: String,
    pub chain_id: String,
    /// Directory name inside the archive
    pub legacy_id: String,
    pub parent_legacy_id: Option<String>,
}

impl LayerPlan {
    /// Archive-relative path of the layer tar
    pub fn tar_path(&self) -> String {
        format!("{}/{}", self.legacy_id, LAYER_TAR)
    }

    /// The layer's `json` descriptor
    pub fn descriptor(&self) -> LegacyLayer {
        LegacyLayer {
            id: self.legacy_id.clone(),
            parent: self.parent_legacy_id.clone(),
            created: LEGACY_CREATED.to_string(),
        }
    }
}

/// Name every layer of an ordered diff ID list
pub fn plan_layers(diff_ids: &[String]) -> Vec<LayerPlan> {
    let chain = chain_ids(diff_ids);
    let mut plans: Vec<LayerPlan> = Vec::with_capacity(diff_ids.len());

    for (position, (diff_id, chain_id)) in diff_ids.iter().zip(chain).enumerate() {
        let parent_legacy_id = plans.last().map(|p| p.legacy_id.clone());
        let legacy_id = legacy_layer_id(&chain_id, parent_legacy_id.as_deref());
        plans.push(LayerPlan {
            position,
            diff_id: diff_id.clone(),
            chain_id,
            legacy_id,
            parent_legacy_id,
        });
    }

    plans
}

/// Per-layer `json` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLayer {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created: String,
}

/// One element of `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

impl ManifestEntry {
    pub fn new(image_id: &str, repo_tags: &[String], plans: &[LayerPlan]) -> Self {
        Self {
            config: config_file_name(image_id),
            repo_tags: repo_tags.to_vec(),
            layers: plans.iter().map(LayerPlan::tar_path).collect(),
        }
    }
}

/// Archive name of the raw image config
pub fn config_file_name(image_id: &str) -> String {
    format!("{}.json", image_id)
}

/// Image config referenced by `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveConfig {
    /// ID the image gets when loaded
    pub image_id: String,
    pub file: String,
    /// 1-based positions of layers whose diff ID was replaced by the digest
    /// of the tar actually written
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replaced_layers: Vec<usize>,
}

impl ArchiveConfig {
    /// The recovered config, unchanged
    pub fn original(image_id: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            file: config_file_name(image_id),
            replaced_layers: Vec::new(),
        }
    }

    pub fn is_derived(&self) -> bool {
        !self.replaced_layers.is_empty()
    }
}

/// Copy of a config document with `rootfs.diff_ids` set to `digests`
pub fn rewrite_diff_ids(
    document: &serde_json::Value,
    digests: &[String],
) -> serde_json::Result<Vec<u8>> {
    let mut document = document.clone();
    if let Some(object) = document.as_object_mut() {
        let rootfs = object
            .entry("rootfs")
            .or_insert_with(|| serde_json::json!({"type": "layers"}));
        if !rootfs.is_object() {
            *rootfs = serde_json::json!({"type": "layers"});
        }
        rootfs["diff_ids"] = serde_json::Value::from(digests.to_vec());
    }
    serde_json::to_vec(&document)
}

/// Serialized `manifest.json`
pub fn manifest_bytes(entry: &ManifestEntry) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&[entry])
}

/// Legacy `repositories` map, `None` when nothing can be tagged
pub fn repositories(
    repo_tags: &[String],
    plans: &[LayerPlan],
) -> Option<BTreeMap<String, BTreeMap<String, String>>> {
    let top = plans.last()?;
    let mut repos: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    for reference in repo_tags {
        let (repo, tag) = split_reference(reference);
        repos
            .entry(repo.to_string())
            .or_default()
            .insert(tag.to_string(), top.legacy_id.clone());
    }

    if repos.is_empty() {
        None
    } else {
        Some(repos)
    }
}

/// Split `repo[:tag]`, leaving registry ports alone
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}
