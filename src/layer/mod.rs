//! Layer chain resolution
//!
//! Maps the ordered `rootfs.diff_ids` of an image onto layer directories
//! in the storage driver. The driver layout is hidden behind
//! [`LayerLocator`]; overlay2 is the only implementation.

pub mod overlay2;

pub use overlay2::Overlay2Locator;

use crate::digest::chain_ids;
use serde::Serialize;
use std::path::PathBuf;

/// What a locator is asked to find
#[derive(Debug, Clone, Copy)]
pub struct LayerRequest<'a> {
    /// Zero-based position in the chain, base first
    pub position: usize,
    pub diff_id: &'a str,
    pub chain_id: &'a str,
    /// Chain ID of the layer below, `None` for the base layer
    pub parent_chain_id: Option<&'a str>,
}

/// On-disk location of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedLayer {
    /// Layer database entry (`layerdb/sha256/<chain id>`)
    pub metadata_dir: PathBuf,
    /// Directory holding the changed files
    pub payload_dir: PathBuf,
    /// `tar-split.json.gz` index for byte-exact reassembly
    pub tar_split: Option<PathBuf>,
}

/// Storage-driver specific layer lookup
pub trait LayerLocator {
    /// Name of the storage driver
    fn driver(&self) -> &'static str;

    /// Find a layer, or explain why it is missing
    fn locate(&self, request: &LayerRequest<'_>) -> std::result::Result<LocatedLayer, String>;
}

/// Resolution outcome for one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LayerStatus {
    Resolved(LocatedLayer),
    Missing { reason: String },
}

/// One entry of the resolved chain
#[derive(Debug, Clone, Serialize)]
pub struct LayerRecord {
    pub position: usize,
    pub diff_id: String,
    pub chain_id: String,
    #[serde(flatten)]
    pub status: LayerStatus,
}

impl LayerRecord {
    pub fn is_resolved(&self) -> bool {
        matches!(self.status, LayerStatus::Resolved(_))
    }

    /// Location of the layer when it was resolved
    pub fn located(&self) -> Option<&LocatedLayer> {
        match &self.status {
            LayerStatus::Resolved(located) => Some(located),
            LayerStatus::Missing { .. } => None,
        }
    }
}

/// Resolve every diff ID, preserving the input order
pub fn resolve_chain(locator: &dyn LayerLocator, diff_ids: &[String]) -> Vec<LayerRecord> {
    let chain = chain_ids(diff_ids);
    let mut records = Vec::with_capacity(diff_ids.len());

    for (position, (diff_id, chain_id)) in diff_ids.iter().zip(chain.iter()).enumerate() {
        let request = LayerRequest {
            position,
            diff_id,
            chain_id,
            parent_chain_id: position.checked_sub(1).map(|p| chain[p].as_str()),
        };

        let status = match locator.locate(&request) {
            Ok(located) => {
                tracing::debug!(
                    "Layer {} ({}) resolved to {}",
                    position + 1,
                    diff_id,
                    located.payload_dir.display()
                );
                LayerStatus::Resolved(located)
            }
            Err(reason) => {
                tracing::warn!(
                    "Layer {} ({}) missing from {} store: {}",
                    position + 1,
                    diff_id,
                    locator.driver(),
                    reason
                );
                LayerStatus::Missing { reason }
            }
        };

        records.push(LayerRecord {
            position,
            diff_id: diff_id.clone(),
            chain_id: chain_id.clone(),
            status,
        });
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Locator backed by a fixed map from diff ID to payload directory
    struct MapLocator(HashMap<String, PathBuf>);

    impl LayerLocator for MapLocator {
        fn driver(&self) -> &'static str {
            "map"
        }

        fn locate(&self, request: &LayerRequest<'_>) -> std::result::Result<LocatedLayer, String> {
            self.0
                .get(request.diff_id)
                .map(|dir| LocatedLayer {
                    metadata_dir: dir.clone(),
                    payload_dir: dir.clone(),
                    tar_split: None,
                })
                .ok_or_else(|| "not mapped".to_string())
        }
    }

    #[test]
    fn test_order_preserved_and_missing_reported() {
        let mut map = HashMap::new();
        map.insert("sha256:ccc".to_string(), PathBuf::from("/c"));
        map.insert("sha256:aaa".to_string(), PathBuf::from("/a"));
        let locator = MapLocator(map);

        let diff_ids = vec![
            "sha256:ccc".to_string(),
            "sha256:bbb".to_string(),
            "sha256:aaa".to_string(),
        ];
        let records = resolve_chain(&locator, &diff_ids);

        let order: Vec<&str> = records.iter().map(|r| r.diff_id.as_str()).collect();
        assert_eq!(order, vec!["sha256:ccc", "sha256:bbb", "sha256:aaa"]);
        assert!(records[0].is_resolved());
        assert!(!records[1].is_resolved());
        assert!(records[2].is_resolved());
        assert_eq!(records[0].chain_id, "sha256:ccc");
        assert_eq!(records[2].located().unwrap().payload_dir, PathBuf::from("/a"));
    }
}
