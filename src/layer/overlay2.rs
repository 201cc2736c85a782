//! overlay2 layer lookup
//!
//! Layout on a Docker host:
//!
//! ```text
//! image/overlay2/layerdb/sha256/<chain id>/diff        diff ID of the layer
//! image/overlay2/layerdb/sha256/<chain id>/parent      parent chain ID
//! image/overlay2/layerdb/sha256/<chain id>/cache-id    overlay2 directory name
//! image/overlay2/layerdb/sha256/<chain id>/tar-split.json.gz
//! overlay2/<cache id>/diff/                            changed files
//! overlay2/l/<short name> -> ../<cache id>/diff        short links
//! ```
//!
//! Some copies of a store lose `cache-id`; a `mount-id` file or the short
//! links under `l/` can still lead to the payload.

use super::{LayerLocator, LayerRequest, LocatedLayer};
use crate::path::is_plain_name;
use crate::store::{digest_hex, read_trimmed, DockerRoot, STORAGE_DRIVER};
use std::path::{Path, PathBuf};

/// Characters of a hash used for shortened lookups
const SHORT_ID_LEN: usize = 12;

const CACHE_ID_FILE: &str = "cache-id";
const MOUNT_ID_FILE: &str = "mount-id";

/// Directory of short symlinks the driver keeps to shorten mount options
const LINK_DIR: &str = "l";

/// Locates layers in an overlay2 store
pub struct Overlay2Locator {
    layerdb: PathBuf,
    driver_dir: PathBuf,
}

impl Overlay2Locator {
    pub fn new(root: &DockerRoot) -> Self {
        Self {
            layerdb: root.layerdb_dir(),
            driver_dir: root.driver_dir(),
        }
    }

    /// Find the layer database entry of a layer
    fn metadata_dir(&self, request: &LayerRequest<'_>) -> Result<PathBuf, String> {
        let chain_hex = digest_hex(request.chain_id);
        let diff_hex = digest_hex(request.diff_id);

        for exact in [chain_hex, diff_hex] {
            let path = self.layerdb.join(exact);
            if path.is_dir() {
                return Ok(path);
            }
        }

        let entries = list_dirs(&self.layerdb);
        if entries.is_empty() {
            return Err(format!(
                "layer database {} is empty or unreadable",
                self.layerdb.display()
            ));
        }

        // Entries whose recorded diff matches, e.g. after a chain ID rename
        let by_diff: Vec<&(String, PathBuf)> = entries
            .iter()
            .filter(|(_, path)| {
                read_trimmed(&path.join("diff")).as_deref() == Some(request.diff_id)
            })
            .collect();
        match by_diff.len() {
            0 => {}
            1 => return Ok(by_diff[0].1.clone()),
            _ => {
                let expected_parent = request.parent_chain_id;
                let with_parent: Vec<_> = by_diff
                    .iter()
                    .filter(|(_, path)| {
                        read_trimmed(&path.join("parent")).as_deref() == expected_parent
                    })
                    .collect();
                if with_parent.len() == 1 {
                    return Ok(with_parent[0].1.clone());
                }
                return Err(format!(
                    "{} layer database entries record diff {}",
                    by_diff.len(),
                    request.diff_id
                ));
            }
        }

        let mut by_prefix: Vec<&PathBuf> = Vec::new();
        for hex in [chain_hex, diff_hex] {
            let prefix = &hex[..hex.len().min(SHORT_ID_LEN)];
            for (name, path) in &entries {
                if name.starts_with(prefix) && !by_prefix.contains(&path) {
                    by_prefix.push(path);
                }
            }
        }
        match by_prefix.len() {
            0 => Err(format!(
                "no layer database entry for chain {}",
                request.chain_id
            )),
            1 => Ok(by_prefix[0].clone()),
            n => Err(format!("{} layer database entries share the prefix", n)),
        }
    }

    /// Resolve the payload directory recorded in `cache-id`, or failing
    /// that in `mount-id`
    fn payload_dir(&self, metadata_dir: &Path) -> Result<PathBuf, String> {
        let ids: Vec<String> = [CACHE_ID_FILE, MOUNT_ID_FILE]
            .iter()
            .filter_map(|name| read_trimmed(&metadata_dir.join(name)))
            .collect();
        if ids.is_empty() {
            return Err(format!("no cache-id in {}", metadata_dir.display()));
        }

        let mut reasons = Vec::new();
        for id in &ids {
            match self.layer_dir(id) {
                Ok(layer_dir) => return Ok(diff_dir(layer_dir)),
                Err(reason) => reasons.push(reason),
            }
        }
        Err(reasons.join("; "))
    }

    /// Driver directory named by `id`: exact, then unique prefix, then a
    /// short name under `l/`
    fn layer_dir(&self, id: &str) -> Result<PathBuf, String> {
        if !is_plain_name(id) {
            return Err(format!("invalid {} directory name {:?}", STORAGE_DRIVER, id));
        }

        let exact = self.driver_dir.join(id);
        if exact.is_dir() {
            return Ok(exact);
        }

        let matches: Vec<PathBuf> = list_dirs(&self.driver_dir)
            .into_iter()
            .filter(|(name, _)| name != LINK_DIR && name.starts_with(id))
            .map(|(_, path)| path)
            .collect();
        match matches.len() {
            0 => {}
            1 => return Ok(matches.into_iter().next().unwrap_or_default()),
            n => return Err(format!("{} directories match cache-id {}", n, id)),
        }

        self.short_link(id).ok_or_else(|| {
            format!("{} directory {} not found", STORAGE_DRIVER, id)
        })
    }

    /// Follow `l/<short>` by name only; the link target is never opened
    ///
    /// The links point at `../<dir>/diff`; a link matches when its own name
    /// is the first twelve characters of `id` or its target directory name
    /// starts with `id`.
    fn short_link(&self, id: &str) -> Option<PathBuf> {
        let links = std::fs::read_dir(self.driver_dir.join(LINK_DIR)).ok()?;
        let short = &id[..id.len().min(SHORT_ID_LEN)];

        let mut found: Vec<String> = links
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let target = std::fs::read_link(entry.path()).ok()?;
                let dir_name = link_target_dir(&target)?;
                let link_name = entry.file_name();
                if link_name.to_str() == Some(short) || dir_name.starts_with(id) {
                    Some(dir_name)
                } else {
                    None
                }
            })
            .collect();
        found.sort();
        found.dedup();

        match found.as_slice() {
            [dir_name] => {
                let dir = self.driver_dir.join(dir_name);
                tracing::debug!("Resolved {} through {}/{}", id, LINK_DIR, dir_name);
                Some(dir).filter(|d| d.is_dir())
            }
            _ => None,
        }
    }
}

/// Layer directory named by a `l/` link target such as `../<dir>/diff`
fn link_target_dir(target: &Path) -> Option<String> {
    let dir = if target.file_name()? == "diff" {
        target.parent()?.file_name()?
    } else {
        target.file_name()?
    };
    let name = dir.to_str()?;
    is_plain_name(name).then(|| name.to_string())
}

/// The `diff` subdirectory, or the layer directory itself when it has none
fn diff_dir(layer_dir: PathBuf) -> PathBuf {
    let diff = layer_dir.join("diff");
    if diff.is_dir() {
        diff
    } else {
        tracing::warn!(
            "{} has no diff directory, using the layer directory itself",
            layer_dir.display()
        );
        layer_dir
    }
}

impl LayerLocator for Overlay2Locator {
    fn driver(&self) -> &'static str {
        STORAGE_DRIVER
    }

    fn locate(&self, request: &LayerRequest<'_>) -> Result<LocatedLayer, String> {
        let metadata_dir = self.metadata_dir(request)?;

        let recorded_parent = read_trimmed(&metadata_dir.join("parent"));
        if recorded_parent.as_deref() != request.parent_chain_id {
            tracing::warn!(
                "Layer {} records parent {:?}, expected {:?}",
                request.position + 1,
                recorded_parent,
                request.parent_chain_id
            );
        }

        let payload_dir = self.payload_dir(&metadata_dir)?;
        let tar_split = Some(metadata_dir.join("tar-split.json.gz")).filter(|p| p.is_file());

        Ok(LocatedLayer {
            metadata_dir,
            payload_dir,
            tar_split,
        })
    }
}

/// Subdirectories of `dir` with their names, sorted by name
fn list_dirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot list {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            Some((name, entry.path()))
        })
        .collect();
    dirs.sort();
    dirs
}
