//! Image database reader
//!
//! Reads image configurations from
//! `image/overlay2/imagedb/content/sha256/<id>`. The file name is the
//! image ID, i.e. the sha256 of the file content.

use super::{digest_hex, DockerRoot};
use crate::error::{ForensicsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Root filesystem description of an image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    /// Usually "layers"
    #[serde(rename = "type", default)]
    pub fs_type: String,
    /// Layer content hashes, base layer first
    pub diff_ids: Vec<String>,
}

/// One build step recorded in the image config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// The step changed metadata only and produced no layer
    #[serde(default)]
    pub empty_layer: bool,
}

/// Runtime configuration section of an image config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub stop_signal: Option<String>,
    #[serde(default)]
    pub shell: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    config: Option<RuntimeConfig>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    rootfs: RootFs,
}

/// Parsed image configuration together with its raw bytes
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    /// Full image ID (hex, no algorithm prefix)
    pub id: String,
    /// File the metadata was read from
    pub source: PathBuf,
    /// Config bytes as stored on disk; Docker derives the image ID from them
    pub raw: Vec<u8>,
    /// Entire document, for the pretty-printed metadata copy
    pub document: serde_json::Value,
    pub created: Option<DateTime<Utc>>,
    pub architecture: Option<String>,
    pub os: Option<String>,
    pub config: Option<RuntimeConfig>,
    pub history: Vec<HistoryEntry>,
    pub rootfs: RootFs,
}

impl ImageMetadata {
    /// Parse an image config
    pub fn parse(id: &str, source: &Path, bytes: &[u8]) -> Result<Self> {
        let malformed = |message: String| ForensicsError::MalformedMetadata {
            path: source.to_path_buf(),
            message,
        };

        let raw = clean_metadata_bytes(bytes).to_vec();
        let document: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| malformed(e.to_string()))?;

        let has_diff_ids = document
            .get("rootfs")
            .and_then(|rootfs| rootfs.get("diff_ids"))
            .map(|ids| ids.is_array())
            .unwrap_or(false);
        if !has_diff_ids {
            return Err(malformed("missing rootfs.diff_ids array".to_string()));
        }

        let file: ConfigFile =
            serde_json::from_value(document.clone()).map_err(|e| malformed(e.to_string()))?;

        Ok(Self {
            id: id.to_string(),
            source: source.to_path_buf(),
            raw,
            document,
            created: file.created,
            architecture: file.architecture,
            os: file.os,
            config: file.config,
            history: file.history,
            rootfs: file.rootfs,
        })
    }

    /// Layer content hashes, base layer first
    pub fn diff_ids(&self) -> &[String] {
        &self.rootfs.diff_ids
    }

    /// First twelve characters of the image ID
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Pretty-printed copy of the metadata document
    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.document)?)
    }
}

/// Strip a UTF-8 BOM and trailing NUL padding picked up from disk slack
fn clean_metadata_bytes(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Listing entry for one image in the database
#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    pub layers: usize,
    pub repo_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RepositoriesFile {
    #[serde(rename = "Repositories", default)]
    repositories: HashMap<String, HashMap<String, String>>,
}

/// Read-only view of the image database
pub struct ImageDb {
    /// `imagedb/content/sha256`
    content_dir: PathBuf,
    /// `repositories.json`
    repositories_file: PathBuf,
}

impl ImageDb {
    /// Open the image database of a Docker root
    pub fn new(root: &DockerRoot) -> Self {
        Self {
            content_dir: root.imagedb_dir(),
            repositories_file: root.repositories_file(),
        }
    }

    /// Resolve a full or shortened image ID to the full ID
    pub fn resolve_id(&self, reference: &str) -> Result<String> {
        let wanted = digest_hex(reference).to_ascii_lowercase();
        if wanted.is_empty() || !wanted.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ForensicsError::NotFound(reference.to_string()));
        }

        let mut candidates = Vec::new();
        for id in self.entries()? {
            if id == wanted {
                return Ok(id);
            }
            if id.starts_with(&wanted) {
                candidates.push(id);
            }
        }

        match candidates.len() {
            0 => Err(ForensicsError::NotFound(reference.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => {
                candidates.sort();
                Err(ForensicsError::Ambiguous {
                    id: reference.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Look up and parse the metadata of an image
    pub fn read(&self, reference: &str) -> Result<ImageMetadata> {
        let id = self.resolve_id(reference)?;
        let path = self.content_dir.join(&id);
        let bytes = std::fs::read(&path)?;

        tracing::debug!("Read image metadata from {}", path.display());
        ImageMetadata::parse(&id, &path, &bytes)
    }

    /// Summaries of every parseable image in the database
    pub fn list(&self) -> Result<Vec<ImageSummary>> {
        let tags = self.repo_tags();
        let mut images = Vec::new();

        for id in self.entries()? {
            let path = self.content_dir.join(&id);
            let metadata = match std::fs::read(&path)
                .map_err(ForensicsError::from)
                .and_then(|bytes| ImageMetadata::parse(&id, &path, &bytes))
            {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Skipping image {}: {}", id, e);
                    continue;
                }
            };

            images.push(ImageSummary {
                repo_tags: tags.get(&id).cloned().unwrap_or_default(),
                created: metadata.created,
                layers: metadata.diff_ids().len(),
                id,
            });
        }

        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    /// Tags per image ID from `repositories.json`
    pub fn repo_tags(&self) -> HashMap<String, Vec<String>> {
        let mut tags: HashMap<String, Vec<String>> = HashMap::new();

        let file: RepositoriesFile = match std::fs::read(&self.repositories_file) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(
                    "Ignoring unparseable {}: {}",
                    self.repositories_file.display(),
                    e
                );
                RepositoriesFile::default()
            }),
            Err(_) => return tags,
        };

        for references in file.repositories.into_values() {
            for (reference, image) in references {
                // Digest references are not tags
                if reference.contains('@') {
                    continue;
                }
                tags.entry(digest_hex(&image).to_string())
                    .or_default()
                    .push(reference);
            }
        }

        for list in tags.values_mut() {
            list.sort();
        }
        tags
    }

    /// Image IDs present in the content directory
    fn entries(&self) -> Result<Vec<String>> {
        if !self.content_dir.is_dir() {
            return Err(ForensicsError::NotFound(format!(
                "image database {}",
                self.content_dir.display()
            )));
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_ascii_lowercase());
            }
        }
        Ok(ids)
    }
}
