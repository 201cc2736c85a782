//! Run summary
//!
//! Problems confined to one layer or one file never abort an image. They
//! are collected here and written to `summary.json` so an investigator can
//! judge how far a partial reconstruction can be trusted.

use crate::archive::ArchiveConfig;
use crate::error::{ForensicsError, Result};
use crate::extract::{ExtractedLayer, Strategy};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Whether every layer of an image was recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconstructionStatus {
    Complete,
    Incomplete,
}

impl std::fmt::Display for ReconstructionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconstructionStatus::Complete => write!(f, "Complete"),
            ReconstructionStatus::Incomplete => write!(f, "Incomplete"),
        }
    }
}

/// Category of a recovered problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Layer content could not be located
    Missing,
    /// A file inside a layer could not be read
    UnreadableEntry,
    /// Some layers are placeholders
    IncompleteChain,
    /// The tar-split index was present but unusable
    TarSplitFallback,
    /// The produced layer tar does not hash to its diff ID
    DigestMismatch,
    /// The archive references a config rewritten to the produced digests
    ConfigRewritten,
}

/// A non-fatal problem found while reconstructing an image
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    /// 1-based layer position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            layer: None,
            path: None,
            message: message.into(),
        }
    }

    pub fn layer(mut self, position: usize) -> Self {
        self.layer = Some(position + 1);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Per-layer line of the summary
#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub position: usize,
    pub diff_id: String,
    pub chain_id: String,
    /// Directory name of the layer inside the archive
    pub legacy_id: String,
    pub resolved: bool,
    pub strategy: Strategy,
    pub digest: String,
    pub digest_matches: bool,
    pub size: u64,
    pub entries: usize,
    pub whiteouts: usize,
}

impl LayerSummary {
    pub fn new(
        position: usize,
        diff_id: &str,
        chain_id: &str,
        legacy_id: &str,
        layer: &ExtractedLayer,
    ) -> Self {
        Self {
            position,
            diff_id: diff_id.to_string(),
            chain_id: chain_id.to_string(),
            legacy_id: legacy_id.to_string(),
            resolved: layer.strategy != Strategy::Placeholder,
            strategy: layer.strategy,
            digest: layer.digest.clone(),
            digest_matches: layer.digest == diff_id,
            size: layer.size,
            entries: layer.entries,
            whiteouts: layer.whiteouts,
        }
    }
}

/// Outcome of reconstructing one image
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub image_id: String,
    pub output_dir: PathBuf,
    pub archive: PathBuf,
    /// Config the archive's manifest points at
    pub config: ArchiveConfig,
    pub repo_tags: Vec<String>,
    pub status: ReconstructionStatus,
    pub layers_total: usize,
    pub layers_resolved: usize,
    pub layers_missing: usize,
    pub unreadable_entries: usize,
    /// Layers whose tar hashes to the recorded diff ID
    pub digest_matches: usize,
    pub layers: Vec<LayerSummary>,
    pub issues: Vec<Issue>,
}

impl Summary {
    /// Derive counts and status from the per-layer results
    pub fn new(
        image_id: &str,
        output_dir: &Path,
        archive: &Path,
        config: ArchiveConfig,
        repo_tags: &[String],
        layers: Vec<LayerSummary>,
        issues: Vec<Issue>,
    ) -> Self {
        let layers_resolved = layers.iter().filter(|l| l.resolved).count();
        let layers_missing = layers.len() - layers_resolved;
        let unreadable_entries = issues
            .iter()
            .filter(|i| i.kind == IssueKind::UnreadableEntry)
            .count();
        let digest_matches = layers.iter().filter(|l| l.digest_matches).count();
        let status = if layers_missing == 0 {
            ReconstructionStatus::Complete
        } else {
            ReconstructionStatus::Incomplete
        };

        Self {
            image_id: image_id.to_string(),
            output_dir: output_dir.to_path_buf(),
            archive: archive.to_path_buf(),
            config,
            repo_tags: repo_tags.to_vec(),
            status,
            layers_total: layers.len(),
            layers_resolved,
            layers_missing,
            unreadable_entries,
            digest_matches,
            layers,
            issues,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ReconstructionStatus::Complete
    }

    /// Write `summary.json`
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|e| ForensicsError::write(path, e))
    }

    /// Emit the summary through the log
    pub fn log(&self) {
        tracing::info!(
            "Image {}: {} ({}/{} layers resolved, {} unreadable entries, {}/{} digests match)",
            &self.image_id[..self.image_id.len().min(12)],
            self.status,
            self.layers_resolved,
            self.layers_total,
            self.unreadable_entries,
            self.digest_matches,
            self.layers_total
        );
        for issue in &self.issues {
            match issue.layer {
                Some(layer) => tracing::warn!("Layer {}: {}", layer, issue.message),
                None => tracing::warn!("{}", issue.message),
            }
        }
        if self.config.is_derived() {
            tracing::info!("Archive loads as image {}", self.config.image_id);
        }
        tracing::info!("Archive written to {}", self.archive.display());
    }
}
