//! Extraction options

use crate::error::{ForensicsError, Result};
use crate::path::normalize_separators;
use std::path::{Path, PathBuf};

/// Tag applied to recovered images when none is given
pub const DEFAULT_REPO_TAG: &str = "forensic/recovered:latest";

/// Options for one extraction run
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Mount point of the evidence filesystem
    pub mount_path: PathBuf,
    /// Directory that receives one `image_<id>` directory per image
    pub output_dir: PathBuf,
    /// Docker root override; discovered under the mount when unset
    pub docker_root: Option<PathBuf>,
    /// Repository tags written into the manifest
    pub repo_tags: Vec<String>,
    /// Gzip the combined archive
    pub compress: bool,
}

impl ExtractOptions {
    /// Create options for a mount path and an output directory
    pub fn new(mount_path: impl AsRef<Path>, output_dir: impl AsRef<Path>) -> Self {
        Self {
            mount_path: normalize_separators(mount_path.as_ref()),
            output_dir: normalize_separators(output_dir.as_ref()),
            docker_root: None,
            repo_tags: vec![DEFAULT_REPO_TAG.to_string()],
            compress: false,
        }
    }

    /// Use an explicit Docker root instead of searching the mount
    pub fn docker_root(mut self, path: impl AsRef<Path>) -> Self {
        self.docker_root = Some(normalize_separators(path.as_ref()));
        self
    }

    /// Replace the repository tags
    pub fn repo_tags(mut self, tags: Vec<String>) -> Self {
        self.repo_tags = tags;
        self
    }

    /// Enable or disable gzip compression of the combined archive
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Check that nothing will be written inside the evidence mount
    pub fn validate(&self) -> Result<()> {
        if !self.mount_path.is_dir() {
            return Err(ForensicsError::InvalidConfig(format!(
                "mount path {} is not a directory",
                self.mount_path.display()
            )));
        }

        for tag in &self.repo_tags {
            if tag.is_empty() || tag.contains(char::is_whitespace) {
                return Err(ForensicsError::InvalidConfig(format!(
                    "invalid repository tag: {:?}",
                    tag
                )));
            }
        }

        let mount = self.mount_path.canonicalize()?;
        let output = resolve_existing_prefix(&self.output_dir)?;
        if output.starts_with(&mount) {
            return Err(ForensicsError::EvidenceWrite(self.output_dir.clone()));
        }

        Ok(())
    }
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let options = ExtractOptions::new("/mnt/evidence", "/cases/out");
        assert_eq!(options.repo_tags, vec![DEFAULT_REPO_TAG.to_string()]);
        assert!(!options.compress);
        assert!(options.docker_root.is_none());
    }

    #[test]
    fn test_output_inside_mount_is_rejected() {
        let temp = tempdir().unwrap();
        let mount = temp.path().join("mount");
        std::fs::create_dir_all(&mount).unwrap();

        let options = ExtractOptions::new(&mount, mount.join("out").join("nested"));
        assert!(matches!(
            options.validate(),
            Err(ForensicsError::EvidenceWrite(_))
        ));
    }

    #[test]
    fn test_output_beside_mount_is_accepted() {
        let temp = tempdir().unwrap();
        let mount = temp.path().join("mount");
        std::fs::create_dir_all(&mount).unwrap();

        let options = ExtractOptions::new(&mount, temp.path().join("out"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_tag_is_rejected() {
        let temp = tempdir().unwrap();
        let options = ExtractOptions::new(temp.path(), temp.path().join("../elsewhere"))
            .repo_tags(vec!["bad tag".to_string()]);
        assert!(matches!(
            options.validate(),
            Err(ForensicsError::InvalidConfig(_))
        ));
    }
}
