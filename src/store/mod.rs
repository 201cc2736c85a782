//! Docker data root on the evidence mount
//!
//! This module knows where the overlay2 driver keeps its image and layer
//! databases relative to the Docker root, and how to find that root inside
//! a mounted host filesystem.

pub mod imagedb;

pub use imagedb::{ImageDb, ImageMetadata, ImageSummary};

use crate::error::{ForensicsError, Result};
use crate::path::{join_relative, normalize_separators};
use std::path::{Path, PathBuf};

/// Storage driver whose on-disk layout is understood
pub const STORAGE_DRIVER: &str = "overlay2";

/// Docker root candidates relative to the mount path, in search order
pub const DOCKER_ROOT_CANDIDATES: &[&str] = &[
    "var/lib/docker",
    "[root]/var/lib/docker",
    "Docker",
    "ProgramData/Docker",
    "ProgramData/docker",
];

/// A Docker data root (normally `/var/lib/docker`) on the evidence mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerRoot {
    root: PathBuf,
}

impl DockerRoot {
    /// Wrap a known Docker root
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize_separators(root.as_ref()),
        }
    }

    /// Search a mounted host filesystem for its Docker root
    pub fn discover(mount_path: &Path) -> Result<Self> {
        let mount_path = normalize_separators(mount_path);

        for candidate in DOCKER_ROOT_CANDIDATES {
            let Some(path) = join_relative(&mount_path, candidate) else {
                continue;
            };
            if path.is_dir() {
                tracing::debug!("Docker root candidate {} matched", candidate);
                return Ok(Self { root: path });
            }
        }

        // The mount may already be the Docker root itself
        if mount_path.join("image").join(STORAGE_DRIVER).is_dir() {
            return Ok(Self { root: mount_path });
        }

        Err(ForensicsError::DockerRootNotFound(mount_path))
    }

    /// Root directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Driver-specific image metadata directory
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image").join(STORAGE_DRIVER)
    }

    /// Image configuration store, keyed by image ID
    pub fn imagedb_dir(&self) -> PathBuf {
        self.image_dir()
            .join("imagedb")
            .join("content")
            .join("sha256")
    }

    /// Layer metadata store, keyed by chain ID
    pub fn layerdb_dir(&self) -> PathBuf {
        self.image_dir().join("layerdb").join("sha256")
    }

    /// Tag index written by the daemon
    pub fn repositories_file(&self) -> PathBuf {
        self.image_dir().join("repositories.json")
    }

    /// Directory holding the layer payloads
    pub fn driver_dir(&self) -> PathBuf {
        self.root.join(STORAGE_DRIVER)
    }
}

/// Strip an optional `sha256:` prefix from a digest string
pub fn digest_hex(digest: &str) -> &str {
    let digest = digest.trim();
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Read a small metadata file and trim surrounding whitespace
pub(crate) fn read_trimmed(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let content = content.trim();
            if content.is_empty() {
                None
            } else {
                Some(content.to_string())
            }
        }
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_discover_linux_root() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("var").join("lib").join("docker");
        std::fs::create_dir_all(&root).unwrap();

        let found = DockerRoot::discover(temp.path()).unwrap();
        assert_eq!(found.path(), root.as_path());
    }

    #[test]
    fn test_discover_bracketed_root_volume() {
        let temp = tempdir().unwrap();
        let root = temp
            .path()
            .join("[root]")
            .join("var")
            .join("lib")
            .join("docker");
        std::fs::create_dir_all(&root).unwrap();

        let found = DockerRoot::discover(temp.path()).unwrap();
        assert_eq!(found.path(), root.as_path());
    }

    #[test]
    fn test_discover_mount_is_docker_root() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("image").join("overlay2")).unwrap();

        let found = DockerRoot::discover(temp.path()).unwrap();
        assert_eq!(found.path(), temp.path());
    }

    #[test]
    fn test_discover_nonexistent() {
        let result = DockerRoot::discover(Path::new("/nonexistent/path"));
        assert!(matches!(result, Err(ForensicsError::DockerRootNotFound(_))));
    }

    #[test]
    fn test_store_layout() {
        let root = DockerRoot::new("/var/lib/docker");
        assert_eq!(
            root.imagedb_dir(),
            PathBuf::from("/var/lib/docker/image/overlay2/imagedb/content/sha256")
        );
        assert_eq!(
            root.layerdb_dir(),
            PathBuf::from("/var/lib/docker/image/overlay2/layerdb/sha256")
        );
        assert_eq!(root.driver_dir(), PathBuf::from("/var/lib/docker/overlay2"));
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc"), "abc");
        assert_eq!(digest_hex(" abc\n"), "abc");
    }
}
