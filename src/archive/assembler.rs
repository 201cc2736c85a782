//! Output directory and combined archive
//!
//! The output directory mirrors the layout of `docker save`, so the same
//! files that are bundled into the combined tar can be inspected in place.

use super::manifest::{
    config_file_name, manifest_bytes, repositories, rewrite_diff_ids, ArchiveConfig, LayerPlan,
    ManifestEntry, LAYER_TAR, LAYER_VERSION,
};
use crate::digest::sha256_digest;
use crate::error::{ForensicsError, Result};
use crate::store::{digest_hex, ImageMetadata};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

const MANIFEST_FILE: &str = "manifest.json";
const REPOSITORIES_FILE: &str = "repositories";

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// Writes the `docker save` layout for one image
pub struct ArchiveAssembler<'a> {
    output_dir: PathBuf,
    metadata: &'a ImageMetadata,
    plans: &'a [LayerPlan],
}

impl<'a> ArchiveAssembler<'a> {
    pub fn new(output_dir: &Path, metadata: &'a ImageMetadata, plans: &'a [LayerPlan]) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            metadata,
            plans,
        }
    }

    /// Create a layer directory with its `VERSION` and `json`, returning
    /// where the layer tar goes
    pub fn prepare_layer(&self, plan: &LayerPlan) -> Result<PathBuf> {
        let dir = self.output_dir.join(&plan.legacy_id);
        std::fs::create_dir_all(&dir).map_err(|e| ForensicsError::write(&dir, e))?;

        write_file(&dir.join("VERSION"), LAYER_VERSION.as_bytes())?;
        let descriptor = serde_json::to_vec(&plan.descriptor())?;
        write_file(&dir.join("json"), &descriptor)?;

        Ok(dir.join(LAYER_TAR))
    }

    /// Write the image config, manifest and repositories files
    ///
    /// `layer_digests` are the digests of the layer tars as written.
    /// `docker load` refuses a layer whose tar does not hash to its diff ID,
    /// so when any differs a derived config listing the written digests is
    /// added and referenced instead. The recovered bytes are always kept.
    pub fn write_metadata(
        &self,
        repo_tags: &[String],
        layer_digests: &[String],
    ) -> Result<ArchiveConfig> {
        write_file(
            &self.output_dir.join(config_file_name(&self.metadata.id)),
            &self.metadata.raw,
        )?;

        let config = self.config_for(layer_digests)?;
        let entry = ManifestEntry::new(&config.image_id, repo_tags, self.plans);
        write_file(&self.output_dir.join(MANIFEST_FILE), &manifest_bytes(&entry)?)?;

        let repositories_path = self.output_dir.join(REPOSITORIES_FILE);
        match repositories(repo_tags, self.plans) {
            Some(repos) => write_file(&repositories_path, &serde_json::to_vec(&repos)?)?,
            None => {
                if repositories_path.exists() {
                    std::fs::remove_file(&repositories_path)
                        .map_err(|e| ForensicsError::write(&repositories_path, e))?;
                }
            }
        }

        Ok(config)
    }

    fn config_for(&self, layer_digests: &[String]) -> Result<ArchiveConfig> {
        let diff_ids = self.metadata.diff_ids();
        let replaced_layers: Vec<usize> = diff_ids
            .iter()
            .zip(layer_digests)
            .enumerate()
            .filter(|(_, (diff_id, digest))| diff_id != digest)
            .map(|(position, _)| position + 1)
            .collect();
        if replaced_layers.is_empty() && diff_ids.len() == layer_digests.len() {
            return Ok(ArchiveConfig::original(&self.metadata.id));
        }

        let bytes = rewrite_diff_ids(&self.metadata.document, layer_digests)?;
        let image_id = digest_hex(&sha256_digest(&bytes)).to_string();
        let file = config_file_name(&image_id);
        write_file(&self.output_dir.join(&file), &bytes)?;
        tracing::warn!(
            "Layers {:?} do not hash to their diff IDs, archive references derived config {}",
            replaced_layers,
            file
        );

        Ok(ArchiveConfig {
            image_id,
            file,
            replaced_layers,
        })
    }

    /// Path of the combined archive
    pub fn archive_path(&self, compress: bool) -> PathBuf {
        let extension = if compress { "tar.gz" } else { "tar" };
        self.output_dir
            .join(format!("{}.{}", self.metadata.short_id(), extension))
    }

    /// Bundle the written files into one importable archive
    pub fn bundle(&self, compress: bool, config: &ArchiveConfig) -> Result<PathBuf> {
        let path = self.archive_path(compress);
        let file = File::create(&path).map_err(|e| ForensicsError::write(&path, e))?;
        let out = BufWriter::new(file);

        let result = if compress {
            let encoder = GzEncoder::new(out, Compression::default());
            self.write_bundle(encoder, &config.file)
                .and_then(|encoder| encoder.finish())
                .and_then(finish_file)
        } else {
            self.write_bundle(out, &config.file).and_then(finish_file)
        };
        result.map_err(|e| ForensicsError::write(&path, e))?;

        tracing::info!("Wrote {}", path.display());
        Ok(path)
    }

    fn write_bundle<W: Write>(&self, out: W, config_name: &str) -> io::Result<W> {
        let mut builder = Builder::new(out);

        for plan in self.plans {
            let dir = self.output_dir.join(&plan.legacy_id);
            append_dir(&mut builder, &plan.legacy_id)?;
            for name in ["VERSION", "json", LAYER_TAR] {
                append_file(
                    &mut builder,
                    &format!("{}/{}", plan.legacy_id, name),
                    &dir.join(name),
                )?;
            }
        }

        append_file(&mut builder, config_name, &self.output_dir.join(config_name))?;
        append_file(
            &mut builder,
            MANIFEST_FILE,
            &self.output_dir.join(MANIFEST_FILE),
        )?;

        let repositories_path = self.output_dir.join(REPOSITORIES_FILE);
        if repositories_path.is_file() {
            append_file(&mut builder, REPOSITORIES_FILE, &repositories_path)?;
        }

        builder.into_inner()
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).map_err(|e| ForensicsError::write(path, e))
}

fn finish_file(out: BufWriter<File>) -> io::Result<()> {
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Header with ownership and timestamps zeroed
fn normalized_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    header
}

fn append_dir<W: Write>(builder: &mut Builder<W>, name: &str) -> io::Result<()> {
    let mut header = normalized_header(EntryType::Directory, DIR_MODE, 0);
    builder.append_data(&mut header, name, io::empty())
}

fn append_file<W: Write>(builder: &mut Builder<W>, name: &str, source: &Path) -> io::Result<()> {
    let file = File::open(source)?;
    let size = file.metadata()?.len();
    let mut header = normalized_header(EntryType::Regular, FILE_MODE, size);
    builder.append_data(&mut header, name, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::manifest::plan_layers;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    fn metadata() -> ImageMetadata {
        let raw = format!(
            r#"{{"architecture":"amd64","os":"linux","rootfs":{{"type":"layers","diff_ids":["sha256:{}","sha256:{}"]}}}}"#,
            "a".repeat(64),
            "b".repeat(64)
        );
        let id = crate::digest::sha256_digest(raw.as_bytes());
        ImageMetadata::parse(
            crate::store::digest_hex(&id),
            Path::new("config"),
            raw.as_bytes(),
        )
        .unwrap()
    }

    /// Write the full layout with empty layer tars and return the bundle
    fn assemble(dir: &Path, compress: bool) -> (ImageMetadata, Vec<LayerPlan>, PathBuf) {
        let metadata = metadata();
        let plans = plan_layers(metadata.diff_ids());
        let assembler = ArchiveAssembler::new(dir, &metadata, &plans);
        for plan in &plans {
            let tar = assembler.prepare_layer(plan).unwrap();
            std::fs::write(tar, vec![0u8; 1024]).unwrap();
        }
        // Pretend the tars hash to the recorded diff IDs
        let config = assembler
            .write_metadata(
                &["forensic/recovered:latest".to_string()],
                metadata.diff_ids(),
            )
            .unwrap();
        assert!(!config.is_derived());
        let archive = assembler.bundle(compress, &config).unwrap();
        (metadata, plans, archive)
    }

    fn entry_names<R: Read>(reader: R) -> Vec<String> {
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                assert_eq!(e.header().mtime().unwrap(), 0);
                assert_eq!(e.header().uid().unwrap(), 0);
                let path = e.path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_layout_matches_docker_save() {
        let temp = tempdir().unwrap();
        let (metadata, plans, archive) = assemble(temp.path(), false);

        assert_eq!(
            archive,
            temp.path().join(format!("{}.tar", metadata.short_id()))
        );
        let names = entry_names(File::open(&archive).unwrap());
        let expected: Vec<String> = plans
            .iter()
            .flat_map(|p| {
                vec![
                    p.legacy_id.clone(),
                    format!("{}/VERSION", p.legacy_id),
                    format!("{}/json", p.legacy_id),
                    format!("{}/layer.tar", p.legacy_id),
                ]
            })
            .chain([
                format!("{}.json", metadata.id),
                "manifest.json".to_string(),
                "repositories".to_string(),
            ])
            .collect();
        assert_eq!(names, expected);

        let config = std::fs::read(temp.path().join(format!("{}.json", metadata.id))).unwrap();
        assert_eq!(config, metadata.raw);
        let version =
            std::fs::read_to_string(temp.path().join(&plans[0].legacy_id).join("VERSION"))
                .unwrap();
        assert_eq!(version, "1.0");
    }

    #[test]
    fn test_bundle_is_deterministic() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let (_, _, a) = assemble(first.path(), false);
        let (_, _, b) = assemble(second.path(), false);
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }

    #[test]
    fn test_compressed_bundle() {
        let temp = tempdir().unwrap();
        let (_, _, archive) = assemble(temp.path(), true);
        assert!(archive.to_string_lossy().ends_with(".tar.gz"));
        let names = entry_names(GzDecoder::new(File::open(&archive).unwrap()));
        assert!(names.contains(&"manifest.json".to_string()));
    }

    #[test]
    fn test_untagged_image_has_no_repositories() {
        let temp = tempdir().unwrap();
        let metadata = metadata();
        let plans = plan_layers(metadata.diff_ids());
        let assembler = ArchiveAssembler::new(temp.path(), &metadata, &plans);
        for plan in &plans {
            let tar = assembler.prepare_layer(plan).unwrap();
            std::fs::write(tar, vec![0u8; 1024]).unwrap();
        }
        let config = assembler.write_metadata(&[], metadata.diff_ids()).unwrap();
        assert!(!temp.path().join("repositories").exists());

        let names = entry_names(File::open(assembler.bundle(false, &config).unwrap()).unwrap());
        assert!(!names.contains(&"repositories".to_string()));
    }

    #[test]
    fn test_mismatched_layers_get_derived_config() {
        let temp = tempdir().unwrap();
        let metadata = metadata();
        let plans = plan_layers(metadata.diff_ids());
        let assembler = ArchiveAssembler::new(temp.path(), &metadata, &plans);
        let mut digests = Vec::new();
        for plan in &plans {
            let tar = assembler.prepare_layer(plan).unwrap();
            let data = vec![0u8; 1024];
            digests.push(crate::digest::sha256_digest(&data));
            std::fs::write(tar, data).unwrap();
        }

        let config = assembler.write_metadata(&[], &digests).unwrap();
        assert_eq!(config.replaced_layers, vec![1, 2]);
        assert_ne!(config.image_id, metadata.id);

        // The recovered config stays next to the derived one
        let original = std::fs::read(temp.path().join(format!("{}.json", metadata.id))).unwrap();
        assert_eq!(original, metadata.raw);
        let derived = std::fs::read(temp.path().join(&config.file)).unwrap();
        assert_eq!(
            crate::digest::sha256_digest(&derived),
            format!("sha256:{}", config.image_id)
        );
        let derived: serde_json::Value = serde_json::from_slice(&derived).unwrap();
        assert_eq!(derived["rootfs"]["diff_ids"], serde_json::json!(digests));

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(temp.path().join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest[0]["Config"], config.file.as_str());

        let names = entry_names(File::open(assembler.bundle(false, &config).unwrap()).unwrap());
        assert!(names.contains(&config.file));
        assert!(!names.contains(&format!("{}.json", metadata.id)));
    }
}
