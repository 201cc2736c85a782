//! Image reconstruction pipeline
//!
//! One image runs synchronously from metadata lookup to the combined
//! archive. Several images can run side by side; each gets its own output
//! directory and only reads from the mount.

use crate::archive::{plan_layers, ArchiveAssembler};
use crate::config::ExtractOptions;
use crate::dockerfile;
use crate::error::{ForensicsError, Result};
use crate::extract::{ExtractedLayer, LayerExtractor, Strategy};
use crate::layer::{resolve_chain, LayerRecord, LayerStatus, Overlay2Locator};
use crate::report::{Issue, IssueKind, LayerSummary, Summary};
use crate::store::{DockerRoot, ImageDb, ImageMetadata};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

const METADATA_FILE: &str = "image_metadata.json";
const DOCKERFILE: &str = "Dockerfile";
const SUMMARY_FILE: &str = "summary.json";

/// Docker root configured in the options, or discovered under the mount
pub fn docker_root(options: &ExtractOptions) -> Result<DockerRoot> {
    match &options.docker_root {
        Some(path) if path.is_dir() => Ok(DockerRoot::new(path)),
        Some(path) => Err(ForensicsError::DockerRootNotFound(path.clone())),
        None => DockerRoot::discover(&options.mount_path),
    }
}

/// Output directory of an image
pub fn image_output_dir(output_dir: &Path, image_id: &str) -> PathBuf {
    output_dir.join(format!("image_{}", image_id))
}

/// Reconstruct one image into the output directory
pub fn extract_image(options: &ExtractOptions, image_id: &str) -> Result<Summary> {
    options.validate()?;

    let root = docker_root(options)?;
    tracing::info!("Using Docker root {}", root.path().display());

    let metadata = ImageDb::new(&root).read(image_id)?;
    tracing::info!(
        "Image {} has {} layers",
        metadata.id,
        metadata.diff_ids().len()
    );

    let image_dir = image_output_dir(&options.output_dir, &metadata.id);
    fresh_dir(&image_dir)?;

    let metadata_path = image_dir.join(METADATA_FILE);
    std::fs::write(&metadata_path, metadata.to_pretty_json()?)
        .map_err(|e| ForensicsError::write(&metadata_path, e))?;

    let records = resolve_chain(&Overlay2Locator::new(&root), metadata.diff_ids());
    let summary = assemble(options, &metadata, &records, &image_dir)?;
    summary.write(&image_dir.join(SUMMARY_FILE))?;

    Ok(summary)
}

/// Resolve each requested ID to its full image ID, dropping repeats
///
/// Two spellings of one image would share an output directory. A lookup
/// failure stays attached to the ID that caused it.
pub fn unique_images(
    options: &ExtractOptions,
    image_ids: &[String],
) -> Vec<(String, Result<String>)> {
    let mut seen = HashSet::new();
    let mut images = Vec::with_capacity(image_ids.len());

    for id in image_ids {
        let resolved = options
            .validate()
            .and_then(|()| docker_root(options))
            .and_then(|root| ImageDb::new(&root).resolve_id(id));
        if let Ok(full_id) = &resolved {
            if !seen.insert(full_id.clone()) {
                tracing::warn!("Skipping {}: image {} is already queued", id, full_id);
                continue;
            }
        }
        images.push((id.clone(), resolved));
    }

    images
}

/// Reconstruct several images one after another
///
/// An image that aborts does not stop the others. Each image is processed
/// once, however many of its IDs are given.
pub fn extract_images(
    options: &ExtractOptions,
    image_ids: &[String],
) -> Vec<(String, Result<Summary>)> {
    unique_images(options, image_ids)
        .into_iter()
        .map(|(id, resolved)| {
            let result = resolved.and_then(|full_id| extract_image(options, &full_id));
            if let Err(e) = &result {
                tracing::error!("Image {} failed: {}", id, e);
            }
            (id, result)
        })
        .collect()
}

/// Reconstruct several images concurrently, at most `jobs` at a time
///
/// Results come back in the order of `image_ids`; IDs naming an image
/// that is already queued are dropped, so no two tasks share an output
/// directory.
pub async fn extract_images_parallel(
    options: Arc<ExtractOptions>,
    image_ids: Vec<String>,
    jobs: usize,
) -> Vec<(String, Result<Summary>)> {
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let images = unique_images(&options, &image_ids);
    let mut handles = Vec::with_capacity(images.len());

    for (id, resolved) in images {
        let handle = resolved.map(|full_id| {
            let options = Arc::clone(&options);
            let semaphore = Arc::clone(&semaphore);

            tokio::spawn(async move {
                // The semaphore is never closed, so the permit is always granted
                let _permit = semaphore.acquire_owned().await;
                tokio::task::spawn_blocking(move || extract_image(&options, &full_id)).await
            })
        });
        handles.push((id, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (id, handle) in handles {
        let result = match handle {
            Ok(handle) => match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) | Err(e) => Err(ForensicsError::Io(std::io::Error::other(e))),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::error!("Image {} failed: {}", id, e);
        }
        results.push((id, result));
    }
    results
}

/// Output of an earlier, aborted run is never resumed
fn fresh_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        tracing::warn!("Replacing existing output {}", dir.display());
        std::fs::remove_dir_all(dir).map_err(|e| ForensicsError::write(dir, e))?;
    }
    std::fs::create_dir_all(dir).map_err(|e| ForensicsError::write(dir, e))
}

fn assemble(
    options: &ExtractOptions,
    metadata: &ImageMetadata,
    records: &[LayerRecord],
    image_dir: &Path,
) -> Result<Summary> {
    let plans = plan_layers(metadata.diff_ids());
    let assembler = ArchiveAssembler::new(image_dir, metadata, &plans);

    let mut layers = Vec::with_capacity(records.len());
    let mut digests = Vec::with_capacity(records.len());
    let mut issues = Vec::new();

    for (record, plan) in records.iter().zip(&plans) {
        let dest = assembler.prepare_layer(plan)?;
        let number = record.position + 1;

        let extracted = match &record.status {
            LayerStatus::Resolved(located) => {
                tracing::info!(
                    "Extracting layer {}/{} from {}",
                    number,
                    records.len(),
                    located.payload_dir.display()
                );
                LayerExtractor::extract(located, &dest)?
            }
            LayerStatus::Missing { reason } => {
                issues.push(
                    Issue::new(
                        IssueKind::Missing,
                        format!("{} not found: {}", record.diff_id, reason),
                    )
                    .layer(record.position),
                );
                LayerExtractor::placeholder(&dest)?
            }
        };

        collect_layer_issues(record, &extracted, &mut issues);
        digests.push(extracted.digest.clone());
        layers.push(LayerSummary::new(
            record.position,
            &record.diff_id,
            &record.chain_id,
            &plan.legacy_id,
            &extracted,
        ));
    }

    let missing = records.iter().filter(|r| !r.is_resolved()).count();
    if missing > 0 {
        tracing::warn!(
            "Incomplete chain: {} of {} layers replaced by empty placeholders",
            missing,
            records.len()
        );
        issues.push(Issue::new(
            IssueKind::IncompleteChain,
            format!(
                "{} of {} layers are empty placeholders",
                missing,
                records.len()
            ),
        ));
    }

    let dockerfile_path = image_dir.join(DOCKERFILE);
    std::fs::write(&dockerfile_path, dockerfile::reconstruct(metadata))
        .map_err(|e| ForensicsError::write(&dockerfile_path, e))?;

    let config = assembler.write_metadata(&options.repo_tags, &digests)?;
    if config.is_derived() {
        issues.push(Issue::new(
            IssueKind::ConfigRewritten,
            format!(
                "layers {:?} differ from the recorded diff IDs; the archive references \
                 config {} and loads as image {}",
                config.replaced_layers, config.file, config.image_id
            ),
        ));
    }
    let archive = assembler.bundle(options.compress, &config)?;

    Ok(Summary::new(
        &metadata.id,
        image_dir,
        &archive,
        config,
        &options.repo_tags,
        layers,
        issues,
    ))
}

fn collect_layer_issues(record: &LayerRecord, layer: &ExtractedLayer, issues: &mut Vec<Issue>) {
    if let Some(reason) = &layer.tar_split_error {
        issues.push(
            Issue::new(
                IssueKind::TarSplitFallback,
                format!("tar-split index unusable, rebuilt from directory: {}", reason),
            )
            .layer(record.position),
        );
    }

    for entry in &layer.unreadable {
        issues.push(
            Issue::new(IssueKind::UnreadableEntry, entry.reason.clone())
                .layer(record.position)
                .path(entry.path.clone()),
        );
    }

    if layer.strategy != Strategy::Placeholder && layer.digest != record.diff_id {
        tracing::debug!(
            "Layer {} digest {} differs from diff ID {}",
            record.position + 1,
            layer.digest,
            record.diff_id
        );
        issues.push(
            Issue::new(
                IssueKind::DigestMismatch,
                format!(
                    "layer tar ({}) hashes to {}, expected {}",
                    layer.strategy, layer.digest, record.diff_id
                ),
            )
            .layer(record.position),
        );
    }
}
