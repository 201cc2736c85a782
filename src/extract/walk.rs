//! Layer tar from a directory walk
//!
//! Used when no tar-split index survives. The tar is rebuilt from the
//! diff directory in name order without following symlinks; overlay
//! whiteout devices and opaque directories are written as `.wh.` entries.

use super::overlay::{whiteout_name, KernelMarkers, MarkerProbe, OPAQUE_MARKER};
use super::{ExactReader, UnreadableEntry};
use crate::path::open_with_fallback;
use std::io::{self, Write};
use std::path::Path;
use tar::{Builder, EntryType, Header, HeaderMode};
use walkdir::WalkDir;

/// Outcome of a directory walk
#[derive(Debug, Default)]
pub struct WalkStats {
    pub entries: usize,
    pub whiteouts: usize,
    pub unreadable: Vec<UnreadableEntry>,
}

/// Write a tar of everything under `payload_dir` to `out`
pub fn write_tar<W: Write>(payload_dir: &Path, out: W) -> io::Result<(W, WalkStats)> {
    write_tar_with(payload_dir, out, &KernelMarkers)
}

/// Like [`write_tar`], recognising whiteouts and opaque directories through `markers`
pub fn write_tar_with<W: Write, M: MarkerProbe>(
    payload_dir: &Path,
    out: W,
    markers: &M,
) -> io::Result<(W, WalkStats)> {
    let mut builder = Builder::new(out);
    builder.follow_symlinks(false);
    builder.mode(HeaderMode::Complete);

    let mut stats = WalkStats::default();
    let walker = WalkDir::new(payload_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .and_then(|p| p.strip_prefix(payload_dir).ok())
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let reason = e.to_string();
                tracing::warn!("Cannot read {}: {}", path, reason);
                stats.unreadable.push(UnreadableEntry { path, reason });
                continue;
            }
        };

        let relative = match entry.path().strip_prefix(payload_dir) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        let name = relative.to_string_lossy().into_owned();

        let metadata = match entry.path().symlink_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                stats.unreadable.push(UnreadableEntry::new(&name, &e));
                continue;
            }
        };

        let file_type = metadata.file_type();
        let appended = if file_type.is_dir() {
            let opaque = markers.is_opaque(entry.path());
            append_dir(&mut builder, &relative, &metadata, opaque, &mut stats)
        } else if markers.is_whiteout(entry.path(), &metadata) {
            stats.whiteouts += 1;
            append_whiteout(&mut builder, &relative, &metadata)
        } else if file_type.is_file() {
            append_file(&mut builder, entry.path(), &relative, &metadata, &mut stats)
        } else if file_type.is_symlink() {
            append_symlink(&mut builder, entry.path(), &relative, &metadata)
        } else {
            builder.append_path_with_name(entry.path(), &relative)
        };

        match appended {
            Ok(()) => stats.entries += 1,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", name, e);
                stats.unreadable.push(UnreadableEntry::new(&name, &e));
            }
        }
    }

    let out = builder.into_inner()?;
    Ok((out, stats))
}

fn append_dir<W: Write>(
    builder: &mut Builder<W>,
    relative: &Path,
    metadata: &std::fs::Metadata,
    opaque: bool,
    stats: &mut WalkStats,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(metadata, HeaderMode::Complete);
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    builder.append_data(&mut header, relative, io::empty())?;

    if opaque {
        let mut marker = Header::new_gnu();
        marker.set_metadata_in_mode(metadata, HeaderMode::Complete);
        marker.set_entry_type(EntryType::Regular);
        marker.set_mode(header.mode()? & 0o777);
        marker.set_size(0);
        builder.append_data(&mut marker, relative.join(OPAQUE_MARKER), io::empty())?;
        stats.whiteouts += 1;
    }

    Ok(())
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    relative: &Path,
    metadata: &std::fs::Metadata,
    stats: &mut WalkStats,
) -> io::Result<()> {
    let file = open_with_fallback(path)?;

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(metadata, HeaderMode::Complete);
    let size = metadata.len();
    header.set_size(size);

    // A file that shrinks or fails mid-read is zero-filled to its recorded size
    let mut reader = ExactReader::new(Some(file), size);
    builder.append_data(&mut header, relative, &mut reader)?;
    if let Some(e) = reader.take_error() {
        stats
            .unreadable
            .push(UnreadableEntry::new(&relative.to_string_lossy(), &e));
    }

    Ok(())
}

fn append_symlink<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    relative: &Path,
    metadata: &std::fs::Metadata,
) -> io::Result<()> {
    let target = std::fs::read_link(path)?;

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(metadata, HeaderMode::Complete);
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    builder.append_link(&mut header, relative, target)
}

fn append_whiteout<W: Write>(
    builder: &mut Builder<W>,
    relative: &Path,
    metadata: &std::fs::Metadata,
) -> io::Result<()> {
    let file_name = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let marker = match relative.parent() {
        Some(parent) => parent.join(whiteout_name(&file_name)),
        None => whiteout_name(&file_name).into(),
    };

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(metadata, HeaderMode::Complete);
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o600);
    header.set_device_major(0)?;
    header.set_device_minor(0)?;
    header.set_size(0);
    builder.append_data(&mut header, marker, io::empty())
}
