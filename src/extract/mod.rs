//! Layer content extraction
//!
//! Packages the changed-file set of a resolved layer into a standalone
//! `layer.tar`. A tar-split index, when present, reproduces the original
//! bytes; otherwise the diff directory is walked.

pub mod overlay;
pub mod tarsplit;
pub mod walk;

use crate::digest::HashingWriter;
use crate::error::{ForensicsError, Result};
use crate::layer::LocatedLayer;
use serde::Serialize;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use tarsplit::ReassembleError;

/// How a layer tar was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Replayed from `tar-split.json.gz`
    TarSplit,
    /// Rebuilt from the diff directory
    DirectoryWalk,
    /// Empty stand-in for a missing layer
    Placeholder,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::TarSplit => write!(f, "tar-split"),
            Strategy::DirectoryWalk => write!(f, "directory-walk"),
            Strategy::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// A file inside a layer that could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableEntry {
    /// Path relative to the layer root
    pub path: String,
    pub reason: String,
}

impl UnreadableEntry {
    pub fn new(path: &str, reason: &impl Display) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A layer tar written to the output directory
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedLayer {
    pub path: PathBuf,
    /// sha256 of the written tar
    pub digest: String,
    pub size: u64,
    pub strategy: Strategy,
    pub entries: usize,
    pub whiteouts: usize,
    pub unreadable: Vec<UnreadableEntry>,
    /// Why the tar-split index could not be used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar_split_error: Option<String>,
}

/// Writes layer tars
pub struct LayerExtractor;

impl LayerExtractor {
    /// Produce `dest` from a resolved layer
    pub fn extract(located: &LocatedLayer, dest: &Path) -> Result<ExtractedLayer> {
        let mut tar_split_error = None;

        if let Some(index) = &located.tar_split {
            match Self::from_tar_split(index, &located.payload_dir, dest)? {
                Ok(layer) => return Ok(layer),
                Err(reason) => {
                    tracing::warn!(
                        "tar-split index {} unusable, walking {} instead: {}",
                        index.display(),
                        located.payload_dir.display(),
                        reason
                    );
                    tar_split_error = Some(reason);
                }
            }
        }

        let mut layer = Self::from_directory(&located.payload_dir, dest)?;
        layer.tar_split_error = tar_split_error;
        Ok(layer)
    }

    /// Write a valid, zero-entry tar in place of a missing layer
    pub fn placeholder(dest: &Path) -> Result<ExtractedLayer> {
        let writer = HashingWriter::new(create(dest)?);
        let writer = tar::Builder::new(writer)
            .into_inner()
            .map_err(|e| ForensicsError::write(dest, e))?;

        let (digest, size) = finish(writer, dest)?;
        Ok(ExtractedLayer {
            path: dest.to_path_buf(),
            digest,
            size,
            strategy: Strategy::Placeholder,
            entries: 0,
            whiteouts: 0,
            unreadable: Vec::new(),
            tar_split_error: None,
        })
    }

    /// Outer error: output failure. Inner error: index problem, try the walk.
    fn from_tar_split(
        index: &Path,
        payload_dir: &Path,
        dest: &Path,
    ) -> Result<std::result::Result<ExtractedLayer, String>> {
        let mut writer = HashingWriter::new(create(dest)?);

        let stats = match tarsplit::reassemble(index, payload_dir, &mut writer) {
            Ok(stats) => stats,
            Err(ReassembleError::Index(reason)) => return Ok(Err(reason)),
            Err(ReassembleError::Write(e)) => return Err(ForensicsError::write(dest, e)),
        };

        let (digest, size) = finish(writer, dest)?;
        Ok(Ok(ExtractedLayer {
            path: dest.to_path_buf(),
            digest,
            size,
            strategy: Strategy::TarSplit,
            entries: stats.files,
            whiteouts: 0,
            unreadable: stats.unreadable,
            tar_split_error: None,
        }))
    }

    fn from_directory(payload_dir: &Path, dest: &Path) -> Result<ExtractedLayer> {
        let writer = HashingWriter::new(create(dest)?);
        let (writer, stats) =
            walk::write_tar(payload_dir, writer).map_err(|e| ForensicsError::write(dest, e))?;

        let (digest, size) = finish(writer, dest)?;
        Ok(ExtractedLayer {
            path: dest.to_path_buf(),
            digest,
            size,
            strategy: Strategy::DirectoryWalk,
            entries: stats.entries,
            whiteouts: stats.whiteouts,
            unreadable: stats.unreadable,
            tar_split_error: None,
        })
    }
}

fn create(dest: &Path) -> Result<BufWriter<File>> {
    File::create(dest)
        .map(BufWriter::new)
        .map_err(|e| ForensicsError::write(dest, e))
}

fn finish(writer: HashingWriter<BufWriter<File>>, dest: &Path) -> Result<(String, u64)> {
    let (buffered, digest, size) = writer.finish();
    let file = buffered
        .into_inner()
        .map_err(|e| ForensicsError::write(dest, e.into_error()))?;
    file.sync_all().map_err(|e| ForensicsError::write(dest, e))?;
    Ok((digest, size))
}

/// Reads exactly `size` bytes, substituting zeros for anything the source
/// cannot deliver
pub struct ExactReader<R: Read> {
    source: Option<R>,
    remaining: u64,
    error: Option<io::Error>,
}

impl<R: Read> ExactReader<R> {
    pub fn new(source: Option<R>, size: u64) -> Self {
        Self {
            source,
            remaining: size,
            error: None,
        }
    }

    /// The first read failure, if zeros had to be substituted
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);

        if let Some(source) = self.source.as_mut() {
            match source.read(&mut buf[..want]) {
                Ok(0) => {
                    self.error = Some(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} bytes short of the recorded size", self.remaining),
                    ));
                    self.source = None;
                }
                Ok(n) => {
                    self.remaining -= n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
                Err(e) => {
                    self.error = Some(e);
                    self.source = None;
                }
            }
        } else if self.error.is_none() {
            self.error = Some(io::Error::new(
                io::ErrorKind::NotFound,
                "payload file could not be opened",
            ));
        }

        buf[..want].fill(0);
        self.remaining -= want as u64;
        Ok(want)
    }
}
