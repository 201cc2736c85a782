//! tar-split reassembly
//!
//! When Docker unpacks a layer it stores the raw tar headers and padding in
//! `tar-split.json.gz` next to the layer metadata. The index is a stream of
//! JSON objects, one per line:
//!
//! ```text
//! {"type":2,"payload":"<base64 raw bytes>","position":0}   segment
//! {"type":1,"name":"etc/hosts","size":174,"payload":"<crc64>","position":1}   file
//! ```
//!
//! Replaying segments verbatim and copying `size` bytes of each file from
//! the layer's diff directory reproduces the original layer tar byte for
//! byte, so its sha256 equals the diff ID.

use super::{ExactReader, UnreadableEntry};
use crate::path::{join_relative, open_beneath};
use base64::Engine;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

const FILE_ENTRY: u8 = 1;
const SEGMENT_ENTRY: u8 = 2;

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    /// Base64 of a name that is not valid UTF-8
    #[serde(default)]
    name_raw: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    payload: Option<String>,
}

/// Why reassembly stopped
#[derive(Debug)]
pub enum ReassembleError {
    /// The index is unreadable or corrupt; another strategy may still work
    Index(String),
    /// Writing the output failed
    Write(io::Error),
}

/// Outcome of a successful reassembly
#[derive(Debug, Default)]
pub struct ReassembleStats {
    pub files: usize,
    pub segments: usize,
    pub unreadable: Vec<UnreadableEntry>,
}

/// Replay `index` against `payload_dir` into `out`
pub fn reassemble<W: Write>(
    index: &Path,
    payload_dir: &Path,
    out: &mut W,
) -> Result<ReassembleStats, ReassembleError> {
    let file = File::open(index)
        .map_err(|e| ReassembleError::Index(format!("{}: {}", index.display(), e)))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let stream = serde_json::Deserializer::from_reader(decoder).into_iter::<IndexEntry>();

    let mut stats = ReassembleStats::default();
    for entry in stream {
        let entry = entry.map_err(|e| ReassembleError::Index(e.to_string()))?;

        match entry.kind {
            SEGMENT_ENTRY => {
                let bytes = decode(entry.payload.as_deref().unwrap_or(""))?;
                out.write_all(&bytes).map_err(ReassembleError::Write)?;
                stats.segments += 1;
            }
            FILE_ENTRY => {
                stats.files += 1;
                if entry.size == 0 {
                    continue;
                }

                let name = entry_name(&entry)?;
                let source = match entry_path(payload_dir, &entry, &name)? {
                    Some(path) => match open_beneath(payload_dir, &path) {
                        Ok(file) => Some(file),
                        Err(e) => {
                            stats.unreadable.push(UnreadableEntry::new(&name, &e));
                            None
                        }
                    },
                    None => {
                        tracing::warn!("Index entry {} points outside the layer", name);
                        stats
                            .unreadable
                            .push(UnreadableEntry::new(&name, &"path leaves the layer directory"));
                        None
                    }
                };

                // Keep the stream aligned even when the payload is gone
                let mut reader = ExactReader::new(source, entry.size);
                io::copy(&mut reader, out).map_err(ReassembleError::Write)?;
                if let Some(e) = reader.take_error() {
                    stats.unreadable.push(UnreadableEntry::new(&name, &e));
                }
            }
            other => {
                return Err(ReassembleError::Index(format!(
                    "unknown entry type {}",
                    other
                )))
            }
        }
    }

    if stats.segments == 0 {
        return Err(ReassembleError::Index("index has no segments".to_string()));
    }

    Ok(stats)
}

fn decode(data: &str) -> Result<Vec<u8>, ReassembleError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| ReassembleError::Index(format!("bad base64 payload: {}", e)))
}

/// Display name of a file entry
fn entry_name(entry: &IndexEntry) -> Result<String, ReassembleError> {
    if let Some(name) = entry.name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    let raw = decode(entry.name_raw.as_deref().unwrap_or(""))?;
    if raw.is_empty() {
        return Err(ReassembleError::Index("file entry without a name".to_string()));
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Location of a file entry inside the payload directory, `None` when the
/// recorded name would leave it
fn entry_path(
    payload_dir: &Path,
    entry: &IndexEntry,
    name: &str,
) -> Result<Option<PathBuf>, ReassembleError> {
    #[cfg(unix)]
    {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        if entry.name.as_deref().map_or(true, str::is_empty) {
            let raw = decode(entry.name_raw.as_deref().unwrap_or(""))?;
            let mut path = payload_dir.to_path_buf();
            for part in raw.split(|b| *b == b'/') {
                if part.is_empty() || part == b"." {
                    continue;
                }
                if part == b".." {
                    return Ok(None);
                }
                path.push(OsStr::from_bytes(part));
            }
            return Ok(Some(path));
        }
    }

    #[cfg(not(unix))]
    let _ = entry;

    Ok(join_relative(payload_dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn encode(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    /// Build a one-file layer tar and its tar-split index
    fn fixture(dir: &Path, content: &[u8]) -> (Vec<u8>, PathBuf, PathBuf) {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("etc/hosts").unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append(&header, content).unwrap();
        let original = builder.into_inner().unwrap();

        // header | file data | padding + terminator
        let data_end = 512 + content.len();
        let lines = [
            format!(
                r#"{{"type":2,"payload":"{}","position":0}}"#,
                encode(&original[..512])
            ),
            format!(
                r#"{{"type":1,"name":"etc/hosts","size":{},"payload":null,"position":1}}"#,
                content.len()
            ),
            format!(
                r#"{{"type":2,"payload":"{}","position":2}}"#,
                encode(&original[data_end..])
            ),
        ];

        let index = dir.join("tar-split.json.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(lines.join("\n").as_bytes()).unwrap();
        std::fs::write(&index, encoder.finish().unwrap()).unwrap();

        let payload = dir.join("diff");
        std::fs::create_dir_all(payload.join("etc")).unwrap();
        std::fs::write(payload.join("etc").join("hosts"), content).unwrap();

        (original, index, payload)
    }

    #[test]
    fn test_reassembly_is_byte_exact() {
        let temp = tempdir().unwrap();
        let (original, index, payload) = fixture(temp.path(), b"127.0.0.1 localhost\n");

        let mut out = Vec::new();
        let stats = reassemble(&index, &payload, &mut out).unwrap();
        assert_eq!(out, original);
        assert_eq!(stats.files, 1);
        assert!(stats.unreadable.is_empty());
    }

    #[test]
    fn test_missing_payload_file_is_zero_filled() {
        let temp = tempdir().unwrap();
        let (original, index, payload) = fixture(temp.path(), b"127.0.0.1 localhost\n");
        std::fs::remove_file(payload.join("etc").join("hosts")).unwrap();

        let mut out = Vec::new();
        let stats = reassemble(&index, &payload, &mut out).unwrap();
        assert_eq!(out.len(), original.len());
        assert_eq!(stats.unreadable.len(), 1);
        assert_eq!(stats.unreadable[0].path, "etc/hosts");
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_entry_name_cannot_leave_payload_dir() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("analyst_secret"), b"TOPSECRET").unwrap();
        let payload = temp.path().join("mount").join("overlay2").join("c0").join("diff");
        std::fs::create_dir_all(&payload).unwrap();

        let lines = [
            format!(r#"{{"type":2,"payload":"{}","position":0}}"#, encode(&[0u8; 512])),
            r#"{"type":1,"name":"../../../../analyst_secret","size":9,"position":1}"#.to_string(),
            format!(r#"{{"type":2,"payload":"{}","position":2}}"#, encode(&[0u8; 1527])),
        ];
        let index = temp.path().join("tar-split.json.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(lines.join("\n").as_bytes()).unwrap();
        std::fs::write(&index, encoder.finish().unwrap()).unwrap();

        let mut out = Vec::new();
        let stats = reassemble(&index, &payload, &mut out).unwrap();
        assert!(!contains(&out, b"TOPSECRET"));
        assert_eq!(out.len(), 512 + 9 + 1527);
        assert_eq!(stats.unreadable.len(), 1);
        assert_eq!(stats.unreadable[0].path, "../../../../analyst_secret");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_payload_is_not_followed() {
        let temp = tempdir().unwrap();
        let content = b"127.0.0.1 localhost\n";
        let (original, index, payload) = fixture(temp.path(), content);

        let secret = temp.path().join("secret");
        std::fs::write(&secret, b"TOPSECRET-TOPSECRET!").unwrap();
        let hosts = payload.join("etc").join("hosts");
        std::fs::remove_file(&hosts).unwrap();
        std::os::unix::fs::symlink(&secret, &hosts).unwrap();

        let mut out = Vec::new();
        let stats = reassemble(&index, &payload, &mut out).unwrap();
        assert!(!contains(&out, b"TOPSECRET"));
        assert_eq!(out.len(), original.len());
        assert_eq!(stats.unreadable.len(), 1);
        assert_eq!(stats.unreadable[0].path, "etc/hosts");
    }

    #[test]
    fn test_corrupt_index_is_reported() {
        let temp = tempdir().unwrap();
        let index = temp.path().join("tar-split.json.gz");
        std::fs::write(&index, b"not gzip").unwrap();

        let mut out = Vec::new();
        let result = reassemble(&index, temp.path(), &mut out);
        assert!(matches!(result, Err(ReassembleError::Index(_))));
    }
}
