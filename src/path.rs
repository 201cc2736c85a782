//! Path helpers for evidence mounted from other platforms
//!
//! Mount points exported by forensic suites frequently mix `/` and `\`
//! separators, and Windows hosts cap ordinary paths at 260 characters.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

/// Rewrite every `/` and `\` in `path` to the platform separator
pub fn normalize_separators(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if !raw.contains(['/', '\\']) {
        return path.to_path_buf();
    }
    PathBuf::from(raw.replace(['/', '\\'], &MAIN_SEPARATOR.to_string()))
}

/// Join `/`-separated (or `\`-separated) relative components onto `base`
///
/// Returns `None` when a component would leave `base`: `..`, or a drive or
/// root prefix that replaces the path on push.
pub fn join_relative(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = base.to_path_buf();
    for part in relative.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        if !is_plain_name(part) {
            return None;
        }
        path.push(part);
    }
    Some(path)
}

/// True when `name` is exactly one ordinary path component
pub fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Open a regular file below `base` without following any symlink
///
/// Every component between `base` and the file is checked, so a link
/// planted in the evidence cannot redirect the read to the analyst's host.
pub fn open_beneath(base: &Path, path: &Path) -> io::Result<File> {
    let relative = path.strip_prefix(base).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is outside {}", path.display(), base.display()),
        )
    })?;

    let mut current = base.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        let Component::Normal(name) = component else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} leaves {}", path.display(), base.display()),
            ));
        };
        current.push(name);

        let file_type = std::fs::symlink_metadata(&current)?.file_type();
        let last = components.peek().is_none();
        if file_type.is_symlink() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a symlink, not followed", current.display()),
            ));
        }
        if !last && !file_type.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", current.display()),
            ));
        }
        if last && !file_type.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", current.display()),
            ));
        }
    }

    open_no_follow(path)
}

fn open_no_follow(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOFOLLOW);
    }
    options.open(path)
}

/// Alternate spellings of `path` to retry when the raw path cannot be opened
pub(crate) fn fallback_paths(path: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    let normalized = normalize_separators(path);
    if normalized != path {
        candidates.push(normalized.clone());
    }

    #[cfg(windows)]
    {
        let raw = normalized.to_string_lossy();
        if normalized.is_absolute() && !raw.starts_with(r"\\?\") {
            candidates.push(PathBuf::from(format!(r"\\?\{}", raw)));
        }
    }

    candidates
}

/// Open a file, retrying the normalized spellings of its path on failure
///
/// A symlink in the final component is never followed.
pub fn open_with_fallback(path: &Path) -> io::Result<File> {
    let first_error = match open_no_follow(path) {
        Ok(file) => return Ok(file),
        Err(e) => e,
    };

    for candidate in fallback_paths(path) {
        if let Ok(file) = open_no_follow(&candidate) {
            tracing::debug!(
                "Opened {} through fallback path {}",
                path.display(),
                candidate.display()
            );
            return Ok(file);
        }
    }

    Err(first_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mixed_separators() {
        let normalized = normalize_separators(Path::new(r"mnt\evidence/var\lib"));
        let expected: PathBuf = ["mnt", "evidence", "var", "lib"].iter().collect();
        assert_eq!(normalized, expected);
    }

    #[test]
    fn test_normalize_leaves_clean_path_alone() {
        let path = Path::new("plain");
        assert_eq!(normalize_separators(path), PathBuf::from("plain"));
    }

    #[test]
    fn test_join_relative_skips_dots_and_empty() {
        let joined = join_relative(Path::new("base"), "./etc//passwd");
        let expected: PathBuf = ["base", "etc", "passwd"].iter().collect();
        assert_eq!(joined, Some(expected));
    }

    #[test]
    fn test_join_relative_refuses_to_leave_base() {
        assert_eq!(join_relative(Path::new("base"), "../../../../etc/passwd"), None);
        assert_eq!(join_relative(Path::new("base"), "etc/../../secret"), None);
        assert_eq!(join_relative(Path::new("base"), r"etc\..\..\secret"), None);
        // A leading separator is dropped, not treated as the filesystem root
        assert_eq!(
            join_relative(Path::new("base"), "/etc/hosts"),
            Some(["base", "etc", "hosts"].iter().collect())
        );
    }

    #[test]
    fn test_open_beneath_regular_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("etc").join("hosts"), b"127.0.0.1").unwrap();

        let mut content = String::new();
        let mut file = open_beneath(temp.path(), &temp.path().join("etc").join("hosts")).unwrap();
        io::Read::read_to_string(&mut file, &mut content).unwrap();
        assert_eq!(content, "127.0.0.1");

        let outside = open_beneath(&temp.path().join("etc"), temp.path()).unwrap_err();
        assert_eq!(outside.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_beneath_does_not_follow_symlinks() {
        let temp = tempfile::tempdir().unwrap();
        let host = temp.path().join("host");
        let base = temp.path().join("diff");
        std::fs::create_dir_all(host.join("secrets")).unwrap();
        std::fs::write(host.join("secrets").join("key"), b"TOPSECRET").unwrap();
        std::fs::create_dir_all(base.join("etc")).unwrap();

        // Absolute link in the final component
        std::os::unix::fs::symlink(host.join("secrets").join("key"), base.join("etc").join("key"))
            .unwrap();
        // Link to a directory in the middle of the path
        std::os::unix::fs::symlink(host.join("secrets"), base.join("linked")).unwrap();

        let err = open_beneath(&base, &base.join("etc").join("key")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = open_beneath(&base, &base.join("linked").join("key")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(open_with_fallback(&base.join("etc").join("key")).is_err());
    }

    #[test]
    fn test_open_with_fallback_missing_file() {
        let err = open_with_fallback(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
