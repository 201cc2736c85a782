//! overlayfs on-disk markers
//!
//! In an overlay2 upper directory a deleted path is a character device with
//! device number 0/0, and a directory that hides everything below it carries
//! the `trusted.overlay.opaque=y` xattr (`user.overlay.opaque` for
//! unprivileged mounts). Layer tars express the same facts as `.wh.<name>`
//! and `.wh..wh..opq` entries.

use std::fs::Metadata;
use std::path::Path;

/// Prefix of a whiteout entry name
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the opaque-directory marker entry
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Extended attributes that mark an opaque directory
pub const OPAQUE_XATTRS: &[&str] = &["trusted.overlay.opaque", "user.overlay.opaque"];

/// Whiteout entry name for a deleted file
pub fn whiteout_name(name: &str) -> String {
    format!("{}{}", WHITEOUT_PREFIX, name)
}

/// True for an overlay whiteout device (character device 0/0)
#[cfg(unix)]
pub fn is_whiteout_device(metadata: &Metadata) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    metadata.file_type().is_char_device() && metadata.rdev() == 0
}

#[cfg(not(unix))]
pub fn is_whiteout_device(_metadata: &Metadata) -> bool {
    false
}

/// True when a directory is marked opaque
#[cfg(target_os = "linux")]
pub fn is_opaque_dir(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return false,
    };

    OPAQUE_XATTRS.iter().any(|attr| {
        let c_attr = match CString::new(*attr) {
            Ok(a) => a,
            Err(_) => return false,
        };
        let mut value = [0u8; 8];
        let len = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_attr.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        len == 1 && value[0] == b'y'
    })
}

#[cfg(not(target_os = "linux"))]
pub fn is_opaque_dir(_path: &Path) -> bool {
    false
}

/// Recognises overlay markers while walking a layer directory
pub trait MarkerProbe {
    /// True when the entry at `path` records a deleted path
    fn is_whiteout(&self, path: &Path, metadata: &Metadata) -> bool;

    /// True when the directory at `path` hides everything below it
    fn is_opaque(&self, path: &Path) -> bool;
}

/// Markers as the kernel overlay driver writes them
pub struct KernelMarkers;

impl MarkerProbe for KernelMarkers {
    fn is_whiteout(&self, _path: &Path, metadata: &Metadata) -> bool {
        is_whiteout_device(metadata)
    }

    fn is_opaque(&self, path: &Path) -> bool {
        is_opaque_dir(path)
    }
}
