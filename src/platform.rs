//! Platform-capability abstraction (spec §1/§9): NTFS-specific concerns
//! (security descriptors, reparse points, alternate data streams, hard
//! links) stay as opaque blobs and indices in the core format (`metadata`,
//! `records`) and are captured/applied only through this narrow trait. A
//! portable build gets correct, inert no-op behavior everywhere; a
//! Windows-specific build can supply a real implementation without the core
//! archive logic changing at all.
//!
//! Grounded on the reference implementation's own platform split (Windows
//! ctypes structs guarded by `if os.name == 'nt'` in `WIMArchive.py`) —
//! this crate makes that split an explicit trait object instead of a
//! runtime `if`.

use std::path::Path;

/// One platform-specific capability surface, implemented once per target.
/// Every method has a meaningful no-op default so `NullPlatform` satisfies
/// the trait without overriding anything.
pub trait PlatformCapabilities {
    /// Capture `path`'s security descriptor as an opaque blob, or `None` if
    /// the platform has no notion of one (or the file has the default).
    fn capture_sd(&self, _path: &Path) -> std::io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Apply a previously captured security descriptor blob to `path`.
    fn apply_sd(&self, _path: &Path, _sd: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    /// Read `path`'s reparse point data, if it has one, as `(tag, data)`.
    fn read_reparse(&self, _path: &Path) -> std::io::Result<Option<(u32, Vec<u8>)>> {
        Ok(None)
    }

    /// Recreate a reparse point at `path` from a previously captured
    /// `(tag, data)` pair.
    fn write_reparse(&self, _path: &Path, _tag: u32, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    /// List `path`'s named alternate data streams as `(name, bytes)` pairs.
    /// A portable filesystem has none.
    fn enumerate_ads(&self, _path: &Path) -> std::io::Result<Vec<(String, Vec<u8>)>> {
        Ok(Vec::new())
    }

    /// Create `link` as a hard link to `target`, if the platform/filesystem
    /// supports it; `Ok(false)` signals "not supported here" rather than an
    /// error, letting the caller fall back to a full copy.
    fn create_hardlink(&self, target: &Path, link: &Path) -> std::io::Result<bool> {
        match std::fs::hard_link(target, link) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Create a symbolic link at `link` pointing at `target`.
    fn create_symlink(&self, _target: &Path, _link: &Path) -> std::io::Result<bool> {
        Ok(false)
    }
}

/// The portable default: every NTFS-specific capability is absent, and
/// hard links fall back to the standard library's cross-platform
/// `std::fs::hard_link`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlatform;

impl PlatformCapabilities for NullPlatform {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_platform_captures_nothing() {
        let p = NullPlatform;
        assert!(p.capture_sd(Path::new("/tmp")).unwrap().is_none());
        assert!(p.read_reparse(Path::new("/tmp")).unwrap().is_none());
        assert!(p.enumerate_ads(Path::new("/tmp")).unwrap().is_empty());
    }
}
