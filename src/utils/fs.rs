//! Symlink-resistant file helpers for the `os`/`os_resctrl_mon` back-ends.
//!
//! resctrl is a kernel-controlled pseudo-filesystem, but the directories the
//! library creates under it are not, so callers integrate these helpers
//! instead of touching `open`/`fs::File` directly (spec §4.6/§4.7/§9).

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{RdtError, Result};

fn reject_symlink_ancestors(path: &Path) -> Result<()> {
    let mut cur = path;
    while let Some(parent) = cur.parent() {
        if parent.as_os_str().is_empty() {
            break;
        }
        if let Ok(meta) = fs::symlink_metadata(parent) {
            if meta.file_type().is_symlink() {
                return Err(RdtError::perm(format!(
                    "refusing to follow symlink ancestor: {}",
                    parent.display()
                )));
            }
        }
        cur = parent;
    }
    Ok(())
}

/// Opens `path` for reading, refusing to follow a symlink at the final
/// component or any ancestor directory.
pub fn open_ro(path: &Path) -> Result<File> {
    reject_symlink_ancestors(path)?;
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| to_fs_error(e, path))
}

/// Opens (or creates) `path` for writing, with the same symlink refusal.
pub fn open_rw(path: &Path, create: bool) -> Result<File> {
    reject_symlink_ancestors(path)?;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| to_fs_error(e, path))
}

/// Reads the whole file as a trimmed `String`, used for single-line
/// resctrl pseudo-files (`cbm_mask`, `num_closids`, ...).
pub fn read_to_string(path: &Path) -> Result<String> {
    reject_symlink_ancestors(path)?;
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| to_fs_error(e, path))
}

pub fn write_str(path: &Path, contents: &str) -> Result<()> {
    reject_symlink_ancestors(path)?;
    fs::write(path, contents).map_err(|e| to_fs_error(e, path))
}

/// Creates a directory (one component, not `create_dir_all`): resctrl
/// directories (COS, monitoring groups) are always created one level deep
/// under a known-good parent.
pub fn create_dir(path: &Path) -> Result<()> {
    reject_symlink_ancestors(path)?;
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(to_fs_error(e, path)),
    }
}

pub fn remove_dir(path: &Path) -> Result<()> {
    reject_symlink_ancestors(path)?;
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(to_fs_error(e, path)),
    }
}

fn to_fs_error(e: std::io::Error, path: &Path) -> RdtError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            RdtError::perm(format!("{}: {}", path.display(), e))
        }
        std::io::ErrorKind::NotFound => {
            RdtError::resource(format!("{}: {}", path.display(), e))
        }
        _ => RdtError::Internal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn refuses_symlinked_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();
        let target = link.join("file");
        assert!(open_ro(&target).is_err());
    }

    #[test]
    fn rw_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("schemata");
        write_str(&file, "L3:0=fff\n").unwrap();
        assert_eq!(read_to_string(&file).unwrap(), "L3:0=fff");
    }
}
