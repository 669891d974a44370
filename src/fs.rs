use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;

/// Replace `path` with `contents` through a temporary file in the same directory, so readers never
/// observe a half-written file.
///
/// A symlink at `path` is written through: the file it points to is replaced and the link stays.
/// An existing file keeps its permissions.
pub fn atomic_write(path: &Path, contents: &[u8], create_dirs: bool) -> Result<()> {
    let target = resolve_symlink(path)?;
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if create_dirs {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    match fs::metadata(&target) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        Err(e) if e.kind() == ErrorKind::NotFound => set_new_file_permissions(tmp.as_file())?,
        Err(e) => return Err(e.into()),
    }
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}

/// The file a symlink at `path` points to, or `path` itself. Dangling links resolve to their
/// target path so the link is not replaced when the target is created.
fn resolve_symlink(path: &Path) -> Result<PathBuf> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => match fs::canonicalize(path) {
            Ok(target) => Ok(target),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let link = fs::read_link(path)?;
                Ok(match path.parent() {
                    Some(parent) if link.is_relative() => parent.join(link),
                    _ => link,
                })
            }
            Err(e) => Err(e.into()),
        },
        Ok(_) => Ok(path.to_path_buf()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(path.to_path_buf()),
        Err(e) => Err(e.into()),
    }
}

/// Temporary files are created `0600`; a file that did not exist before gets `0644`.
#[cfg(unix)]
pub(crate) fn set_new_file_permissions(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
pub(crate) fn set_new_file_permissions(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

/// A file temporarily replaced with new content.
///
/// When created with `revert` set, the original bytes are restored when the guard is dropped (or
/// the file is removed again if it did not exist), on every exit path including unwinding.
#[derive(Debug)]
pub struct AtomicFileSwap {
    path: PathBuf,
    /// `path` with symlinks resolved. Removed on revert when it did not exist before.
    target: PathBuf,
    original: Option<Vec<u8>>,
    revert: bool,
    done: bool,
}

impl AtomicFileSwap {
    pub fn replace(path: &Path, contents: &[u8], revert: bool, create_dirs: bool) -> Result<Self> {
        let original = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let target = resolve_symlink(path)?;
        atomic_write(path, contents, create_dirs)?;
        debug!("Swapped {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            target,
            original,
            revert,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original(&self) -> Option<&[u8]> {
        self.original.as_deref()
    }

    /// Revert now, reporting failures instead of logging them.
    pub fn restore(mut self) -> Result<()> {
        self.done = true;
        self.revert_now()
    }

    fn revert_now(&self) -> Result<()> {
        if !self.revert {
            return Ok(());
        }
        match &self.original {
            Some(bytes) => atomic_write(&self.target, bytes, false)?,
            None => match fs::remove_file(&self.target) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        debug!("Restored {}", self.path.display());
        Ok(())
    }
}

impl Drop for AtomicFileSwap {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.revert_now() {
            warn!("Failed to restore '{}': {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn restores_original_bytes_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, b"[net]\nretry = 2\n").unwrap();
        {
            let _swap = AtomicFileSwap::replace(&path, b"[http]\nproxy = \"x\"\n", true, false).unwrap();
            assert_eq!(fs::read(&path).unwrap(), b"[http]\nproxy = \"x\"\n");
        }
        assert_eq!(fs::read(&path).unwrap(), b"[net]\nretry = 2\n");
    }

    #[test]
    fn removes_file_that_did_not_exist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("gitconfig");
        let swap = AtomicFileSwap::replace(&path, b"[http]\n", true, true).unwrap();
        assert!(path.exists());
        swap.restore().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn restores_during_unwinding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"before").unwrap();
        let p = path.clone();
        let result = std::panic::catch_unwind(move || {
            let _swap = AtomicFileSwap::replace(&p, b"after", true, false).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&path).unwrap(), b"before");
    }

    #[cfg(unix)]
    #[test]
    fn keeps_file_mode_through_swap_and_restore() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, b"[net]\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let mode = || fs::metadata(&path).unwrap().permissions().mode() & 0o777;

        let swap = AtomicFileSwap::replace(&path, b"[http]\n", true, false).unwrap();
        assert_eq!(mode(), 0o644);
        swap.restore().unwrap();
        assert_eq!(mode(), 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn writes_through_symlinks() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("dotfiles-gitconfig");
        let link = dir.path().join(".gitconfig");
        fs::write(&real, b"[user]\n").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let swap = AtomicFileSwap::replace(&link, b"[http]\n", true, false).unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&real).unwrap(), b"[http]\n");
        swap.restore().unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&real).unwrap(), b"[user]\n");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_survives_revert() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("missing");
        let link = dir.path().join(".gitconfig");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let swap = AtomicFileSwap::replace(&link, b"[http]\n", true, false).unwrap();
        assert_eq!(fs::read(&real).unwrap(), b"[http]\n");
        swap.restore().unwrap();
        assert!(!real.exists());
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn keeps_new_content_without_revert() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        drop(AtomicFileSwap::replace(&path, b"new", false, false).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }
}
