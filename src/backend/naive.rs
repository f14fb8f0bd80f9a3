//! Naive copy-based backend implementation (spec §2, §4.5, §6: "naïve copy").
//!
//! `create_cow` performs a full recursive copy, preserving mode bits and the
//! source ownership of every entry (no translation — that is the
//! Namespacer's job, invoked separately by the Manager when flavors
//! differ).

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

use crate::errors::{VolmanError, VolmanResult};
use crate::walk::{walk, Entry, EntryKind, OnError, Visitor, WalkOptions};

/// Backend rooted at a base directory under which every volume gets its own
/// subdirectory, named by a monotonically increasing counter to avoid path
/// collisions between volumes.
pub struct NaiveCopyBackend {
    base_dir: PathBuf,
    next_id: std::sync::atomic::AtomicU64,
}

impl NaiveCopyBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> VolmanResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn fresh_path(&self) -> PathBuf {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.base_dir.join(format!("vol-{id:016x}"))
    }
}

impl super::VolumeBackend for NaiveCopyBackend {
    fn create_empty(&self) -> VolmanResult<PathBuf> {
        let path = self.fresh_path();
        fs::create_dir_all(&path)
            .map_err(|e| VolmanError::BackendFailure(format!("create_empty {}: {e}", path.display())))?;
        Ok(path)
    }

    fn create_cow(&self, parent_path: &Path) -> VolmanResult<PathBuf> {
        let dest = self.fresh_path();
        fs::create_dir_all(&dest)
            .map_err(|e| VolmanError::BackendFailure(format!("create_cow {}: {e}", dest.display())))?;

        let mut copier = Copier {
            src_root: parent_path.to_path_buf(),
            dest_root: dest.clone(),
        };
        walk(parent_path, &mut copier, WalkOptions::default()).map_err(|e| {
            VolmanError::BackendFailure(format!("create_cow copy failed: {e}"))
        })?;

        Ok(dest)
    }

    fn destroy(&self, path: &Path) -> VolmanResult<()> {
        if path.exists() {
            fs::remove_dir_all(path)
                .map_err(|e| VolmanError::BackendFailure(format!("destroy {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

struct Copier {
    src_root: PathBuf,
    dest_root: PathBuf,
}

impl Visitor for Copier {
    fn visit(&mut self, entry: &Entry) -> VolmanResult<()> {
        let dest_path = self.dest_root.join(&entry.relative_path);

        match entry.kind {
            EntryKind::Dir => {
                // Root was already created by create_cow; subdirectories
                // need creating before their own children are copied.
                if !entry.relative_path.as_os_str().is_empty() {
                    fs::create_dir(&dest_path)?;
                }
            }
            EntryKind::RegularFile => {
                let src_path = self.src_root.join(&entry.relative_path);
                fs::copy(&src_path, &dest_path)?;
            }
            EntryKind::Symlink => {
                let target = entry.link_target.as_ref().ok_or_else(|| {
                    VolmanError::Internal("symlink entry missing target".into())
                })?;
                symlink(target, &dest_path)?;
            }
            EntryKind::Other => {
                return Err(VolmanError::BackendFailure(format!(
                    "unsupported entry type at {}",
                    entry.relative_path.display()
                )));
            }
        }

        // chown(2)/fchownat(2) unconditionally clears setuid/setgid on a
        // non-directory, so the mode is (re-)applied after, never before.
        fchownat(
            None,
            &dest_path,
            Some(Uid::from_raw(entry.metadata.uid)),
            Some(Gid::from_raw(entry.metadata.gid)),
            FchownatFlags::NoFollowSymlink,
        )
        .map_err(|e| VolmanError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        if entry.kind != EntryKind::Symlink {
            fs::set_permissions(&dest_path, fs::Permissions::from_mode(entry.metadata.mode))?;
        }

        Ok(())
    }

    fn on_error(&mut self, _relative_path: &Path, _err: &VolmanError) -> OnError {
        OnError::Abort
    }
}
