//! Tree Walker (C3).
//!
//! Recursively visits a filesystem subtree rooted at a path, yielding every
//! entry (including symlinks, never followed) to a visitor. Refuses to
//! escape the root.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::errors::{VolmanError, VolmanResult};

/// The kind of a walked entry, as determined by a non-following stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    RegularFile,
    Symlink,
    Other,
}

/// Minimal ownership/mode metadata a visitor needs. Always obtained via a
/// non-following stat (`lstat`), so symlinks report their own mode/owner,
/// never the target's.
#[derive(Debug, Clone, Copy)]
pub struct EntryMetadata {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ino: u64,
    pub size: u64,
}

/// A single walked entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Path relative to the walk root.
    pub relative_path: PathBuf,
    pub kind: EntryKind,
    pub metadata: EntryMetadata,
    /// Symlink target string, present only for `EntryKind::Symlink`. Never
    /// dereferenced by the walker.
    pub link_target: Option<PathBuf>,
}

/// Controls hard-link de-duplication and escape behavior.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// When true, an inode already visited under a different name is
    /// skipped. When false (default), every name is visited, which is the
    /// correct default for retagging — every name needs its own
    /// non-following chown regardless of a shared inode.
    pub dedup_hardlinks: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            dedup_hardlinks: false,
        }
    }
}

/// Decision a visitor makes after being shown an I/O error on one entry.
pub enum OnError {
    Continue,
    Abort,
}

/// Implemented by callers of [`walk`]. `visit` is called pre-order,
/// including for the root itself. `on_error` is called when a single entry
/// fails to stat or list; the walker honors its decision.
pub trait Visitor {
    fn visit(&mut self, entry: &Entry) -> VolmanResult<()>;

    fn on_error(&mut self, relative_path: &Path, err: &VolmanError) -> OnError {
        let _ = (relative_path, err);
        OnError::Abort
    }
}

/// Walk `root` pre-order, invoking `visitor` for every entry including the
/// root directory itself.
pub fn walk(root: &Path, visitor: &mut dyn Visitor, options: WalkOptions) -> VolmanResult<()> {
    let root = root
        .canonicalize()
        .map_err(|e| VolmanError::InvalidPath(format!("{}: {e}", root.display())))?;

    let mut seen_inodes: HashSet<u64> = HashSet::new();

    let root_meta = stat_entry(&root)?;
    let root_entry = Entry {
        relative_path: PathBuf::new(),
        kind: root_meta.0,
        metadata: root_meta.1,
        link_target: None,
    };
    if options.dedup_hardlinks {
        seen_inodes.insert(root_entry.metadata.ino);
    }
    visitor.visit(&root_entry)?;

    walk_dir(&root, &root, Path::new(""), visitor, options, &mut seen_inodes)
}

fn walk_dir(
    root: &Path,
    abs_dir: &Path,
    rel_dir: &Path,
    visitor: &mut dyn Visitor,
    options: WalkOptions,
    seen_inodes: &mut HashSet<u64>,
) -> VolmanResult<()> {
    let read_dir = match fs::read_dir(abs_dir) {
        Ok(rd) => rd,
        Err(e) => {
            let err = VolmanError::Io(e);
            return match visitor.on_error(rel_dir, &err) {
                OnError::Continue => Ok(()),
                OnError::Abort => Err(err),
            };
        }
    };

    for dir_entry in read_dir {
        let dir_entry = match dir_entry {
            Ok(d) => d,
            Err(e) => {
                let err = VolmanError::Io(e);
                match visitor.on_error(rel_dir, &err) {
                    OnError::Continue => continue,
                    OnError::Abort => return Err(err),
                }
            }
        };

        let name = dir_entry.file_name();
        let abs_path = abs_dir.join(&name);
        let rel_path = rel_dir.join(&name);

        reject_escape(root, &rel_path)?;

        let (kind, metadata, link_target) = match stat_entry_full(&abs_path) {
            Ok(v) => v,
            Err(e) => match visitor.on_error(&rel_path, &e) {
                OnError::Continue => continue,
                OnError::Abort => return Err(e),
            },
        };

        if options.dedup_hardlinks && kind != EntryKind::Dir {
            if !seen_inodes.insert(metadata.ino) {
                continue;
            }
        }

        let entry = Entry {
            relative_path: rel_path.clone(),
            kind,
            metadata,
            link_target,
        };
        visitor.visit(&entry)?;

        if kind == EntryKind::Dir {
            walk_dir(root, &abs_path, &rel_path, visitor, options, seen_inodes)?;
        }
    }

    Ok(())
}

/// Reject any relative path whose lexical (not filesystem-resolved) form
/// would escape the walk root, e.g. via a component we constructed
/// ourselves containing `..`. Entries are built from `read_dir` names, which
/// the OS guarantees never contain `..`, but this guards the invariant
/// defensively and is reused by `VolumeManager::stream_out`'s subpath check.
pub fn reject_escape(_root: &Path, relative: &Path) -> VolmanResult<()> {
    for component in relative.components() {
        match component {
            Component::ParentDir => {
                return Err(VolmanError::InvalidPath(format!(
                    "path escapes volume root: {}",
                    relative.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(VolmanError::InvalidPath(format!(
                    "absolute path not allowed: {}",
                    relative.display()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn stat_entry(path: &Path) -> VolmanResult<(EntryKind, EntryMetadata)> {
    let (kind, meta, _) = stat_entry_full(path)?;
    Ok((kind, meta))
}

#[cfg(unix)]
fn stat_entry_full(
    path: &Path,
) -> VolmanResult<(EntryKind, EntryMetadata, Option<PathBuf>)> {
    use nix::sys::stat::{lstat, SFlag};

    let st = lstat(path).map_err(|e| {
        VolmanError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("lstat {}: {e}", path.display()),
        ))
    })?;

    let mode_bits = st.st_mode as libc::mode_t;
    let file_type = SFlag::from_bits_truncate(mode_bits & libc::S_IFMT);

    let kind = if file_type.contains(SFlag::S_IFDIR) {
        EntryKind::Dir
    } else if file_type.contains(SFlag::S_IFLNK) {
        EntryKind::Symlink
    } else if file_type.contains(SFlag::S_IFREG) {
        EntryKind::RegularFile
    } else {
        EntryKind::Other
    };

    let link_target = if kind == EntryKind::Symlink {
        Some(fs::read_link(path).map_err(VolmanError::Io)?)
    } else {
        None
    };

    let metadata = EntryMetadata {
        uid: st.st_uid,
        gid: st.st_gid,
        mode: (st.st_mode as u32) & 0o7777,
        ino: st.st_ino,
        size: st.st_size as u64,
    };

    Ok((kind, metadata, link_target))
}
