//! Namespacer (C4).
//!
//! Uses the Tree Walker + Ownership Translator to rewrite ownership of
//! every entry in a tree in place. Drives "convert privilege flavor" and
//! "post-clone fix-up".
//!
//! Retagging is not idempotent across partial failure: an already-retagged
//! entry would be mis-translated if retried. A failed retag therefore
//! leaves the volume poisoned rather than attempting recovery (spec §4.4,
//! §9).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

use crate::concurrency::CancelToken;
use crate::errors::{VolmanError, VolmanResult};
use crate::identity::IdentityOracle;
use crate::translate::{Direction, Translator};
use crate::walk::{walk, Entry, EntryKind, OnError, Visitor, WalkOptions};

/// Walks `root` and rewrites every entry's (uid, gid) via the translator in
/// `direction`, leaving mode bits (including setuid/setgid) untouched.
///
/// On the first entry that fails to translate or chown, the walk stops and
/// an error is returned; the caller (the Manager) is responsible for
/// marking the volume poisoned, since some entries may already have been
/// rewritten.
pub fn retag(
    root: &Path,
    oracle: &IdentityOracle,
    direction: Direction,
    cancel: Option<&CancelToken>,
) -> VolmanResult<()> {
    let translator = Translator::new(oracle);
    let mut retagger = Retagger {
        root: root.to_path_buf(),
        translator,
        direction,
        cancel,
    };
    walk(root, &mut retagger, WalkOptions::default())
}

struct Retagger<'a> {
    root: PathBuf,
    translator: Translator<'a>,
    direction: Direction,
    cancel: Option<&'a CancelToken>,
}

impl<'a> Visitor for Retagger<'a> {
    fn visit(&mut self, entry: &Entry) -> VolmanResult<()> {
        if let Some(cancel) = self.cancel {
            if cancel.is_cancelled() {
                return Err(VolmanError::Internal("retag cancelled".into()));
            }
        }

        let (uid, gid) = self
            .translator
            .apply(self.direction, entry.metadata.uid, entry.metadata.gid)?;

        let abs_path = self.root.join(&entry.relative_path);
        chown_no_follow(&abs_path, uid, gid)?;

        // chown(2)/fchownat(2) unconditionally clears setuid/setgid on a
        // non-directory; restore the original mode so retagging doesn't
        // silently strip it.
        if entry.kind != EntryKind::Symlink {
            fs::set_permissions(&abs_path, fs::Permissions::from_mode(entry.metadata.mode))?;
        }

        Ok(())
    }

    fn on_error(&mut self, _relative_path: &Path, _err: &VolmanError) -> OnError {
        // Any I/O or translation failure aborts the whole retag; the
        // partial state is surfaced to the caller, which poisons the
        // volume. Continuing would risk double-translating entries already
        // rewritten in a retry.
        OnError::Abort
    }
}

fn chown_no_follow(path: &Path, uid: u32, gid: u32) -> VolmanResult<()> {
    fchownat(
        None,
        path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
        FchownatFlags::NoFollowSymlink,
    )
    .map_err(|e| VolmanError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityRange;
    use std::fs;
    use tempfile::tempdir;

    fn is_root() -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    #[test]
    fn retag_to_namespace_shifts_root_owned_file() {
        if !is_root() {
            eprintln!("skipping retag test: not running as root");
            return;
        }

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("foo"), b"x").unwrap();

        let oracle = IdentityOracle::new(IdentityRange::new(65536, 65536));
        retag(dir.path(), &oracle, Direction::ToNamespace, None).unwrap();

        let meta = fs::metadata(dir.path().join("foo")).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.uid(), 65536);
        assert_eq!(meta.gid(), 65536);
    }

    #[test]
    fn retag_does_not_follow_symlinks() {
        if !is_root() {
            eprintln!("skipping retag test: not running as root");
            return;
        }

        let outside = tempdir().unwrap();
        let target = outside.path().join("external");
        fs::write(&target, b"secret").unwrap();
        fs::set_permissions(&target, std::os::unix::fs::PermissionsExt::from_mode(0o000)).unwrap();

        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();

        let oracle = IdentityOracle::new(IdentityRange::new(65536, 65536));
        retag(dir.path(), &oracle, Direction::ToNamespace, None).unwrap();

        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let target_meta = fs::metadata(&target).unwrap();
        assert_eq!(target_meta.permissions().mode() & 0o777, 0o000);
        assert_eq!(target_meta.uid(), 0);
    }
}
