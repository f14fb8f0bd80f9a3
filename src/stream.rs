//! Stream Codec (C7).
//!
//! Packs/unpacks a tree as a sequence of typed tar entries. Ownership on
//! the wire is always in host representation, independent of the volume's
//! flavor (spec §4.7) — the codec applies `ToHost` at header-emit time for
//! an Unprivileged source, and `ToNamespace` at on-disk-write time for an
//! Unprivileged destination. Modes (including setuid/setgid) are preserved
//! verbatim. Symlinks are written with their target string, never
//! dereferenced.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
use tar::{Builder, EntryType, Header};

use crate::concurrency::CancelToken;
use crate::errors::{VolmanError, VolmanResult};
use crate::identity::IdentityOracle;
use crate::model::Flavor;
use crate::translate::{Direction, Translator};
use crate::walk::{self, walk, Entry, EntryKind, OnError, Visitor, WalkOptions};

/// Direction ownership must be translated to cross the host/wire boundary,
/// given a volume's flavor, per spec §4.7's table.
fn wire_direction(flavor: Flavor, for_stream_out: bool) -> Direction {
    match (flavor, for_stream_out) {
        (Flavor::Unprivileged, true) => Direction::ToHost,
        (Flavor::Privileged, true) => Direction::Identity,
        (Flavor::Unprivileged, false) => Direction::ToNamespace,
        (Flavor::Privileged, false) => Direction::Identity,
    }
}

/// Validate that `subpath` is relative and does not escape the volume
/// root, returning the absolute path it resolves to.
pub fn resolve_subpath(root: &Path, subpath: &Path) -> VolmanResult<PathBuf> {
    walk::reject_escape(root, subpath)?;
    Ok(root.join(subpath))
}

/// StreamOut: pack `root`'s subtree at `subpath` into `writer` as a tar
/// stream, with ownership translated to canonical (host) wire form.
pub fn pack<W: Write>(
    root: &Path,
    subpath: &Path,
    flavor: Flavor,
    oracle: &IdentityOracle,
    writer: W,
    cancel: Option<&CancelToken>,
) -> VolmanResult<()> {
    let abs_subroot = resolve_subpath(root, subpath)?;
    if !abs_subroot.exists() {
        return Err(VolmanError::InvalidPath(format!(
            "subpath does not exist: {}",
            subpath.display()
        )));
    }

    let translator = Translator::new(oracle);
    let direction = wire_direction(flavor, true);

    let mut builder = Builder::new(writer);
    builder.mode(tar::HeaderMode::Complete);

    let mut packer = Packer {
        src_root: abs_subroot.clone(),
        translator,
        direction,
        builder: &mut builder,
        cancel,
    };

    walk(&abs_subroot, &mut packer, WalkOptions::default())
        .map_err(|e| VolmanError::CodecFailure(format!("pack failed: {e}")))?;

    builder
        .into_inner()
        .map_err(|e| VolmanError::CodecFailure(format!("failed to finalize stream: {e}")))?;
    Ok(())
}

struct Packer<'a, W: Write> {
    src_root: PathBuf,
    translator: Translator<'a>,
    direction: Direction,
    builder: &'a mut Builder<W>,
    cancel: Option<&'a CancelToken>,
}

impl<'a, W: Write> Visitor for Packer<'a, W> {
    fn visit(&mut self, entry: &Entry) -> VolmanResult<()> {
        // The subtree root itself is visited with an empty relative path;
        // it's implicit in a tar stream and not emitted as its own entry.
        if entry.relative_path.as_os_str().is_empty() {
            return Ok(());
        }

        if let Some(cancel) = self.cancel {
            if cancel.is_cancelled() {
                return Err(VolmanError::Internal("stream-out cancelled".into()));
            }
        }

        let (uid, gid) = self
            .translator
            .apply(self.direction, entry.metadata.uid, entry.metadata.gid)?;

        let mut header = Header::new_gnu();
        header.set_uid(uid as u64);
        header.set_gid(gid as u64);
        header.set_mode(entry.metadata.mode);
        header.set_mtime(0);

        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                self.builder
                    .append_data(&mut header, &entry.relative_path, std::io::empty())
                    .map_err(VolmanError::Io)?;
            }
            EntryKind::RegularFile => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(entry.metadata.size);
                let abs_path = self.src_root.join(&entry.relative_path);
                let file = fs::File::open(&abs_path).map_err(VolmanError::Io)?;
                self.builder
                    .append_data(&mut header, &entry.relative_path, file)
                    .map_err(VolmanError::Io)?;
            }
            EntryKind::Symlink => {
                let target = entry.link_target.as_ref().ok_or_else(|| {
                    VolmanError::Internal("symlink entry missing target".into())
                })?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                self.builder
                    .append_link(&mut header, &entry.relative_path, target)
                    .map_err(VolmanError::Io)?;
            }
            EntryKind::Other => {
                return Err(VolmanError::CodecFailure(format!(
                    "cannot stream unsupported entry type at {}",
                    entry.relative_path.display()
                )));
            }
        }

        Ok(())
    }

    fn on_error(&mut self, _relative_path: &Path, _err: &VolmanError) -> OnError {
        OnError::Abort
    }
}

/// StreamIn: unpack a tar stream into `root`'s subtree at `subpath`,
/// translating the canonical (host) wire ownership into the destination
/// volume's on-disk representation. Existing entries at colliding paths
/// are overwritten. Scratch files used while writing live inside the
/// target subtree so a cancelled stream-in can be cleaned up by destroying
/// the volume.
pub fn unpack<R: Read>(
    root: &Path,
    subpath: &Path,
    flavor: Flavor,
    oracle: &IdentityOracle,
    reader: R,
    cancel: Option<&CancelToken>,
) -> VolmanResult<()> {
    let abs_subroot = resolve_subpath(root, subpath)?;
    fs::create_dir_all(&abs_subroot).map_err(VolmanError::Io)?;

    let translator = Translator::new(oracle);
    let direction = wire_direction(flavor, false);

    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| VolmanError::MalformedStream(e.to_string()))?;

    for entry_result in entries {
        if let Some(cancel) = cancel {
            if cancel.is_cancelled() {
                return Err(VolmanError::Internal("stream-in cancelled".into()));
            }
        }

        let mut entry = entry_result.map_err(|e| VolmanError::MalformedStream(e.to_string()))?;

        let rel_path = entry
            .path()
            .map_err(|e| VolmanError::MalformedStream(e.to_string()))?
            .into_owned();
        walk::reject_escape(&abs_subroot, &rel_path)?;

        let dest = abs_subroot.join(&rel_path);
        let mode = entry.header().mode().map_err(VolmanError::Io)? & 0o7777;
        let host_uid = entry.header().uid().map_err(VolmanError::Io)? as u32;
        let host_gid = entry.header().gid().map_err(VolmanError::Io)? as u32;
        let entry_type = entry.header().entry_type();

        let (uid, gid) = translator.apply(direction, host_uid, host_gid)?;

        let is_symlink = matches!(entry_type, EntryType::Symlink);

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(VolmanError::Io)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(VolmanError::Io)?;
                }
                write_regular_file(&dest, &mut entry)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(VolmanError::Io)?
                    .ok_or_else(|| {
                        VolmanError::MalformedStream("symlink entry missing link name".into())
                    })?
                    .into_owned();
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(VolmanError::Io)?;
                }
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest).map_err(VolmanError::Io)?;
                }
                std::os::unix::fs::symlink(&target, &dest).map_err(VolmanError::Io)?;
            }
            other => {
                return Err(VolmanError::MalformedStream(format!(
                    "unsupported tar entry type {:?} at {}",
                    other,
                    rel_path.display()
                )));
            }
        }

        // chown(2)/fchownat(2) unconditionally clears setuid/setgid on a
        // non-directory, so the mode is applied only after ownership lands.
        chown_no_follow(&dest, uid, gid)?;
        if !is_symlink {
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode)).map_err(VolmanError::Io)?;
        }
    }

    Ok(())
}

fn write_regular_file<R: Read>(dest: &Path, entry: &mut R) -> VolmanResult<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| VolmanError::Internal("destination has no parent".into()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".volman-stream-in-")
        .tempfile_in(parent)
        .map_err(VolmanError::Io)?;

    std::io::copy(entry, tmp.as_file_mut()).map_err(VolmanError::Io)?;

    tmp.persist(dest)
        .map_err(|e| VolmanError::Io(e.error))?;
    Ok(())
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
    use tempfile::tempdir;

    fn oracle() -> IdentityOracle {
        IdentityOracle::new(IdentityRange::new(65536, 65536))
    }

    #[test]
    fn privileged_round_trip_preserves_ownership_and_mode() {
        let src_dir = tempdir().unwrap();
        fs::write(src_dir.path().join("foo"), b"hello").unwrap();
        fs::set_permissions(
            src_dir.path().join("foo"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let mut buf = Vec::new();
        pack(
            src_dir.path(),
            Path::new(""),
            Flavor::Privileged,
            &oracle(),
            &mut buf,
            None,
        )
        .unwrap();

        let dest_dir = tempdir().unwrap();
        unpack(
            dest_dir.path(),
            Path::new(""),
            Flavor::Privileged,
            &oracle(),
            buf.as_slice(),
            None,
        )
        .unwrap();

        let meta = fs::metadata(dest_dir.path().join("foo")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        assert_eq!(fs::read(dest_dir.path().join("foo")).unwrap(), b"hello");
    }

    #[test]
    fn wire_direction_matches_spec_table() {
        assert_eq!(wire_direction(Flavor::Unprivileged, true), Direction::ToHost);
        assert_eq!(wire_direction(Flavor::Privileged, true), Direction::Identity);
        assert_eq!(wire_direction(Flavor::Unprivileged, false), Direction::ToNamespace);
        assert_eq!(wire_direction(Flavor::Privileged, false), Direction::Identity);
    }

    #[test]
    fn packing_an_unprivileged_volume_with_sub_max_owner_fails() {
        // An Unprivileged volume is only ever supposed to hold (max, max)-style
        // ownership on disk; a file owned below max (as this test fixture is,
        // since it's not actually running as root against a real namespace)
        // cannot be translated ToHost and pack() must reject it rather than
        // emit an untranslated uid onto the wire.
        let src_dir = tempdir().unwrap();
        fs::write(src_dir.path().join("foo"), b"x").unwrap();

        let mut buf = Vec::new();
        let result = pack(
            src_dir.path(),
            Path::new(""),
            Flavor::Unprivileged,
            &oracle(),
            &mut buf,
            None,
        );
        assert!(matches!(result, Err(VolmanError::IdentifierOutOfRange(_))));
    }

    #[test]
    fn subpath_escape_is_rejected() {
        let dir = tempdir().unwrap();
        let mut buf = Vec::new();
        let result = pack(
            dir.path(),
            Path::new("../escape"),
            Flavor::Privileged,
            &oracle(),
            &mut buf,
            None,
        );
        assert!(matches!(result, Err(VolmanError::InvalidPath(_))));
    }
}
