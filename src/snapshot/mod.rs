//! State snapshots: safe tar pack/unpack of agent session state.
//!
//! Only the fixed allowlist of subdirectories under the agent home is ever
//! packed or restored. Everything else (dotfiles, `.config`, `.ssh`, planted
//! binaries) is excluded, so nothing an agent drops outside those
//! directories survives into the next session.
//!
//! Unpacking treats the archive as hostile: absolute paths, `..` traversal,
//! and link entries fail the whole restore before a single byte is written.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header};

/// Subdirectories of the agent home that persist across sessions.
pub const STATE_ALLOW_DIRS: &[&str] = &["workspace", "data", "output", "state"];

/// Cap on a single decompressed entry, against decompression bombs.
const MAX_ENTRY_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("archive entry has an unsafe path: {path}")]
    UnsafePath { path: String },

    #[error("archive entry is a link: {path}")]
    LinkEntry { path: String },

    #[error("archive entry exceeds the size limit: {path}")]
    EntryTooLarge { path: String },

    #[error("archive entry is outside the state allowlist: {path}")]
    NotAllowlisted { path: String },

    #[error("malformed archive")]
    Malformed,

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Pack the allowlisted subdirectories of `home_dir` into a gzipped tar.
///
/// Mode and mtime are preserved. Symlinks are not followed out of the
/// tree: a link resolving inside `home_dir` is stored as a regular file
/// with the target's contents, anything else is skipped with a warning.
pub fn pack(home_dir: &Path) -> Result<Vec<u8>, SnapshotError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for dir in STATE_ALLOW_DIRS {
        let abs = home_dir.join(dir);
        if abs.is_dir() {
            append_tree(&mut builder, home_dir, Path::new(dir))?;
        }
    }

    let encoder = builder.into_inner().map_err(SnapshotError::Io)?;
    encoder.finish().map_err(SnapshotError::Io)
}

/// Restore a snapshot into `home_dir`, creating it if needed.
///
/// The archive is validated in full before extraction, so a rejected entry
/// leaves no partial restore behind.
pub fn unpack(bytes: &[u8], home_dir: &Path) -> Result<(), SnapshotError> {
    // Pass 1: validate every member against the safety rules.
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().map_err(|_| SnapshotError::Malformed)? {
        let entry = entry.map_err(|_| SnapshotError::Malformed)?;
        validate_entry(entry.header(), &entry_path(&entry)?)?;
    }

    // Pass 2: extract. The bytes are in memory, so the two passes see the
    // same archive.
    fs::create_dir_all(home_dir)?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    #[cfg(any(unix, target_os = "redox"))]
    archive.set_unpack_xattrs(false);

    for entry in archive.entries().map_err(|_| SnapshotError::Malformed)? {
        let mut entry = entry.map_err(|_| SnapshotError::Malformed)?;
        let rel = entry_path(&entry)?;
        let dest = home_dir.join(&rel);
        // Archives produced by in-VM tar may omit intermediate directory
        // members; the path itself was already validated.
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(dest)?;
    }
    Ok(())
}

/// Validate-and-rewrite an untrusted snapshot into a clean one.
///
/// Used on tar bytes produced inside a VM: the archive is safely unpacked
/// into a scratch directory (rejecting anything unsafe), then repacked from
/// what actually landed on disk.
pub fn sanitize(bytes: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let scratch = tempfile::tempdir()?;
    unpack(bytes, scratch.path())?;
    pack(scratch.path())
}

/// Plain gzipped tar of an entire directory, used for uploading agent code
/// into a VM. No allowlist: the archive is built from trusted host files
/// and extracted by the VM provider, not by [`unpack`].
pub fn archive_dir(dir: &Path) -> Result<Vec<u8>, SnapshotError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner().map_err(SnapshotError::Io)?;
    encoder.finish().map_err(SnapshotError::Io)
}

fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<PathBuf, SnapshotError> {
    entry
        .path()
        .map(|p| p.to_path_buf())
        .map_err(|_| SnapshotError::Malformed)
}

fn validate_entry(header: &Header, path: &Path) -> Result<(), SnapshotError> {
    let display = path.display().to_string();

    match header.entry_type() {
        EntryType::Regular | EntryType::Directory => {}
        EntryType::Symlink | EntryType::Link => {
            return Err(SnapshotError::LinkEntry { path: display });
        }
        _ => {
            return Err(SnapshotError::UnsafePath { path: display });
        }
    }

    let mut components = path.components();
    let first = match components.next() {
        Some(Component::Normal(name)) => name.to_string_lossy().into_owned(),
        _ => return Err(SnapshotError::UnsafePath { path: display }),
    };
    for component in components {
        match component {
            Component::Normal(_) => {}
            _ => return Err(SnapshotError::UnsafePath { path: display }),
        }
    }

    if !STATE_ALLOW_DIRS.contains(&first.as_str()) {
        return Err(SnapshotError::NotAllowlisted { path: display });
    }

    if header.size().map_err(|_| SnapshotError::Malformed)? > MAX_ENTRY_SIZE {
        return Err(SnapshotError::EntryTooLarge { path: display });
    }

    Ok(())
}

/// Recursively append `base/rel` to the builder, keeping paths relative.
fn append_tree<W: std::io::Write>(
    builder: &mut Builder<W>,
    base: &Path,
    rel: &Path,
) -> Result<(), SnapshotError> {
    let abs = base.join(rel);
    let meta = fs::symlink_metadata(&abs)?;

    if meta.file_type().is_symlink() {
        match resolves_within(&abs, base) {
            Some(target) if target.is_file() => {
                let mut file = fs::File::open(&target)?;
                builder.append_file(rel, &mut file)?;
            }
            _ => {
                tracing::warn!(path = %abs.display(), "skipping symlink pointing outside snapshot tree");
            }
        }
        return Ok(());
    }

    if meta.is_dir() {
        builder.append_dir(rel, &abs)?;
        let mut children: Vec<_> = fs::read_dir(&abs)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.file_name())
            .collect();
        children.sort();
        for child in children {
            append_tree(builder, base, &rel.join(&child))?;
        }
        return Ok(());
    }

    let mut file = fs::File::open(&abs)?;
    builder.append_file(rel, &mut file)?;
    Ok(())
}

/// Canonical target of a symlink, if it stays inside `base`.
fn resolves_within(link: &Path, base: &Path) -> Option<PathBuf> {
    let target = fs::canonicalize(link).ok()?;
    let base = fs::canonicalize(base).ok()?;
    target.starts_with(&base).then_some(target)
}
