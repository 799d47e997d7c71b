//! Directory tree primitives: listing, copying, merging and removal.
//!
//! All walks use an explicit worklist of relative paths instead of recursion.
//! Symbolic links to files are followed (their content is copied); symbolic
//! links to directories, dangling links and special files are skipped.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Buffer size for streamed content comparison.
const COMPARE_CHUNK: usize = 64 * 1024;

/// Kind of a directory entry, as seen by tree walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// Regular file (or link to one) with its size in bytes.
    File(u64),
    /// Real directory (never a link).
    Dir,
}

/// Classify a path; `None` means the walk ignores it.
pub(crate) fn classify(path: &Path) -> io::Result<Option<EntryKind>> {
    let meta = fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        return match fs::metadata(path) {
            Ok(target) if target.is_file() => Ok(Some(EntryKind::File(target.len()))),
            Ok(_) => {
                debug!("Skipping linked directory {}", path.display());
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Skipping dangling link {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        };
    }

    if file_type.is_dir() {
        Ok(Some(EntryKind::Dir))
    } else if file_type.is_file() {
        Ok(Some(EntryKind::File(meta.len())))
    } else {
        Ok(None)
    }
}

/// List the walkable entries of a directory, ordered by name.
pub(crate) fn read_entries(dir: &Path) -> io::Result<BTreeMap<OsString, EntryKind>> {
    let mut entries = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(kind) = classify(&entry.path())? {
            entries.insert(entry.file_name(), kind);
        }
    }
    Ok(entries)
}

/// Compare two files of equal size byte for byte.
pub(crate) fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    let mut left = BufReader::new(File::open(a)?);
    let mut right = BufReader::new(File::open(b)?);
    let mut left_buf = vec![0u8; COMPARE_CHUNK];
    let mut right_buf = vec![0u8; COMPARE_CHUNK];

    loop {
        let left_len = fill(&mut left, &mut left_buf)?;
        let right_len = fill(&mut right, &mut right_buf)?;

        if left_len != right_len || left_buf[..left_len] != right_buf[..right_len] {
            return Ok(false);
        }
        if left_len == 0 {
            return Ok(true);
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Totals from a fresh tree copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Totals from merging a tree into an existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Files that were missing or differed and got written.
    pub files_written: usize,
    /// Files already identical in the destination.
    pub files_unchanged: usize,
    /// Directories created in the destination.
    pub directories_created: usize,
}

impl MergeStats {
    /// Whether the merge changed anything on disk.
    pub fn changed(&self) -> bool {
        self.files_written > 0 || self.directories_created > 0
    }
}

/// Copy `src` into `dst`, which must not exist yet.
///
/// # Postconditions
/// - `dst` is a directory holding every walkable entry of `src`
///
/// # Errors
/// - `dst` already exists
/// - Any read or write failure; a partial `dst` is left behind
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    fs::create_dir(dst)?;
    stats.directories += 1;

    let mut pending: Vec<PathBuf> = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let from_dir = src.join(&rel);
        let to_dir = dst.join(&rel);

        for (name, kind) in read_entries(&from_dir)? {
            let from = from_dir.join(&name);
            let to = to_dir.join(&name);
            match kind {
                EntryKind::Dir => {
                    fs::create_dir(&to)?;
                    stats.directories += 1;
                    pending.push(rel.join(&name));
                }
                EntryKind::File(_) => {
                    stats.bytes += fs::copy(&from, &to)?;
                    stats.files += 1;
                }
            }
        }
    }

    Ok(stats)
}

/// Merge `src` into the existing directory `dst`.
///
/// Missing entries are added and differing files overwritten. Entries that
/// exist only in `dst` are left alone. When a name is a file on one side and
/// a directory on the other, the `dst` entry is replaced.
pub fn merge_tree(src: &Path, dst: &Path) -> io::Result<MergeStats> {
    let mut stats = MergeStats::default();

    let mut pending: Vec<PathBuf> = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let from_dir = src.join(&rel);
        let to_dir = dst.join(&rel);
        let existing = read_entries(&to_dir)?;

        for (name, kind) in read_entries(&from_dir)? {
            let from = from_dir.join(&name);
            let to = to_dir.join(&name);
            let current = existing.get(&name).copied();

            match (kind, current) {
                (EntryKind::Dir, Some(EntryKind::Dir)) => {}
                (EntryKind::Dir, other) => {
                    if other.is_some() {
                        fs::remove_file(&to)?;
                    }
                    fs::create_dir(&to)?;
                    stats.directories_created += 1;
                }
                (EntryKind::File(len), Some(EntryKind::File(dst_len))) => {
                    if len == dst_len && same_content(&from, &to)? {
                        stats.files_unchanged += 1;
                    } else {
                        fs::copy(&from, &to)?;
                        stats.files_written += 1;
                    }
                }
                (EntryKind::File(_), Some(EntryKind::Dir)) => {
                    fs::remove_dir_all(&to)?;
                    fs::copy(&from, &to)?;
                    stats.files_written += 1;
                }
                (EntryKind::File(_), None) => {
                    fs::copy(&from, &to)?;
                    stats.files_written += 1;
                }
            }

            if kind == EntryKind::Dir {
                pending.push(rel.join(&name));
            }
        }
    }

    Ok(stats)
}

/// Remove a directory tree.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    fs::remove_dir_all(path)
}

/// Tree writes a `SnapshotStore` performs.
///
/// Comparison stays on the real filesystem; only the operations that
/// create, change or delete snapshot contents go through this trait.
pub trait TreeOps: Send + Sync {
    /// Copy `src` into the new directory `dst`.
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<CopyStats>;

    /// Merge `src` into the existing directory `dst`.
    fn merge(&self, src: &Path, dst: &Path) -> io::Result<MergeStats>;

    /// Remove the tree at `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// `TreeOps` on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTree;

impl TreeOps for LocalTree {
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<CopyStats> {
        copy_tree(src, dst)
    }

    fn merge(&self, src: &Path, dst: &Path) -> io::Result<MergeStats> {
        merge_tree(src, dst)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        remove_tree(path)
    }
}
