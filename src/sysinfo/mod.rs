//! System-state diff engine: log byte-offset diffing and crash-dump
//! discovery across a run.
//!
//! A known limitation (see `DESIGN.md`): a file whose size shrank since the
//! snapshot is always treated as rotated and copied in full from offset
//! zero. No inode-to-path memo is kept across renames, so a rotation that
//! briefly retains the old inode under a new name is not detected as a
//! continuation.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use crate::error::SysInfoError;

/// A snapshot of `(inode, size)` for every regular file under a directory
/// tree, excluding any path under `exclude`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogInodeSizes {
    sizes: BTreeMap<Utf8PathBuf, (u64, u64)>,
}

impl LogInodeSizes {
    /// Walks `root`, recording `(inode, size)` for every regular file not
    /// under any prefix in `exclude`.
    ///
    /// # Errors
    ///
    /// Returns [`SysInfoError::WalkFailed`] if `root` cannot be walked.
    pub fn snapshot(root: &Utf8Path, exclude: &[Utf8PathBuf]) -> Result<Self, SysInfoError> {
        let mut sizes = BTreeMap::new();
        for entry in WalkDir::new(root).into_iter() {
            let entry = entry.map_err(|e| SysInfoError::WalkFailed {
                path: root.as_std_path().to_path_buf(),
                message: e.to_string(),
            })?;
            let Ok(path) = Utf8PathBuf::try_from(entry.path().to_path_buf()) else {
                continue;
            };
            if is_excluded(&path, exclude) {
                continue;
            }
            let file_type = entry.file_type();
            if !file_type.is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            sizes.insert(path, (metadata.ino(), metadata.size()));
        }
        Ok(Self { sizes })
    }

    /// Diffs `self` (the "before" snapshot) against the current state of
    /// the same tree, copying new or appended bytes into `dest_root`
    /// (mirroring the relative path of each source file).
    ///
    /// Returns the set of paths copied.
    ///
    /// # Errors
    ///
    /// Returns [`SysInfoError::CopyFailed`] if a file cannot be read or the
    /// destination cannot be written.
    pub fn diff_copy(
        &self,
        root: &Utf8Path,
        exclude: &[Utf8PathBuf],
        dest_root: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, SysInfoError> {
        let mut copied = Vec::new();
        for entry in WalkDir::new(root).into_iter().filter_map(std::result::Result::ok) {
            let Ok(path) = Utf8PathBuf::try_from(entry.path().to_path_buf()) else {
                continue;
            };
            if is_excluded(&path, exclude) || !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let new_ino = metadata.ino();
            let new_size = metadata.size();

            let offset = match self.sizes.get(&path) {
                Some(&(old_ino, old_size)) if old_ino == new_ino && new_size >= old_size => {
                    old_size
                }
                Some(&(old_ino, old_size)) if old_ino == new_ino => {
                    tracing::warn!(
                        path = %path,
                        old_size,
                        new_size,
                        "log file shrank since snapshot, treating as rotated"
                    );
                    0
                }
                _ => 0,
            };

            copy_from_offset(&path, offset, root, dest_root)?;
            copied.push(path);
        }
        Ok(copied)
    }
}

fn is_excluded(path: &Utf8Path, exclude: &[Utf8PathBuf]) -> bool {
    exclude.iter().any(|prefix| path.starts_with(prefix))
}

fn copy_from_offset(
    source: &Utf8Path,
    offset: u64,
    root: &Utf8Path,
    dest_root: &Utf8Path,
) -> Result<(), SysInfoError> {
    let relative = source.strip_prefix(root).unwrap_or(source);
    let dest_path = dest_root.join(relative);
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SysInfoError::CopyFailed {
            path: source.as_std_path().to_path_buf(),
            message: e.to_string(),
        })?;
    }

    let mut src_file = std::fs::File::open(source).map_err(|e| SysInfoError::CopyFailed {
        path: source.as_std_path().to_path_buf(),
        message: e.to_string(),
    })?;
    src_file
        .seek(SeekFrom::Start(offset))
        .map_err(|e| SysInfoError::CopyFailed {
            path: source.as_std_path().to_path_buf(),
            message: e.to_string(),
        })?;

    let mut buf = Vec::new();
    src_file
        .read_to_end(&mut buf)
        .map_err(|e| SysInfoError::CopyFailed {
            path: source.as_std_path().to_path_buf(),
            message: e.to_string(),
        })?;

    let mut dest_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&dest_path)
        .map_err(|e| SysInfoError::CopyFailed {
            path: dest_path.as_std_path().to_path_buf(),
            message: e.to_string(),
        })?;
    dest_file
        .write_all(&buf)
        .map_err(|e| SysInfoError::CopyFailed {
            path: dest_path.as_std_path().to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(())
}

/// Diffs two crash-directory listings and copies new files into `dest`,
/// subject to a per-executable cap.
///
/// `before`/`after` map an executable name to the set of crash-dump file
/// names observed for it.
///
/// # Errors
///
/// Returns [`SysInfoError::CopyFailed`] if a new crash file cannot be read.
pub fn diff_crash_dumps(
    before: &BTreeMap<String, BTreeSet<String>>,
    after: &BTreeMap<String, BTreeSet<String>>,
    source_dir: &Utf8Path,
    dest_dir: &Utf8Path,
    per_executable_cap: usize,
) -> Result<Vec<String>, SysInfoError> {
    let mut copied = Vec::new();
    for (executable, after_files) in after {
        let before_files = before.get(executable).cloned().unwrap_or_default();
        let mut new_files: Vec<&String> = after_files.difference(&before_files).collect();
        new_files.sort();
        new_files.truncate(per_executable_cap);

        for file_name in new_files {
            let source = source_dir.join(file_name);
            let dest = dest_dir.join(file_name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SysInfoError::CopyFailed {
                    path: source.as_std_path().to_path_buf(),
                    message: e.to_string(),
                })?;
            }
            std::fs::copy(&source, &dest).map_err(|e| SysInfoError::CopyFailed {
                path: source.as_std_path().to_path_buf(),
                message: e.to_string(),
            })?;
            copied.push(file_name.clone());
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    fn diff_copy_copies_only_appended_bytes() {
        let src_dir = tempdir().expect("tempdir");
        let dest_dir = tempdir().expect("tempdir");
        let root = Utf8PathBuf::try_from(src_dir.path().to_path_buf()).expect("utf8");
        let dest_root = Utf8PathBuf::try_from(dest_dir.path().to_path_buf()).expect("utf8");
        let log_path = root.join("messages");

        std::fs::write(&log_path, b"hello").expect("write");
        let snapshot = LogInodeSizes::snapshot(&root, &[]).expect("snapshot");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .expect("open for append");
        file.write_all(b" world").expect("append");
        drop(file);

        let copied = snapshot
            .diff_copy(&root, &[], &dest_root)
            .expect("diff_copy");
        assert_eq!(copied.len(), 1);

        let dest_content =
            std::fs::read_to_string(dest_root.join("messages")).expect("read dest");
        assert_eq!(dest_content, " world");
    }

    #[rstest]
    fn diff_copy_copies_full_file_when_truncated() {
        let src_dir = tempdir().expect("tempdir");
        let dest_dir = tempdir().expect("tempdir");
        let root = Utf8PathBuf::try_from(src_dir.path().to_path_buf()).expect("utf8");
        let dest_root = Utf8PathBuf::try_from(dest_dir.path().to_path_buf()).expect("utf8");
        let log_path = root.join("messages");

        std::fs::write(&log_path, b"0123456789abc").expect("write");
        let snapshot = LogInodeSizes::snapshot(&root, &[]).expect("snapshot");

        std::fs::write(&log_path, b"short").expect("truncate+rewrite");

        let copied = snapshot
            .diff_copy(&root, &[], &dest_root)
            .expect("diff_copy");
        assert_eq!(copied.len(), 1);

        let dest_content =
            std::fs::read_to_string(dest_root.join("messages")).expect("read dest");
        assert_eq!(dest_content, "short");
    }

    #[rstest]
    fn excluded_paths_are_skipped() {
        let src_dir = tempdir().expect("tempdir");
        let root = Utf8PathBuf::try_from(src_dir.path().to_path_buf()).expect("utf8");
        std::fs::create_dir_all(root.join("skip")).expect("mkdir");
        std::fs::write(root.join("skip/ignored.log"), b"x").expect("write");

        let snapshot = LogInodeSizes::snapshot(&root, &[root.join("skip")]).expect("snapshot");
        assert!(snapshot.sizes.is_empty());
    }

    #[rstest]
    fn crash_dump_diff_respects_per_executable_cap() {
        let src_dir = tempdir().expect("tempdir");
        let dest_dir = tempdir().expect("tempdir");
        let source = Utf8PathBuf::try_from(src_dir.path().to_path_buf()).expect("utf8");
        let dest = Utf8PathBuf::try_from(dest_dir.path().to_path_buf()).expect("utf8");

        for n in 0..5 {
            std::fs::write(source.join(format!("crash.{n}.dmp")), b"dump").expect("write");
        }

        let before = BTreeMap::new();
        let mut after = BTreeMap::new();
        after.insert(
            "myexe".to_owned(),
            (0..5).map(|n| format!("crash.{n}.dmp")).collect(),
        );

        let copied = diff_crash_dumps(&before, &after, &source, &dest, 3).expect("diff");
        assert_eq!(copied.len(), 3);
    }
}
