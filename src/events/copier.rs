//! Handler (c): copies each entity's bundle-side intermediate output
//! directory into the final results directory.
//!
//! `EntityCopyEnd` itself is not emitted here: it is pinned to the bundle
//! tier (see `DESIGN.md`) so a driver-side copier and a bundle-side one
//! never both signal completion for the same entity.

use camino::Utf8PathBuf;
use walkdir::WalkDir;

use crate::error::{DutTestError, FilesystemError};
use crate::result::EntityResult;

use super::{Handler, HandlerFuture};

/// Copies `intermediate_root/<entity>` to `results_root/<entity>` for every
/// finalized entity, skipping entities that produced no output directory.
pub struct ArtifactCopier {
    intermediate_root: Utf8PathBuf,
    results_root: Utf8PathBuf,
}

impl ArtifactCopier {
    /// Creates a copier moving output from under `intermediate_root` into
    /// `results_root`, one subdirectory per entity name.
    #[must_use]
    pub fn new(intermediate_root: Utf8PathBuf, results_root: Utf8PathBuf) -> Self {
        Self {
            intermediate_root,
            results_root,
        }
    }
}

impl Handler for ArtifactCopier {
    fn name(&self) -> &'static str {
        "artifact_copier"
    }

    fn on_entity_end<'a>(&'a mut self, result: &'a EntityResult) -> HandlerFuture<'a> {
        let source = self.intermediate_root.join(&result.name);
        let dest = self.results_root.join(&result.name);
        let dest_for_join_error = dest.clone();
        Box::pin(async move {
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                return Ok(());
            }
            tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
                .await
                .map_err(|e| {
                    DutTestError::Filesystem(FilesystemError::IoError {
                        path: dest_for_join_error.into_std_path_buf(),
                        message: format!("artifact copy task panicked: {e}"),
                    })
                })??;
            Ok(())
        })
    }
}

fn copy_tree(source: &Utf8PathBuf, dest: &Utf8PathBuf) -> Result<(), DutTestError> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            DutTestError::Filesystem(FilesystemError::IoError {
                path: source.clone().into_std_path_buf(),
                message: e.to_string(),
            })
        })?;
        let Ok(path) = Utf8PathBuf::try_from(entry.path().to_path_buf()) else {
            continue;
        };
        let relative = path.strip_prefix(source).unwrap_or(&path);
        let dest_path = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest_path).map_err(|e| io_error(&dest_path, &e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
            }
            std::fs::copy(&path, &dest_path).map_err(|e| io_error(&path, &e))?;
        }
    }
    Ok(())
}

fn io_error(path: &camino::Utf8Path, err: &std::io::Error) -> DutTestError {
    DutTestError::Filesystem(FilesystemError::IoError {
        path: path.as_std_path().to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn copies_intermediate_directory_for_finalized_entity() {
        let intermediate = tempfile::tempdir().expect("intermediate dir");
        let results = tempfile::tempdir().expect("results dir");

        let entity_dir = intermediate.path().join("pkg.One");
        std::fs::create_dir_all(entity_dir.join("logs")).expect("mkdir");
        std::fs::write(entity_dir.join("logs").join("out.txt"), b"hello").expect("write");

        let mut copier = ArtifactCopier::new(
            Utf8PathBuf::from_path_buf(intermediate.path().to_path_buf()).expect("utf8"),
            Utf8PathBuf::from_path_buf(results.path().to_path_buf()).expect("utf8"),
        );

        let mut result = EntityResult::started("pkg.One", Utc::now());
        result.end = Some(Utc::now());
        copier.on_entity_end(&result).await.expect("copy");

        let copied = results.path().join("pkg.One").join("logs").join("out.txt");
        assert_eq!(std::fs::read_to_string(copied).expect("read copy"), "hello");
    }

    #[tokio::test]
    async fn missing_intermediate_directory_is_not_an_error() {
        let intermediate = tempfile::tempdir().expect("intermediate dir");
        let results = tempfile::tempdir().expect("results dir");
        let mut copier = ArtifactCopier::new(
            Utf8PathBuf::from_path_buf(intermediate.path().to_path_buf()).expect("utf8"),
            Utf8PathBuf::from_path_buf(results.path().to_path_buf()).expect("utf8"),
        );

        let mut result = EntityResult::started("pkg.Missing", Utc::now());
        result.end = Some(Utc::now());
        copier.on_entity_end(&result).await.expect("no-op copy");

        assert!(!results.path().join("pkg.Missing").exists());
    }
}
