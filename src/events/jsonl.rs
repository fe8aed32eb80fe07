//! Handler (b): appends each finalized entity as one line of `results.jsonl`,
//! splicing in place on the rare re-finalization a fixture remedy produces.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use tokio::io::AsyncWriteExt;

use crate::error::{DutTestError, FilesystemError};
use crate::result::EntityResult;

use super::{Handler, HandlerFuture};

/// Writes `results.jsonl`, one finalized [`EntityResult`] per line.
pub struct JsonlWriter {
    path: Utf8PathBuf,
    /// Byte offset and length (including the trailing newline) of each
    /// entity's most recently written line.
    offsets: BTreeMap<String, (u64, u64)>,
}

impl JsonlWriter {
    /// Creates a writer targeting `path`, which is created (or truncated)
    /// lazily on the first write.
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            offsets: BTreeMap::new(),
        }
    }

    fn io_error(&self, message: impl Into<String>) -> DutTestError {
        DutTestError::Filesystem(FilesystemError::IoError {
            path: self.path.clone().into_std_path_buf(),
            message: message.into(),
        })
    }

    async fn append_line(&mut self, name: &str, line: &str) -> Result<(), DutTestError> {
        let start = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e.to_string()))?;
        self.offsets
            .insert(name.to_owned(), (start, line.len() as u64));
        Ok(())
    }

    async fn splice_line(
        &mut self,
        name: &str,
        line: &str,
        start: u64,
        old_len: u64,
    ) -> Result<(), DutTestError> {
        let mut contents = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.io_error(e.to_string()))?;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "results files stay well under usize::MAX"
        )]
        let (start_idx, old_end) = (start as usize, (start + old_len) as usize);
        if old_end > contents.len() || start_idx > old_end {
            return Err(self.io_error("recorded offset out of range".to_owned()));
        }
        contents.splice(start_idx..old_end, line.bytes());
        tokio::fs::write(&self.path, &contents)
            .await
            .map_err(|e| self.io_error(e.to_string()))?;

        let delta = i64::from(line.len() as u32) - i64::from(old_len as u32);
        for (other_name, (other_start, _)) in &mut self.offsets {
            if other_name != name && *other_start >= start + old_len {
                *other_start = (i64::try_from(*other_start).unwrap_or(0) + delta).max(0) as u64;
            }
        }
        self.offsets
            .insert(name.to_owned(), (start, line.len() as u64));
        Ok(())
    }
}

impl Handler for JsonlWriter {
    fn name(&self) -> &'static str {
        "jsonl_writer"
    }

    fn on_entity_end<'a>(&'a mut self, result: &'a EntityResult) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mut line = serde_json::to_string(result).map_err(|e| self.io_error(e.to_string()))?;
            line.push('\n');

            if let Some((start, old_len)) = self.offsets.get(&result.name).copied() {
                self.splice_line(&result.name, &line, start, old_len).await
            } else {
                self.append_line(&result.name, &line).await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn writes_one_line_per_entity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("results.jsonl")).expect("utf8");
        let mut writer = JsonlWriter::new(path.clone());

        let mut first = EntityResult::started("pkg.One", Utc::now());
        first.end = Some(Utc::now());
        writer.on_entity_end(&first).await.expect("write first");

        let mut second = EntityResult::started("pkg.Two", Utc::now());
        second.end = Some(Utc::now());
        writer.on_entity_end(&second).await.expect("write second");

        let contents = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("pkg.One"));
        assert!(contents.contains("pkg.Two"));
    }

    #[tokio::test]
    async fn re_finalizing_an_entity_splices_its_line_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("results.jsonl")).expect("utf8");
        let mut writer = JsonlWriter::new(path.clone());

        let mut first = EntityResult::started("pkg.One", Utc::now());
        first.errors.push(crate::result::SerializedError {
            reason: "boom".to_owned(),
            file: "x.rs".to_owned(),
            line: 1,
            stack: None,
        });
        first.end = Some(Utc::now());
        writer.on_entity_end(&first).await.expect("write first");

        let mut second = EntityResult::started("pkg.Two", Utc::now());
        second.end = Some(Utc::now());
        writer.on_entity_end(&second).await.expect("write second");

        let mut remedied = EntityResult::started("pkg.One", first.start);
        remedied.end = Some(Utc::now());
        writer.on_entity_end(&remedied).await.expect("splice");

        let contents = tokio::fs::read_to_string(&path).await.expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].contains("boom"));
        assert!(lines[1].contains("pkg.Two"));
    }
}
