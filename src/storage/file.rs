//! Local filesystem storage implementation.
//!
//! Used as the `file` short-term destination and as the outputs mirror the
//! publisher snapshots from.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── price_full_file_shufersal.jsonl   # one JSON record per line
//! └── store_file_victory.jsonl
//! ```
//!
//! Files are append-only; reads compact by natural id with the last line
//! winning, so re-ingesting a file overwrites it. `purge_until` rewrites the
//! file atomically (write to temp, then rename).

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{AppError, Result};
use crate::models::StorageRecord;
use crate::storage::{
    Page, PageRequest, RecordFilter, RecordStorage, WriteSummary, accept_valid, paginate, retry,
};

const EXTENSION: &str = "jsonl";

/// Local filesystem storage backend.
#[derive(Clone)]
pub struct FileStorage {
    root_dir: PathBuf,
    max_attempts: u32,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FileStorage {
    /// Create a new FileStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>, max_attempts: u32) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_attempts,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a target.
    fn path(&self, target: &str) -> PathBuf {
        self.root_dir.join(format!("{target}.{EXTENSION}"))
    }

    /// Lock serializing writers of one target.
    fn lock_for(&self, target: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(target.to_string()).or_default())
    }

    fn check_target(target: &str) -> Result<()> {
        if target.is_empty() || target.contains(['/', '\\', '.']) {
            return Err(AppError::validation(format!("invalid target name '{target}'")));
        }
        Ok(())
    }

    /// Append one JSON line.
    ///
    /// A failed write is truncated back to the previous length so a retry
    /// starts on a clean line. A torn tail left by an earlier crash is closed
    /// with a newline first.
    async fn append_line(&self, target: &str, line: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.path(target))
            .await?;
        let start = file.metadata().await?.len();

        let mut bytes = Vec::with_capacity(line.len() + 1);
        if start > 0 && !line.is_empty() {
            file.seek(SeekFrom::Start(start - 1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                bytes.push(b'\n');
            }
        }
        bytes.extend_from_slice(line);

        let written = match file.write_all(&bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(truncate) = file.set_len(start).await {
                log::error!(
                    "Failed to truncate {} after a partial write: {}",
                    self.path(target).display(),
                    truncate
                );
            }
            return Err(AppError::Io(e));
        }
        Ok(())
    }

    /// Read bytes, returning None if the file doesn't exist.
    async fn read_bytes(&self, target: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(target)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Current records of a target, compacted by natural id.
    async fn load(&self, target: &str) -> Result<BTreeMap<String, StorageRecord>> {
        let mut records = BTreeMap::new();
        let Some(bytes) = self.read_bytes(target).await? else {
            return Ok(records);
        };
        for (n, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<StorageRecord>(line) {
                Ok(record) => {
                    records.insert(record.natural_id().to_string(), record);
                }
                Err(e) => log::warn!("Skipping corrupt line {} in {}: {}", n + 1, target, e),
            }
        }
        Ok(records)
    }

    /// Replace a target's file with `records` (write to temp, then rename).
    async fn rewrite<'a>(
        &self,
        target: &str,
        records: impl Iterator<Item = &'a StorageRecord>,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        for record in records {
            serde_json::to_writer(&mut bytes, record)?;
            bytes.push(b'\n');
        }
        let path = self.path(target);
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStorage for FileStorage {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn ensure_target(&self, target: &str) -> Result<()> {
        Self::check_target(target)?;
        tokio::fs::create_dir_all(&self.root_dir).await?;
        let lock = self.lock_for(target);
        let _guard = lock.lock().await;
        self.append_line(target, b"").await
    }

    async fn write_records(
        &self,
        target: &str,
        records: &[StorageRecord],
    ) -> Result<WriteSummary> {
        Self::check_target(target)?;
        tokio::fs::create_dir_all(&self.root_dir).await?;

        let mut summary = WriteSummary::default();
        let accepted = accept_valid(target, records, &mut summary);

        let lock = self.lock_for(target);
        let _guard = lock.lock().await;
        for record in accepted {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            match retry(self.max_attempts, || self.append_line(target, &line)).await {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    log::error!(
                        "Dropping {} after {} attempts: {}",
                        record.file_name,
                        self.max_attempts,
                        e
                    );
                    summary.reject(record, e);
                }
            }
        }
        log::debug!(
            "Wrote {} records to {} ({} failed)",
            summary.written,
            self.path(target).display(),
            summary.failed.len()
        );
        Ok(summary)
    }

    async fn read_records(
        &self,
        target: &str,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page> {
        Self::check_target(target)?;
        let records = self.load(target).await?;
        Ok(paginate(records.into_values(), filter, page))
    }

    async fn health(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir).await?;
        let meta = tokio::fs::metadata(&self.root_dir).await?;
        if meta.permissions().readonly() {
            return Err(AppError::storage(
                self.root_dir.display().to_string(),
                "directory is read-only",
            ));
        }
        Ok(())
    }

    async fn list_targets(&self) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(targets),
            Err(e) => return Err(AppError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                targets.push(stem.to_string());
            }
        }
        targets.sort();
        Ok(targets)
    }

    async fn purge_until(&self, target: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        Self::check_target(target)?;
        let lock = self.lock_for(target);
        let _guard = lock.lock().await;

        let records = self.load(target).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let before = records.len();
        let kept: Vec<&StorageRecord> = records
            .values()
            .filter(|r| r.ingested_at > cutoff)
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite(target, kept.into_iter()).await?;
        }
        Ok(removed)
    }
}
