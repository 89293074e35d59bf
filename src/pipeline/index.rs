//! Chain index generation for the serving layer.
//!
//! Builds a static `chain_index.json` mapping each chain to the file types it
//! has data for, so the read side can list chains and types without scanning
//! every target.
//!
//! > Example: `{"SHUFERSAL": [{"file_type": "PRICE_FILE", "record_count": 12, ...}]}`

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{FileType, StorageRecord, split_target};
use crate::storage::{RecordFilter, RecordStorage, read_all};

/// What one target holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTypeEntry {
    pub file_type: FileType,
    pub target: String,
    pub record_count: usize,
    pub latest_file: Option<String>,
    pub latest_ingested_at: Option<DateTime<Utc>>,
}

/// Chain to file types, as served to readers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainIndex {
    /// Version for cache busting
    pub version: u32,
    pub updated_at: Option<DateTime<Utc>>,
    /// Total number of indexed records
    pub record_count: usize,
    pub chains: BTreeMap<String, Vec<FileTypeEntry>>,
}

impl ChainIndex {
    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn file_types(&self, chain: &str) -> Vec<FileType> {
        self.chains
            .get(&chain.to_uppercase())
            .map(|entries| entries.iter().map(|e| e.file_type).collect())
            .unwrap_or_default()
    }

    pub fn target(&self, chain: &str, file_type: FileType) -> Option<&FileTypeEntry> {
        self.chains
            .get(&chain.to_uppercase())?
            .iter()
            .find(|e| e.file_type == file_type)
    }
}

/// Builder for constructing a chain index.
#[derive(Default)]
pub struct IndexBuilder {
    chains: BTreeMap<String, BTreeMap<FileType, FileTypeEntry>>,
    record_count: usize,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target and the records it currently holds.
    ///
    /// Targets whose name is not `{file_type}_{chain}` are ignored.
    pub fn add_target(&mut self, target: &str, records: &[StorageRecord]) {
        let Some((file_type, chain)) = split_target(target) else {
            log::debug!("Skipping non-record target {}", target);
            return;
        };
        let latest = records.iter().max_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.record_count += records.len();
        self.chains.entry(chain.to_uppercase()).or_default().insert(
            file_type,
            FileTypeEntry {
                file_type,
                target: target.to_string(),
                record_count: records.len(),
                latest_file: latest.map(|r| r.file_name.clone()),
                latest_ingested_at: latest.map(|r| r.ingested_at),
            },
        );
    }

    pub fn build(self, updated_at: DateTime<Utc>) -> ChainIndex {
        ChainIndex {
            version: 1,
            updated_at: Some(updated_at),
            record_count: self.record_count,
            chains: self
                .chains
                .into_iter()
                .map(|(chain, types)| (chain, types.into_values().collect()))
                .collect(),
        }
    }
}

/// Build the index from every target in `storage`.
pub async fn build_chain_index(
    storage: &dyn RecordStorage,
    updated_at: DateTime<Utc>,
) -> Result<ChainIndex> {
    let mut builder = IndexBuilder::new();
    for target in storage.list_targets().await? {
        let records = read_all(storage, &target, &RecordFilter::default()).await?;
        builder.add_target(&target, &records);
    }
    Ok(builder.build(updated_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chain: &str, file_type: FileType, name: &str, minute: i64) -> StorageRecord {
        StorageRecord::new(
            chain,
            file_type,
            name,
            "",
            DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::minutes(minute),
        )
    }

    #[test]
    fn test_builder_groups_by_chain() {
        let mut builder = IndexBuilder::new();
        builder.add_target(
            "price_file_shufersal",
            &[
                record("SHUFERSAL", FileType::PriceFile, "Price1.xml", 1),
                record("SHUFERSAL", FileType::PriceFile, "Price2.xml", 5),
            ],
        );
        builder.add_target("store_file_shufersal", &[]);
        builder.add_target("chain_index", &[]);

        let index = builder.build(Utc::now());
        assert_eq!(index.record_count, 2);
        assert_eq!(index.chains().collect::<Vec<_>>(), vec!["SHUFERSAL"]);
        assert_eq!(
            index.file_types("shufersal"),
            vec![FileType::StoreFile, FileType::PriceFile]
        );
        let price = index.target("SHUFERSAL", FileType::PriceFile).unwrap();
        assert_eq!(price.latest_file.as_deref(), Some("Price2.xml"));
    }
}
