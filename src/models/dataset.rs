//! Long-term dataset versions.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FileType, StorageRecord};

/// One record included in a dataset version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub target: String,
    pub chain: String,
    pub file_type: FileType,
    pub file_name: String,
    pub ingested_at: DateTime<Utc>,
    pub digest: String,
}

impl From<&StorageRecord> for ManifestEntry {
    fn from(record: &StorageRecord) -> Self {
        Self {
            target: record.target(),
            chain: record.chain.clone(),
            file_type: record.file_type,
            file_name: record.file_name.clone(),
            ingested_at: record.ingested_at,
            digest: record.digest(),
        }
    }
}

/// Immutable snapshot bound to one scrape date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub version: u64,
    pub scrape_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    /// Records ingested at or before this instant are included
    pub cutoff: DateTime<Utc>,
    pub manifest: Vec<ManifestEntry>,
}

/// Index entry kept for every published version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub scrape_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub record_count: usize,
}

/// `index.json` shipped with every version: version number to scrape date.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionIndex {
    pub dataset: String,
    pub versions: BTreeMap<u64, VersionInfo>,
}

impl VersionIndex {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            versions: BTreeMap::new(),
        }
    }

    /// Version already published for a scrape date.
    pub fn find_by_date(&self, date: NaiveDate) -> Option<(u64, &VersionInfo)> {
        self.versions
            .iter()
            .find(|(_, info)| info.scrape_date == date)
            .map(|(v, info)| (*v, info))
    }

    pub fn latest(&self) -> Option<(u64, &VersionInfo)> {
        self.versions.iter().next_back().map(|(v, info)| (*v, info))
    }

    pub fn next_version(&self) -> u64 {
        self.latest().map(|(v, _)| v + 1).unwrap_or(1)
    }

    pub fn record(&mut self, version: &DatasetVersion) {
        self.versions.insert(
            version.version,
            VersionInfo {
                scrape_date: version.scrape_date,
                created_at: version.created_at,
                cutoff: version.cutoff,
                record_count: version.manifest.len(),
            },
        );
    }
}
