//! Pipeline state persisted between cycles (`state.json`).
//!
//! Tracks which staged files were converted, whether anything new was
//! converted since the last publish, what was last published and the date the
//! end-of-day operations last ran.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::FileType;
use crate::utils::fs::{read_json, write_json};

/// A staged file already turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConvertedFile {
    pub chain: String,
    pub file_type: FileType,
    pub file_name: String,
}

/// Last successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMark {
    pub scrape_date: NaiveDate,
    pub cutoff: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default)]
    pub converted: BTreeSet<ConvertedFile>,
    #[serde(default)]
    pub converted_since_publish: bool,
    #[serde(default)]
    pub last_publish: Option<PublishMark>,
    #[serde(default)]
    pub last_final_run: Option<NaiveDate>,
}

impl PipelineState {
    pub fn is_converted(&self, chain: &str, file_name: &str) -> bool {
        self.converted
            .iter()
            .any(|c| c.chain == chain && c.file_name == file_name)
    }

    pub fn published_on(&self, date: NaiveDate) -> Option<&PublishMark> {
        self.last_publish.as_ref().filter(|p| p.scrape_date == date)
    }
}

/// Loads and saves [`PipelineState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file is a fresh state.
    pub async fn load(&self) -> Result<PipelineState> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn save(&self, state: &PipelineState) -> Result<()> {
        write_json(&self.path, state).await
    }
}
