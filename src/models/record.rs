//! Scraped feed files and the records they become.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

static FILE_TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(pricefull|price|promofull|promo|stores?)").expect("static regex")
});

/// Category of feed content published by a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    StoreFile,
    PriceFile,
    PromoFile,
    PriceFullFile,
    PromoFullFile,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::StoreFile,
        FileType::PriceFile,
        FileType::PromoFile,
        FileType::PriceFullFile,
        FileType::PromoFullFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::StoreFile => "STORE_FILE",
            FileType::PriceFile => "PRICE_FILE",
            FileType::PromoFile => "PROMO_FILE",
            FileType::PriceFullFile => "PRICE_FULL_FILE",
            FileType::PromoFullFile => "PROMO_FULL_FILE",
        }
    }

    /// Detect the file type from a published feed file name,
    /// e.g. `PriceFull7290027600007-001-202401010300.xml`.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let caps = FILE_TYPE_PATTERN.captures(file_name)?;
        match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
            "pricefull" => Some(FileType::PriceFullFile),
            "price" => Some(FileType::PriceFile),
            "promofull" => Some(FileType::PromoFullFile),
            "promo" => Some(FileType::PromoFile),
            "store" | "stores" => Some(FileType::StoreFile),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        FileType::ALL
            .into_iter()
            .find(|ft| ft.as_str() == wanted)
            .ok_or_else(|| AppError::config(format!("unknown file type '{s}'")))
    }
}

/// Name of the storage target holding one chain's files of one type.
pub fn target_name(chain: &str, file_type: FileType) -> String {
    format!("{}_{}", file_type.as_str(), chain).to_lowercase()
}

/// Split a target name back into its file type and (lowercased) chain.
pub fn split_target(target: &str) -> Option<(FileType, String)> {
    // Longest prefix first so `price_full_file_x` is not read as `price_file`.
    let mut types = FileType::ALL;
    types.sort_by_key(|ft| std::cmp::Reverse(ft.as_str().len()));
    types.into_iter().find_map(|ft| {
        let prefix = format!("{}_", ft.as_str().to_lowercase());
        target
            .strip_prefix(&prefix)
            .filter(|chain| !chain.is_empty())
            .map(|chain| (ft, chain.to_string()))
    })
}

/// One stored unit of scraped content.
///
/// `(chain, file_type, file_name)` is the natural key; writing the same key
/// again replaces the earlier content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageRecord {
    pub chain: String,
    pub file_type: FileType,
    pub file_name: String,
    pub content: String,
    pub ingested_at: DateTime<Utc>,
}

impl StorageRecord {
    pub fn new(
        chain: impl Into<String>,
        file_type: FileType,
        file_name: impl Into<String>,
        content: impl Into<String>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            chain: chain.into(),
            file_type,
            file_name: file_name.into(),
            content: content.into(),
            ingested_at,
        }
    }

    /// Storage target this record belongs to.
    pub fn target(&self) -> String {
        target_name(&self.chain, self.file_type)
    }

    /// Identifier unique within the record's target.
    pub fn natural_id(&self) -> &str {
        &self.file_name
    }

    /// Ordering key used by every paginated read.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.ingested_at, self.file_name.as_str())
    }

    /// SHA-256 of the raw content, hex encoded.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.content.as_bytes()))
    }

    /// Reject records that cannot be stored under `target`.
    pub fn validate_for(&self, target: &str) -> Result<()> {
        if self.chain.trim().is_empty() {
            return Err(AppError::validation("record has an empty chain"));
        }
        if self.file_name.trim().is_empty() {
            return Err(AppError::validation("record has an empty file name"));
        }
        if self.file_name.contains(['/', '\\']) || self.file_name == ".." {
            return Err(AppError::validation(format!(
                "file name '{}' contains a path separator",
                self.file_name
            )));
        }
        if self.target() != target {
            return Err(AppError::validation(format!(
                "record {} belongs to {}, not {}",
                self.file_name,
                self.target(),
                target
            )));
        }
        Ok(())
    }
}
