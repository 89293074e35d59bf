//! Application configuration structures.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{FileType, Operation};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local folders and state files
    #[serde(default)]
    pub paths: PathsConfig,

    /// Scraper collaborator settings
    #[serde(default)]
    pub scraping: ScrapingConfig,

    /// Cycle loop policy
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Short-term store selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Long-term dataset host
    #[serde(default)]
    pub long_term: LongTermConfig,

    /// Liveness check thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.scraping.workers == 0 {
            return Err(AppError::validation("scraping.workers must be > 0"));
        }
        if self.scraping.file_limit == Some(0) {
            return Err(AppError::validation("scraping.file_limit must be > 0"));
        }
        if self.storage.max_write_attempts == 0 {
            return Err(AppError::validation(
                "storage.max_write_attempts must be > 0",
            ));
        }
        if self.long_term.dataset.trim().is_empty() {
            return Err(AppError::validation("long_term.dataset is empty"));
        }
        if let Some(ops) = &self.schedule.operations {
            if ops.is_empty() {
                return Err(AppError::validation(
                    "schedule.operations must name at least one operation",
                ));
            }
        }
        match self.storage.destination {
            Destination::Kafka if self.storage.kafka_brokers.trim().is_empty() => {
                return Err(AppError::validation("storage.kafka_brokers is empty"));
            }
            Destination::Mongo if self.storage.mongo_uri.trim().is_empty() => {
                return Err(AppError::validation("storage.mongo_uri is empty"));
            }
            _ => {}
        }
        if self.long_term.host == HostKind::Kaggle {
            if self.long_term.kaggle_owner.trim().is_empty() {
                return Err(AppError::validation("long_term.kaggle_owner is empty"));
            }
            if self.long_term.kaggle_username.is_empty() || self.long_term.kaggle_key.is_empty()
            {
                return Err(AppError::validation(
                    "long_term.kaggle_username and long_term.kaggle_key are required",
                ));
            }
        }
        if self.long_term.host == HostKind::S3 && self.long_term.s3_bucket.trim().is_empty() {
            return Err(AppError::validation("long_term.s3_bucket is empty"));
        }
        Ok(())
    }

    /// Chains to scrape; an empty list means every known chain.
    pub fn chains(&self) -> Vec<String> {
        if self.scraping.enabled_chains.is_empty() {
            defaults::known_chains()
        } else {
            self.scraping.enabled_chains.clone()
        }
    }

    /// File types to scrape; an empty list means all of them.
    pub fn file_types(&self) -> Vec<FileType> {
        if self.scraping.enabled_file_types.is_empty() {
            FileType::ALL.to_vec()
        } else {
            self.scraping.enabled_file_types.clone()
        }
    }

    /// Operations run on every cycle.
    pub fn cycle_operations(&self) -> BTreeSet<Operation> {
        match &self.schedule.operations {
            Some(ops) => ops.iter().copied().collect(),
            None => Operation::ongoing(),
        }
    }
}

/// Local folders, all rooted at `app_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "defaults::app_data")]
    pub app_data: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            app_data: defaults::app_data(),
        }
    }
}

impl PathsConfig {
    /// Raw files staged by the scraper, one folder per chain.
    pub fn dumps_dir(&self) -> PathBuf {
        self.app_data.join("dumps")
    }

    /// Staged files that can never be converted, one folder per chain.
    pub fn rejected_dir(&self) -> PathBuf {
        self.app_data.join("rejected")
    }

    /// Converted records mirrored for publishing.
    pub fn outputs_dir(&self) -> PathBuf {
        self.app_data.join("outputs")
    }

    /// Short-term store root for the flat-file destination.
    pub fn short_term_dir(&self) -> PathBuf {
        self.app_data.join("short_term")
    }

    /// Scratch folder for dataset exports.
    pub fn export_dir(&self) -> PathBuf {
        self.app_data.join("export")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.app_data.join("heartbeat.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.app_data.join("state.json")
    }

    pub fn chain_index_file(&self) -> PathBuf {
        self.app_data.join("chain_index.json")
    }
}

/// Scraper collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// Chains to scrape (empty: all known chains)
    #[serde(default)]
    pub enabled_chains: Vec<String>,

    /// File types to scrape (empty: all)
    #[serde(default)]
    pub enabled_file_types: Vec<FileType>,

    /// Maximum files fetched per chain
    #[serde(default)]
    pub file_limit: Option<usize>,

    /// Chains scraped or converted in parallel
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// External scraper executable
    #[serde(default = "defaults::scraper_command")]
    pub command: String,

    /// Extra arguments passed before the generated ones
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            enabled_chains: Vec::new(),
            enabled_file_types: Vec::new(),
            file_limit: None,
            workers: defaults::workers(),
            command: defaults::scraper_command(),
            args: Vec::new(),
        }
    }
}

/// When the end-of-day operations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCondition {
    #[serde(rename = "NEVER")]
    Never,
    #[serde(rename = "EOD")]
    EndOfDay,
}

impl FromStr for StopCondition {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEVER" => Ok(StopCondition::Never),
            "EOD" | "END_OF_DAY" => Ok(StopCondition::EndOfDay),
            other => Err(AppError::config(format!("invalid stop condition '{other}'"))),
        }
    }
}

/// Whether the loop keeps going after the first cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatPolicy {
    #[serde(rename = "FOREVER", alias = "NEVER")]
    Forever,
    #[serde(rename = "ONCE")]
    Once,
}

impl FromStr for RepeatPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        // "NEVER" is accepted for deployments that set REPEAT=NEVER (never stop).
        match s.trim().to_ascii_uppercase().as_str() {
            "FOREVER" | "NEVER" => Ok(RepeatPolicy::Forever),
            "ONCE" => Ok(RepeatPolicy::Once),
            other => Err(AppError::config(format!("invalid repeat policy '{other}'"))),
        }
    }
}

/// Cycle loop policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds to sleep between cycles
    #[serde(default = "defaults::wait_secs")]
    pub wait_secs: u64,

    #[serde(default = "defaults::stop")]
    pub stop: StopCondition,

    #[serde(default = "defaults::repeat")]
    pub repeat: RepeatPolicy,

    /// Replaces the ongoing operation subset
    #[serde(default)]
    pub operations: Option<Vec<Operation>>,

    /// Fixed "now" for deterministic replays
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,

    /// Zone whose calendar decides scrape dates and cutoffs
    #[serde(default = "defaults::timezone")]
    pub timezone: Tz,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            wait_secs: defaults::wait_secs(),
            stop: defaults::stop(),
            repeat: defaults::repeat(),
            operations: None,
            as_of: None,
            timezone: defaults::timezone(),
        }
    }
}

impl ScheduleConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

/// Short-term backend choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Mongo,
    Kafka,
    File,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Destination::Mongo => "mongo",
            Destination::Kafka => "kafka",
            Destination::File => "file",
        };
        f.write_str(name)
    }
}

impl FromStr for Destination {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongo" => Ok(Destination::Mongo),
            "kafka" => Ok(Destination::Kafka),
            "file" => Ok(Destination::File),
            other => Err(AppError::config(format!(
                "invalid output destination '{other}'"
            ))),
        }
    }
}

/// Short-term store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::destination")]
    pub destination: Destination,

    /// Attempts per record before it is dropped
    #[serde(default = "defaults::max_write_attempts")]
    pub max_write_attempts: u32,

    #[serde(default = "defaults::mongo_uri")]
    pub mongo_uri: String,

    #[serde(default = "defaults::mongo_database")]
    pub mongo_database: String,

    #[serde(default = "defaults::kafka_brokers")]
    pub kafka_brokers: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            destination: defaults::destination(),
            max_write_attempts: defaults::max_write_attempts(),
            mongo_uri: defaults::mongo_uri(),
            mongo_database: defaults::mongo_database(),
            kafka_brokers: defaults::kafka_brokers(),
        }
    }
}

/// Long-term host choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Local,
    Kaggle,
    S3,
}

impl FromStr for HostKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(HostKind::Local),
            "kaggle" => Ok(HostKind::Kaggle),
            "s3" => Ok(HostKind::S3),
            other => Err(AppError::config(format!("invalid long-term host '{other}'"))),
        }
    }
}

/// Long-term dataset host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermConfig {
    #[serde(default = "defaults::host")]
    pub host: HostKind,

    /// Remote dataset name
    #[serde(default = "defaults::dataset")]
    pub dataset: String,

    /// Root folder for the local host; relative paths sit under `app_data`
    #[serde(default = "defaults::local_root")]
    pub local_root: PathBuf,

    #[serde(default)]
    pub kaggle_owner: String,

    #[serde(default)]
    pub kaggle_username: String,

    #[serde(default)]
    pub kaggle_key: String,

    #[serde(default = "defaults::kaggle_api_base")]
    pub kaggle_api_base: String,

    #[serde(default)]
    pub s3_bucket: String,

    #[serde(default = "defaults::s3_prefix")]
    pub s3_prefix: String,
}

impl Default for LongTermConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            dataset: defaults::dataset(),
            local_root: defaults::local_root(),
            kaggle_owner: String::new(),
            kaggle_username: String::new(),
            kaggle_key: String::new(),
            kaggle_api_base: defaults::kaggle_api_base(),
            s3_bucket: String::new(),
            s3_prefix: defaults::s3_prefix(),
        }
    }
}

/// Liveness check thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heartbeat older than this is unhealthy
    #[serde(default = "defaults::max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_age_secs: defaults::max_age_secs(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// Parse an "as-of" timestamp.
///
/// Accepts RFC 3339 (`2025-01-01T10:00:00Z`, `...+02:00`), a naive
/// `YYYY-MM-DDTHH:MM:SS` / `YYYY-MM-DD HH:MM:SS` or a bare date (midnight).
/// Naive values are local time in `timezone`.
pub fn parse_as_of(raw: &str, timezone: Tz) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| AppError::config(format!("invalid as-of timestamp '{raw}'")))?;

    // Ambiguous local times (clocks going back) take the earlier instant.
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            AppError::config(format!("as-of '{raw}' does not exist in {timezone}"))
        })
}

pub(crate) mod defaults {
    use std::path::PathBuf;

    use super::{Destination, HostKind, RepeatPolicy, StopCondition};

    // Paths
    pub fn app_data() -> PathBuf {
        PathBuf::from("app_data")
    }

    // Scraping
    pub fn workers() -> usize {
        5
    }
    pub fn scraper_command() -> String {
        "il-supermarket-scraper".into()
    }
    pub fn known_chains() -> Vec<String> {
        [
            "BAREKET",
            "CITY_MARKET_SHOPS",
            "HAZI_HINAM",
            "KING_STORE",
            "MEGA",
            "OSHER_AD",
            "RAMI_LEVY",
            "SALACH_DABACH",
            "SHUFERSAL",
            "SUPER_PHARM",
            "TIV_TAAM",
            "VICTORY",
            "YAYNO_BITAN_AND_CARREFOUR",
            "YOHANANOF",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    // Schedule
    pub fn wait_secs() -> u64 {
        30 * 60
    }
    pub fn stop() -> StopCondition {
        StopCondition::EndOfDay
    }
    pub fn repeat() -> RepeatPolicy {
        RepeatPolicy::Forever
    }
    pub fn timezone() -> chrono_tz::Tz {
        chrono_tz::Asia::Jerusalem
    }

    // Storage
    pub fn destination() -> Destination {
        Destination::File
    }
    pub fn max_write_attempts() -> u32 {
        3
    }
    pub fn mongo_uri() -> String {
        "mongodb://localhost:27017".into()
    }
    pub fn mongo_database() -> String {
        "supermarket_data".into()
    }
    pub fn kafka_brokers() -> String {
        "localhost:9092".into()
    }

    // Long-term
    pub fn host() -> HostKind {
        HostKind::Local
    }
    pub fn dataset() -> String {
        "israeli-supermarkets-2024".into()
    }
    pub fn local_root() -> PathBuf {
        PathBuf::from("long_term")
    }
    pub fn kaggle_api_base() -> String {
        "https://www.kaggle.com/api/v1".into()
    }
    pub fn s3_prefix() -> String {
        "datasets".into()
    }

    // Health
    pub fn max_age_secs() -> u64 {
        300
    }

    // Logging
    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.schedule.stop, StopCondition::EndOfDay);
        assert_eq!(config.schedule.repeat, RepeatPolicy::Forever);
        assert_eq!(config.cycle_operations(), Operation::ongoing());
        assert!(!config.chains().is_empty());
    }

    #[test]
    fn test_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [scraping]
            enabled_chains = ["SHUFERSAL"]
            enabled_file_types = ["PRICE_FULL_FILE"]
            workers = 2

            [schedule]
            stop = "NEVER"
            repeat = "ONCE"
            operations = ["converting", "scraping"]

            [storage]
            destination = "kafka"
            "#,
        )
        .unwrap();

        assert_eq!(config.chains(), vec!["SHUFERSAL".to_string()]);
        assert_eq!(config.file_types(), vec![FileType::PriceFullFile]);
        assert_eq!(config.schedule.repeat, RepeatPolicy::Once);
        assert_eq!(config.storage.destination, Destination::Kafka);
        let ops: Vec<_> = config.cycle_operations().into_iter().collect();
        assert_eq!(ops, vec![Operation::Scraping, Operation::Converting]);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.scraping.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_kaggle_needs_credentials() {
        let mut config = Config::default();
        config.long_term.host = HostKind::Kaggle;
        config.long_term.kaggle_owner = "someone".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_as_of() {
        let utc = parse_as_of("2025-03-01T10:00:00Z", chrono_tz::UTC).unwrap();
        assert_eq!(utc.to_rfc3339(), "2025-03-01T10:00:00+00:00");

        let offset = parse_as_of("2025-03-01T10:00:00+02:00", chrono_tz::UTC).unwrap();
        assert_eq!(offset.to_rfc3339(), "2025-03-01T08:00:00+00:00");

        let naive = parse_as_of("2025-03-01 10:00:00", chrono_tz::UTC).unwrap();
        assert_eq!(naive, utc);

        let date = parse_as_of("2025-03-01", chrono_tz::UTC).unwrap();
        assert_eq!(date.to_rfc3339(), "2025-03-01T00:00:00+00:00");

        assert!(parse_as_of("yesterday", chrono_tz::UTC).is_err());
    }

    #[test]
    fn test_naive_as_of_is_local_time() {
        let jerusalem = chrono_tz::Asia::Jerusalem;

        // Winter, UTC+2.
        let winter = parse_as_of("2025-03-05T00:30:00", jerusalem).unwrap();
        assert_eq!(winter.to_rfc3339(), "2025-03-04T22:30:00+00:00");

        // Summer, UTC+3.
        let summer = parse_as_of("2025-07-01", jerusalem).unwrap();
        assert_eq!(summer.to_rfc3339(), "2025-06-30T21:00:00+00:00");

        // Explicit offsets are kept as given.
        let explicit = parse_as_of("2025-03-05T00:30:00+02:00", jerusalem).unwrap();
        assert_eq!(explicit, winter);
    }

    #[test]
    fn test_timezone_from_toml() {
        let config: Config =
            toml::from_str("[schedule]\ntimezone = \"Europe/London\"\n").unwrap();
        assert_eq!(config.schedule.timezone, chrono_tz::Europe::London);
        assert_eq!(Config::default().schedule.timezone, chrono_tz::Asia::Jerusalem);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("eod".parse::<StopCondition>().unwrap(), StopCondition::EndOfDay);
        assert_eq!("NEVER".parse::<RepeatPolicy>().unwrap(), RepeatPolicy::Forever);
        assert!("SOMETIMES".parse::<RepeatPolicy>().is_err());
    }
}
