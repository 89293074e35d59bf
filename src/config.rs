// src/config.rs

//! Configuration loading utilities.
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual fields. Anything invalid is a fatal error raised
//! before the first cycle starts.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::{Config, FileType, Operation, parse_as_of};

/// Environment lookup, swappable in tests.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl EnvSource for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::HashMap::get(self, key).cloned()
    }
}

/// Load the configuration file (if any), apply environment overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    load_config_with(path, &ProcessEnv)
}

pub fn load_config_with(path: Option<&Path>, env: &dyn EnvSource) -> Result<Config> {
    let mut config = match path {
        Some(path) if path.exists() => {
            log::info!("Loading configuration from {}", path.display());
            Config::load(path)?
        }
        Some(path) => {
            log::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            Config::default()
        }
        None => Config::default(),
    };

    apply_env(&mut config, env)?;
    config.validate()?;
    check_destination_compiled(&config)?;
    Ok(config)
}

/// Override config fields from environment variables.
pub fn apply_env(config: &mut Config, env: &dyn EnvSource) -> Result<()> {
    if let Some(path) = env.get("APP_DATA_PATH") {
        config.paths.app_data = PathBuf::from(path);
    }

    // Scraping
    if let Some(list) = env.get("ENABLED_SCRAPERS") {
        config.scraping.enabled_chains = split_list(&list)
            .map(|s| s.to_ascii_uppercase())
            .collect();
    }
    if let Some(list) = env.get("ENABLED_FILE_TYPES") {
        config.scraping.enabled_file_types = split_list(&list)
            .map(|s| s.parse::<FileType>())
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(limit) = env.get("LIMIT") {
        config.scraping.file_limit = Some(parse_number("LIMIT", &limit)?);
    }
    if let Some(workers) = env.get("NUM_OF_PROCESSES") {
        config.scraping.workers = parse_number("NUM_OF_PROCESSES", &workers)?;
    }
    if let Some(command) = env.get("SCRAPER_COMMAND") {
        config.scraping.command = command;
    }

    // Schedule
    if let Some(wait) = env.get("WAIT_TIME_SECONDS") {
        config.schedule.wait_secs = parse_number("WAIT_TIME_SECONDS", &wait)?;
    }
    if let Some(stop) = env.get("STOP") {
        config.schedule.stop = stop.parse()?;
    }
    if let Some(repeat) = env.get("REPEAT") {
        config.schedule.repeat = repeat.parse()?;
    }
    if let Some(ops) = env.get("OPERATIONS") {
        let ops = Operation::parse_list(&ops)?;
        if ops.is_empty() {
            return Err(AppError::config("OPERATIONS names no operation"));
        }
        config.schedule.operations = Some(ops.into_iter().collect());
    }
    if let Some(zone) = env.get("TIMEZONE") {
        config.schedule.timezone = zone
            .trim()
            .parse()
            .map_err(|e| AppError::config(format!("invalid TIMEZONE '{zone}': {e}")))?;
    }
    if let Some(when) = env.get("WHEN") {
        config.schedule.as_of = Some(parse_as_of(&when, config.schedule.timezone)?);
    }

    // Storage
    if let Some(destination) = env.get("OUTPUT_DESTINATION") {
        config.storage.destination = destination.parse()?;
    }
    if let Some(uri) = env.get("MONGODB_URI") {
        config.storage.mongo_uri = uri;
    }
    if let Some(brokers) = env.get("KAFKA_BOOTSTRAP_SERVERS") {
        config.storage.kafka_brokers = brokers;
    }

    // Long-term
    if let Some(host) = env.get("LONG_TERM_HOST") {
        config.long_term.host = host.parse()?;
    }
    if let Some(name) = env.get("KAGGLE_DATASET_REMOTE_NAME") {
        config.long_term.dataset = name;
    }
    if let Some(owner) = env.get("KAGGLE_OWNER") {
        config.long_term.kaggle_owner = owner;
    }
    if let Some(user) = env.get("KAGGLE_USERNAME") {
        config.long_term.kaggle_username = user;
    }
    if let Some(key) = env.get("KAGGLE_KEY") {
        config.long_term.kaggle_key = key;
    }
    if let Some(bucket) = env.get("S3_BUCKET") {
        config.long_term.s3_bucket = bucket;
    }

    if let Some(age) = env.get("HEALTHCHECK_MAX_AGE_SECONDS") {
        config.health.max_age_secs = parse_number("HEALTHCHECK_MAX_AGE_SECONDS", &age)?;
    }

    Ok(())
}

/// Mongo and Kafka need their cargo features.
fn check_destination_compiled(config: &Config) -> Result<()> {
    use crate::models::{Destination, HostKind};

    let missing = match config.storage.destination {
        Destination::Mongo if !cfg!(feature = "mongo") => Some("mongo"),
        Destination::Kafka if !cfg!(feature = "kafka") => Some("kafka"),
        _ => None,
    };
    if let Some(feature) = missing {
        return Err(AppError::config(format!(
            "output destination '{}' requires building with --features {}",
            config.storage.destination, feature
        )));
    }
    if config.long_term.host == HostKind::S3 && !cfg!(feature = "s3") {
        return Err(AppError::config(
            "long-term host 's3' requires building with --features s3",
        ));
    }
    Ok(())
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::config(format!("{key} must be a number, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::models::{RepeatPolicy, StopCondition};

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("ENABLED_SCRAPERS", "shufersal, victory"),
            ("ENABLED_FILE_TYPES", "PRICE_FULL_FILE"),
            ("NUM_OF_PROCESSES", "2"),
            ("LIMIT", "10"),
            ("STOP", "NEVER"),
            ("REPEAT", "ONCE"),
            ("OPERATIONS", "converting,scraping"),
            ("WHEN", "2025-02-01T12:00:00Z"),
        ]);
        let config = load_config_with(None, &vars).unwrap();

        assert_eq!(config.chains(), vec!["SHUFERSAL", "VICTORY"]);
        assert_eq!(config.file_types(), vec![FileType::PriceFullFile]);
        assert_eq!(config.scraping.workers, 2);
        assert_eq!(config.scraping.file_limit, Some(10));
        assert_eq!(config.schedule.stop, StopCondition::Never);
        assert_eq!(config.schedule.repeat, RepeatPolicy::Once);
        assert_eq!(
            config.schedule.operations,
            Some(vec![Operation::Scraping, Operation::Converting])
        );
        assert!(config.schedule.as_of.is_some());
    }

    #[test]
    fn test_invalid_operation_is_fatal() {
        let vars = env(&[("OPERATIONS", "scraping,teleporting")]);
        assert!(matches!(
            load_config_with(None, &vars),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_naive_when_uses_configured_timezone() {
        let vars = env(&[("WHEN", "2025-03-05 00:30:00")]);
        let config = load_config_with(None, &vars).unwrap();
        let as_of = config.schedule.as_of.unwrap();
        assert_eq!(as_of.to_rfc3339(), "2025-03-04T22:30:00+00:00");

        let vars = env(&[("TIMEZONE", "UTC"), ("WHEN", "2025-03-05 00:30:00")]);
        let config = load_config_with(None, &vars).unwrap();
        let as_of = config.schedule.as_of.unwrap();
        assert_eq!(as_of.to_rfc3339(), "2025-03-05T00:30:00+00:00");

        let vars = env(&[("TIMEZONE", "Mars/Olympus")]);
        assert!(matches!(
            load_config_with(None, &vars),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_number_is_fatal() {
        let vars = env(&[("NUM_OF_PROCESSES", "many")]);
        assert!(load_config_with(None, &vars).is_err());
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[schedule]\nwait_secs = 5\nrepeat = \"ONCE\"\n").unwrap();

        let vars = env(&[("WAIT_TIME_SECONDS", "7")]);
        let config = load_config_with(Some(&path), &vars).unwrap();
        assert_eq!(config.schedule.wait_secs, 7);
        assert_eq!(config.schedule.repeat, RepeatPolicy::Once);
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_kafka_without_feature_is_fatal() {
        let vars = env(&[("OUTPUT_DESTINATION", "kafka")]);
        assert!(load_config_with(None, &vars).is_err());
    }
}
