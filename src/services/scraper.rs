//! Scraper collaborator.
//!
//! The scraper itself is external: it downloads a chain's feed files into a
//! dump folder. This module only defines the call boundary and a command-line
//! implementation of it.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{FileType, ScrapingConfig};
use crate::utils::fs::list_files;

/// What to fetch for one chain.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub chain: String,
    pub file_types: Vec<FileType>,
    pub limit: Option<usize>,
    /// Folder the chain's files must land in
    pub dump_dir: PathBuf,
    pub as_of: DateTime<Utc>,
}

/// Fetches feed files for one chain.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Download into `request.dump_dir`; returns the files now staged there.
    async fn scrape(&self, request: &ScrapeRequest) -> Result<Vec<PathBuf>>;
}

/// Runs an external scraper executable once per chain.
///
/// Invoked as `{command} {args..} --chain X --file-types A,B --output DIR
/// [--limit N] --when RFC3339`.
pub struct CommandScraper {
    command: String,
    args: Vec<String>,
}

impl CommandScraper {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &ScrapingConfig) -> Self {
        Self::new(&config.command, config.args.clone())
    }

    fn arguments(&self, request: &ScrapeRequest) -> Vec<String> {
        let file_types = request
            .file_types
            .iter()
            .map(FileType::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let mut args = self.args.clone();
        args.extend([
            "--chain".to_string(),
            request.chain.clone(),
            "--file-types".to_string(),
            file_types,
            "--output".to_string(),
            request.dump_dir.display().to_string(),
        ]);
        if let Some(limit) = request.limit {
            args.extend(["--limit".to_string(), limit.to_string()]);
        }
        args.extend(["--when".to_string(), request.as_of.to_rfc3339()]);
        args
    }
}

#[async_trait]
impl Scraper for CommandScraper {
    async fn scrape(&self, request: &ScrapeRequest) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&request.dump_dir).await?;

        let output = tokio::process::Command::new(&self.command)
            .args(self.arguments(request))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AppError::fetch(&request.chain, format!("{}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::fetch(
                &request.chain,
                format!("scraper exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let files = list_files(&request.dump_dir).await?;
        log::debug!("{} has {} staged files", request.chain, files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: PathBuf) -> ScrapeRequest {
        ScrapeRequest {
            chain: "SHUFERSAL".into(),
            file_types: vec![FileType::PriceFile, FileType::StoreFile],
            limit: Some(5),
            dump_dir: dir,
            as_of: Utc::now(),
        }
    }

    #[test]
    fn test_arguments() {
        let scraper = CommandScraper::new("scrape", vec!["--quiet".into()]);
        let args = scraper.arguments(&request(PathBuf::from("/tmp/d")));
        assert_eq!(args[0], "--quiet");
        assert!(args.windows(2).any(|w| w == ["--chain", "SHUFERSAL"]));
        assert!(args.windows(2).any(|w| w == ["--file-types", "PRICE_FILE,STORE_FILE"]));
        assert!(args.windows(2).any(|w| w == ["--limit", "5"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_fetch_error() {
        let tmp = TempDir::new().unwrap();
        let scraper = CommandScraper::new("false", Vec::new());
        let err = scraper
            .scrape(&request(tmp.path().join("SHUFERSAL")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Fetch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_command_is_fetch_error() {
        let tmp = TempDir::new().unwrap();
        let scraper = CommandScraper::new("/definitely/not/a/scraper", Vec::new());
        assert!(scraper
            .scrape(&request(tmp.path().join("SHUFERSAL")))
            .await
            .is_err());
    }
}
