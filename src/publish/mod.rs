//! Long-term publishing of daily dataset versions.
//!
//! A version snapshots every record ingested up to the cutoff of one scrape
//! date. The export staged for upload looks like:
//!
//! ```text
//! {export}/v{n}-{date}/
//! ├── index.json                   # version -> scrape date, for every version
//! ├── manifest.json                # DatasetVersion with one entry per record
//! ├── dataset-metadata.json        # title, notes and file descriptions
//! ├── price_full_file_shufersal.csv
//! └── ...
//! ```

pub mod kaggle;
pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{
    Config, DatasetVersion, HostKind, ManifestEntry, StorageRecord, VersionIndex, local_date,
};
use crate::storage::{RecordFilter, RecordStorage, read_all};
use crate::utils::fs::{remove_dir_if_exists, write_atomic, write_json};

// Re-export for convenience
pub use kaggle::KaggleDatasetHost;
pub use local::LocalDatasetHost;

pub const INDEX_FILE: &str = "index.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const METADATA_FILE: &str = "dataset-metadata.json";

/// Remote home of the long-term dataset.
#[async_trait]
pub trait DatasetHost: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current version index; empty when nothing was published yet.
    async fn fetch_index(&self) -> Result<VersionIndex>;

    /// Upload every file in `export_dir` as `version`. All or nothing.
    async fn upload_version(&self, version: &DatasetVersion, export_dir: &Path) -> Result<()>;

    async fn health(&self) -> Result<()>;
}

/// How a publish request ended.
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    Published(DatasetVersion),
    /// The host already holds a version for the scrape date
    AlreadyPublished {
        version: u64,
        scrape_date: NaiveDate,
        cutoff: DateTime<Utc>,
    },
}

impl PublishOutcome {
    pub fn version(&self) -> u64 {
        match self {
            PublishOutcome::Published(v) => v.version,
            PublishOutcome::AlreadyPublished { version, .. } => *version,
        }
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        match self {
            PublishOutcome::Published(v) => v.cutoff,
            PublishOutcome::AlreadyPublished { cutoff, .. } => *cutoff,
        }
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    chain: &'a str,
    file_type: &'static str,
    file_name: &'a str,
    ingested_at: String,
    digest: String,
    content: &'a str,
}

#[derive(Serialize)]
struct Resource {
    path: String,
    description: String,
}

#[derive(Serialize)]
struct DatasetMetadata<'a> {
    title: &'a str,
    version_notes: String,
    resources: Vec<Resource>,
}

/// Snapshots the outputs store into dataset versions.
pub struct LongTermPublisher {
    host: Arc<dyn DatasetHost>,
    source: Arc<dyn RecordStorage>,
    export_root: PathBuf,
    dataset: String,
}

impl LongTermPublisher {
    pub fn new(
        host: Arc<dyn DatasetHost>,
        source: Arc<dyn RecordStorage>,
        export_root: impl Into<PathBuf>,
        dataset: impl Into<String>,
    ) -> Self {
        Self {
            host,
            source,
            export_root: export_root.into(),
            dataset: dataset.into(),
        }
    }

    pub fn host(&self) -> &Arc<dyn DatasetHost> {
        &self.host
    }

    /// Publish the scrape date of `as_of` in `timezone`, at most once per date.
    pub async fn publish(&self, as_of: DateTime<Utc>, timezone: Tz) -> Result<PublishOutcome> {
        let scrape_date = local_date(as_of, timezone);
        let cutoff = cutoff_for(as_of, timezone);
        let mut index = self.host.fetch_index().await?;

        if let Some((version, info)) = index.find_by_date(scrape_date) {
            log::info!(
                "Dataset {} already has version {} for {}",
                self.dataset,
                version,
                scrape_date
            );
            return Ok(PublishOutcome::AlreadyPublished {
                version,
                scrape_date,
                cutoff: info.cutoff,
            });
        }

        let snapshot = self.snapshot(cutoff).await?;
        let record_count: usize = snapshot.values().map(Vec::len).sum();
        if record_count == 0 {
            return Err(AppError::publish(format!(
                "no records ingested up to {cutoff} to publish"
            )));
        }

        let version = DatasetVersion {
            version: index.next_version(),
            scrape_date,
            created_at: Utc::now(),
            cutoff,
            manifest: snapshot
                .values()
                .flatten()
                .map(ManifestEntry::from)
                .collect(),
        };
        index.record(&version);

        let export_dir = self
            .export_root
            .join(format!("v{}-{}", version.version, scrape_date));
        let uploaded = match self.stage(&export_dir, &version, &index, &snapshot).await {
            Ok(()) => self.host.upload_version(&version, &export_dir).await,
            Err(e) => Err(e),
        };
        if let Err(e) = remove_dir_if_exists(&export_dir).await {
            log::warn!("Failed to remove export {}: {}", export_dir.display(), e);
        }
        uploaded?;

        log::info!(
            "Published {} version {} for {} ({} records)",
            self.dataset,
            version.version,
            scrape_date,
            record_count
        );
        Ok(PublishOutcome::Published(version))
    }

    /// Records per target, ingested at or before `cutoff`.
    async fn snapshot(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Vec<StorageRecord>>> {
        let filter = RecordFilter::until(cutoff);
        let mut snapshot = BTreeMap::new();
        for target in self.source.list_targets().await? {
            let records = read_all(self.source.as_ref(), &target, &filter).await?;
            if !records.is_empty() {
                snapshot.insert(target, records);
            }
        }
        Ok(snapshot)
    }

    /// Write CSV exports plus manifest, index and metadata files.
    async fn stage(
        &self,
        export_dir: &Path,
        version: &DatasetVersion,
        index: &VersionIndex,
        snapshot: &BTreeMap<String, Vec<StorageRecord>>,
    ) -> Result<()> {
        remove_dir_if_exists(export_dir).await?;
        tokio::fs::create_dir_all(export_dir).await?;

        let mut resources = vec![
            Resource {
                path: INDEX_FILE.into(),
                description: "Index mapping dataset versions to scrape dates".into(),
            },
            Resource {
                path: MANIFEST_FILE.into(),
                description: "Every record included in this version".into(),
            },
        ];
        for (target, records) in snapshot {
            let file_name = format!("{target}.csv");
            write_atomic(&export_dir.join(&file_name), &to_csv(records)?).await?;
            if let Some(first) = records.first() {
                resources.push(Resource {
                    path: file_name,
                    description: format!(
                        "{} files from type {} published by '{}'",
                        records.len(),
                        first.file_type,
                        first.chain
                    ),
                });
            }
        }

        write_json(&export_dir.join(MANIFEST_FILE), version).await?;
        write_json(&export_dir.join(INDEX_FILE), index).await?;
        let metadata = DatasetMetadata {
            title: &self.dataset,
            version_notes: version_notes(version),
            resources,
        };
        write_json(&export_dir.join(METADATA_FILE), &metadata).await?;
        Ok(())
    }
}

/// Notes attached to an uploaded version.
pub fn version_notes(version: &DatasetVersion) -> String {
    format!(
        "Scrape-Date: {}, Cutoff: {}, Records: {}",
        version.scrape_date,
        version.cutoff.to_rfc3339(),
        version.manifest.len()
    )
}

/// Last instant of `date` in `timezone`, as UTC.
pub fn end_of_day(date: NaiveDate, timezone: Tz) -> DateTime<Utc> {
    let next_midnight = date
        .succ_opt()
        .and_then(|next| next.and_hms_opt(0, 0, 0))
        .and_then(|midnight| timezone.from_local_datetime(&midnight).earliest());
    match next_midnight {
        Some(midnight) => midnight.with_timezone(&Utc) - Duration::nanoseconds(1),
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// min(as_of, last instant of as_of's local calendar date)
pub fn cutoff_for(as_of: DateTime<Utc>, timezone: Tz) -> DateTime<Utc> {
    as_of.min(end_of_day(local_date(as_of, timezone), timezone))
}

fn to_csv(records: &[StorageRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(CsvRow {
            chain: &record.chain,
            file_type: record.file_type.as_str(),
            file_name: &record.file_name,
            ingested_at: record.ingested_at.to_rfc3339(),
            digest: record.digest(),
            content: &record.content,
        })?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::publish(format!("CSV buffer: {e}")))
}

/// Build the configured dataset host.
pub async fn open_host(config: &Config) -> Result<Arc<dyn DatasetHost>> {
    let long_term = &config.long_term;
    match long_term.host {
        HostKind::Local => Ok(Arc::new(LocalDatasetHost::new(
            config.paths.app_data.join(&long_term.local_root),
            &long_term.dataset,
        ))),
        HostKind::Kaggle => Ok(Arc::new(KaggleDatasetHost::new(long_term)?)),
        #[cfg(feature = "s3")]
        HostKind::S3 => Ok(Arc::new(
            s3::S3DatasetHost::from_config(long_term).await?,
        )),
        #[allow(unreachable_patterns)]
        _ => Err(AppError::config(
            "long-term host 's3' is not compiled into this build",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;
    use crate::storage::FileStorage;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Host that fails every upload.
    struct BrokenHost {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl DatasetHost for BrokenHost {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn fetch_index(&self) -> Result<VersionIndex> {
            Ok(VersionIndex::new("test"))
        }

        async fn upload_version(&self, _version: &DatasetVersion, dir: &Path) -> Result<()> {
            assert!(dir.join(MANIFEST_FILE).exists());
            *self.attempts.lock().unwrap() += 1;
            Err(AppError::publish("remote refused"))
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    async fn seeded_outputs(dir: &Path) -> Arc<FileStorage> {
        let outputs = Arc::new(FileStorage::new(dir, 3));
        let records = [
            StorageRecord::new("SHUFERSAL", FileType::PriceFile, "Price1.xml", "<a/>", at(1, 8)),
            StorageRecord::new("SHUFERSAL", FileType::PriceFile, "Price2.xml", "<b/>", at(1, 20)),
        ];
        outputs
            .write_records("price_file_shufersal", &records)
            .await
            .unwrap();
        outputs
    }

    #[test]
    fn test_cutoff_for() {
        assert_eq!(cutoff_for(at(1, 10), chrono_tz::UTC), at(1, 10));

        let date: NaiveDate = "2025-03-05".parse().unwrap();
        assert_eq!(
            end_of_day(date, chrono_tz::UTC),
            at(6, 0) - Duration::nanoseconds(1)
        );
        // Jerusalem is UTC+2 in early March.
        assert_eq!(
            end_of_day(date, chrono_tz::Asia::Jerusalem),
            at(5, 22) - Duration::nanoseconds(1)
        );
        let late = Utc.with_ymd_and_hms(2025, 3, 4, 22, 30, 0).unwrap();
        assert_eq!(cutoff_for(late, chrono_tz::Asia::Jerusalem), late);
    }

    #[tokio::test]
    async fn test_publish_once_per_date() {
        let tmp = TempDir::new().unwrap();
        let outputs = seeded_outputs(&tmp.path().join("outputs")).await;
        let host = Arc::new(LocalDatasetHost::new(tmp.path().join("remote"), "test"));
        let publisher =
            LongTermPublisher::new(host.clone(), outputs, tmp.path().join("export"), "test");

        let first = publisher.publish(at(1, 12), chrono_tz::UTC).await.unwrap();
        let PublishOutcome::Published(version) = &first else {
            panic!("expected a new version");
        };
        assert_eq!(version.version, 1);
        // Only Price1 was ingested before the cutoff.
        assert_eq!(version.manifest.len(), 1);
        assert_eq!(version.manifest[0].file_name, "Price1.xml");

        let second = publisher.publish(at(1, 23), chrono_tz::UTC).await.unwrap();
        assert!(matches!(
            second,
            PublishOutcome::AlreadyPublished { version: 1, .. }
        ));
        assert_eq!(host.fetch_index().await.unwrap().versions.len(), 1);

        assert!(!tmp.path().join("export/v1-2025-03-01").exists());
    }

    #[tokio::test]
    async fn test_scrape_date_is_local() {
        let tmp = TempDir::new().unwrap();
        let outputs = seeded_outputs(&tmp.path().join("outputs")).await;
        let host = Arc::new(LocalDatasetHost::new(tmp.path().join("remote"), "test"));
        let publisher =
            LongTermPublisher::new(host.clone(), outputs, tmp.path().join("export"), "test");

        // 00:30 on March 5th in Jerusalem.
        let as_of = Utc.with_ymd_and_hms(2025, 3, 4, 22, 30, 0).unwrap();
        let outcome = publisher
            .publish(as_of, chrono_tz::Asia::Jerusalem)
            .await
            .unwrap();
        let PublishOutcome::Published(version) = outcome else {
            panic!("expected a new version");
        };
        assert_eq!(version.scrape_date, "2025-03-05".parse::<NaiveDate>().unwrap());
        assert_eq!(version.cutoff, as_of);

        let index = host.fetch_index().await.unwrap();
        assert!(index.find_by_date("2025-03-05".parse().unwrap()).is_some());
        assert!(index.find_by_date("2025-03-04".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_version() {
        let tmp = TempDir::new().unwrap();
        let outputs = seeded_outputs(&tmp.path().join("outputs")).await;
        let host = Arc::new(BrokenHost {
            attempts: Mutex::new(0),
        });
        let publisher =
            LongTermPublisher::new(host.clone(), outputs, tmp.path().join("export"), "test");

        let err = publisher.publish(at(1, 22), chrono_tz::UTC).await.unwrap_err();
        assert!(matches!(err, AppError::Publish(_)));
        assert_eq!(*host.attempts.lock().unwrap(), 1);
        assert!(!tmp.path().join("export/v1-2025-03-01").exists());
    }

    #[tokio::test]
    async fn test_publish_with_no_records_fails() {
        let tmp = TempDir::new().unwrap();
        let outputs = Arc::new(FileStorage::new(tmp.path().join("outputs"), 3));
        let host = Arc::new(LocalDatasetHost::new(tmp.path().join("remote"), "test"));
        let publisher = LongTermPublisher::new(host, outputs, tmp.path().join("export"), "test");

        assert!(publisher.publish(at(2, 12), chrono_tz::UTC).await.is_err());
    }

    #[test]
    fn test_csv_export_has_header() {
        let records = [StorageRecord::new(
            "VICTORY",
            FileType::StoreFile,
            "Stores1.xml",
            "a,b\n\"c\"",
            at(1, 1),
        )];
        let bytes = to_csv(&records).unwrap();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "chain");
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[5], "a,b\n\"c\"");
    }
}
