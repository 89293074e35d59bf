//! Operation graph: runs one cycle's operations in their fixed order.
//!
//! Precedence is `scraping → converting → api_update → clean_dump_files →
//! publishing → clean_all_source_data` no matter how the subset was
//! requested. Failures are absorbed into the cycle's reports; nothing here
//! returns an error to the scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, FailureKind, Result};
use crate::heartbeat::HeartbeatRecorder;
use crate::models::{
    Config, Cycle, FileType, Operation, OperationFailure, OperationReport, OperationStatus,
    StorageRecord, target_name,
};
use crate::pipeline::index::build_chain_index;
use crate::pipeline::state::{ConvertedFile, PipelineState, PublishMark, StateStore};
use crate::publish::{LongTermPublisher, PublishOutcome};
use crate::services::{ScrapeRequest, Scraper};
use crate::storage::{FileStorage, RecordStorage};
use crate::utils::fs::{list_files, write_json};
use crate::utils::log as banner;

/// Everything the operations act on.
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub scraper: Arc<dyn Scraper>,
    /// Configured short-term destination
    pub short_term: Arc<dyn RecordStorage>,
    /// Local mirror of converted records, snapshotted by the publisher
    pub outputs: Arc<FileStorage>,
    pub publisher: LongTermPublisher,
    pub state: StateStore,
    pub heartbeat: Arc<HeartbeatRecorder>,
    pub cancel: CancellationToken,
}

/// A raw file waiting in the dump folder.
#[derive(Debug, Clone)]
struct StagedFile {
    chain: String,
    file_name: String,
    path: PathBuf,
}

/// Outcome of converting one chain's staged files.
#[derive(Default)]
struct ChainConversion {
    attempted: usize,
    written: usize,
    converted: Vec<ConvertedFile>,
    failures: Vec<OperationFailure>,
}

pub struct OperationGraph {
    ctx: PipelineContext,
}

impl OperationGraph {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run every requested operation of `cycle` in precedence order.
    pub async fn run(&self, cycle: &mut Cycle) {
        let mut state = match self.ctx.state.load().await {
            Ok(state) => state,
            Err(e) => {
                log::error!(
                    "Pipeline state {} unreadable, starting fresh: {}",
                    self.ctx.state.path().display(),
                    e
                );
                PipelineState::default()
            }
        };

        let requested: Vec<Operation> = cycle.operations.iter().copied().collect();
        for (n, operation) in requested.iter().copied().enumerate() {
            banner::step(n + 1, requested.len(), operation.as_str());

            let report = match self.precondition(operation, cycle, &state) {
                Some(reason) => OperationReport::skipped(operation, reason),
                None => {
                    if let Err(e) = self.ctx.heartbeat.start_operation(cycle, operation).await {
                        log::warn!("Heartbeat write failed: {}", e);
                    }
                    self.execute(operation, cycle, &mut state).await
                }
            };

            match &report.status {
                OperationStatus::Skipped(reason) => {
                    log::info!("Skipped {}: {}", operation, reason)
                }
                status => {
                    log::info!(
                        "{} finished: {:?} ({} failures)",
                        operation,
                        status,
                        report.failures.len()
                    );
                    for failure in &report.failures {
                        log::warn!(
                            "  {} failure on {}: {}",
                            failure.kind,
                            failure.scope,
                            failure.message
                        );
                    }
                    if let Err(e) = self.ctx.heartbeat.record_operation(cycle, &report).await {
                        log::warn!("Heartbeat write failed: {}", e);
                    }
                }
            }
            cycle.reports.push(report);
        }
    }

    /// Why `operation` cannot run now, if it cannot.
    fn precondition(
        &self,
        operation: Operation,
        cycle: &Cycle,
        state: &PipelineState,
    ) -> Option<String> {
        if self.ctx.cancel.is_cancelled() {
            return Some("shutdown requested".into());
        }
        match operation {
            Operation::Publishing if !state.converted_since_publish => {
                Some("nothing converted since the last publish".into())
            }
            Operation::CleanAllSourceData if state.published_on(cycle.scrape_date()).is_none() => {
                Some(format!("no successful publish for {}", cycle.scrape_date()))
            }
            _ => None,
        }
    }

    async fn execute(
        &self,
        operation: Operation,
        cycle: &Cycle,
        state: &mut PipelineState,
    ) -> OperationReport {
        let report = match operation {
            Operation::Scraping => self.scraping(cycle).await,
            Operation::Converting => self.converting(cycle, state).await,
            Operation::ApiUpdate => self.api_update(cycle).await,
            Operation::CleanDumpFiles => self.clean_dump_files(state).await,
            Operation::Publishing => self.publishing(cycle, state).await,
            Operation::CleanAllSourceData => self.clean_all_source_data(state).await,
        };
        if matches!(
            operation,
            Operation::Converting | Operation::Publishing | Operation::CleanAllSourceData
        ) {
            if let Err(e) = self.ctx.state.save(state).await {
                log::error!("Failed to save pipeline state: {}", e);
            }
        }
        report
    }

    fn workers(&self) -> usize {
        self.ctx.config.scraping.workers.max(1)
    }

    fn chain_dump_dir(&self, chain: &str) -> PathBuf {
        self.ctx.config.paths.dumps_dir().join(chain)
    }

    async fn scraping(&self, cycle: &Cycle) -> OperationReport {
        let chains = self.ctx.config.chains();
        let file_types = self.ctx.config.file_types();
        let limit = self.ctx.config.scraping.file_limit;

        let results: Vec<(String, Option<Result<Vec<PathBuf>>>)> = stream::iter(chains)
            .map(|chain| {
                let request = ScrapeRequest {
                    dump_dir: self.chain_dump_dir(&chain),
                    chain: chain.clone(),
                    file_types: file_types.clone(),
                    limit,
                    as_of: cycle.as_of,
                };
                async move {
                    // No new chains once shutdown is requested.
                    if self.ctx.cancel.is_cancelled() {
                        return (chain, None);
                    }
                    log::info!("Scraping {}", chain);
                    let result = self.ctx.scraper.scrape(&request).await;
                    (chain, Some(result))
                }
            })
            .buffer_unordered(self.workers())
            .collect()
            .await;

        let mut started = 0;
        let mut failures = Vec::new();
        for (chain, result) in results {
            match result {
                None => log::info!("Not scraping {}: shutdown requested", chain),
                Some(Ok(files)) => {
                    started += 1;
                    log::info!("{}: {} files staged", chain, files.len());
                }
                Some(Err(e)) => {
                    started += 1;
                    failures.push(OperationFailure::new(FailureKind::Fetch, chain, e));
                }
            }
        }
        if started == 0 && self.ctx.cancel.is_cancelled() {
            return OperationReport::skipped(Operation::Scraping, "shutdown requested");
        }
        OperationReport::from_failures(Operation::Scraping, started, failures)
    }

    async fn converting(&self, cycle: &Cycle, state: &mut PipelineState) -> OperationReport {
        let staged = match staged_files(&self.ctx.config.paths.dumps_dir()).await {
            Ok(staged) => staged,
            Err(e) => {
                return OperationReport::failed(
                    Operation::Converting,
                    OperationFailure::new(FailureKind::Conversion, "dumps", e),
                );
            }
        };

        let mut by_chain: BTreeMap<String, Vec<StagedFile>> = BTreeMap::new();
        for file in staged {
            // Idempotent by file name.
            if state.is_converted(&file.chain, &file.file_name) {
                continue;
            }
            by_chain.entry(file.chain.clone()).or_default().push(file);
        }

        let conversions: Vec<ChainConversion> = stream::iter(by_chain)
            .map(|(chain, files)| async move {
                if self.ctx.cancel.is_cancelled() {
                    log::info!("Not converting {}: shutdown requested", chain);
                    return ChainConversion::default();
                }
                self.convert_chain(cycle, &chain, files).await
            })
            .buffer_unordered(self.workers())
            .collect()
            .await;

        let mut attempted = 0;
        let mut written = 0;
        let mut failures = Vec::new();
        for conversion in conversions {
            attempted += conversion.attempted;
            written += conversion.written;
            state.converted.extend(conversion.converted);
            failures.extend(conversion.failures);
        }
        if written > 0 {
            state.converted_since_publish = true;
        }
        log::info!("Converted {} files into {} records", attempted, written);
        OperationReport::from_failures(Operation::Converting, attempted, failures)
    }

    /// Turn one chain's staged files into records and store them.
    async fn convert_chain(
        &self,
        cycle: &Cycle,
        chain: &str,
        files: Vec<StagedFile>,
    ) -> ChainConversion {
        let mut result = ChainConversion {
            attempted: files.len(),
            ..ChainConversion::default()
        };

        let mut by_target: BTreeMap<String, Vec<StorageRecord>> = BTreeMap::new();
        for file in files {
            match to_record(&file, cycle).await {
                Ok(record) => by_target.entry(record.target()).or_default().push(record),
                Err(e) => {
                    // Unconvertible content fails once, then leaves the dump folder.
                    if matches!(e, AppError::Conversion { .. }) {
                        self.reject(&file, &e).await;
                    }
                    result.failures.push(OperationFailure::new(
                        FailureKind::Conversion,
                        &file.file_name,
                        e,
                    ));
                }
            }
        }

        for (target, records) in by_target {
            let stored_short = self.store(self.ctx.short_term.as_ref(), &target, &records).await;
            let stored_outputs = self.store(self.ctx.outputs.as_ref(), &target, &records).await;
            for record in &records {
                let short = stored_short.get(record.natural_id());
                let mirror = stored_outputs.get(record.natural_id());
                match (short, mirror) {
                    (Some(Ok(())), Some(Ok(()))) => {
                        result.written += 1;
                        result.converted.push(ConvertedFile {
                            chain: chain.to_string(),
                            file_type: record.file_type,
                            file_name: record.file_name.clone(),
                        });
                    }
                    (short, mirror) => {
                        let message = [short, mirror]
                            .into_iter()
                            .flatten()
                            .filter_map(|r| r.as_ref().err())
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("; ");
                        result.failures.push(OperationFailure::new(
                            FailureKind::StorageWrite,
                            &record.file_name,
                            message,
                        ));
                    }
                }
            }
        }
        result
    }

    /// Move a staged file into `{rejected}/{chain}/`.
    async fn reject(&self, file: &StagedFile, reason: &AppError) {
        let dir = self.ctx.config.paths.rejected_dir().join(&file.chain);
        let target = dir.join(&file.file_name);
        let moved = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => tokio::fs::rename(&file.path, &target).await,
            Err(e) => Err(e),
        };
        match moved {
            Ok(()) => log::warn!(
                "Rejected {}/{} ({}), moved to {}",
                file.chain,
                file.file_name,
                reason,
                target.display()
            ),
            Err(e) => log::error!(
                "Failed to move rejected file {}: {}",
                file.path.display(),
                e
            ),
        }
    }

    /// Write a batch and report per-record success by natural id.
    async fn store(
        &self,
        storage: &dyn RecordStorage,
        target: &str,
        records: &[StorageRecord],
    ) -> BTreeMap<String, std::result::Result<(), String>> {
        let mut outcome: BTreeMap<String, std::result::Result<(), String>> = records
            .iter()
            .map(|r| (r.natural_id().to_string(), Ok(())))
            .collect();
        match storage.write_records(target, records).await {
            Ok(summary) => {
                for failure in summary.failed {
                    outcome.insert(
                        failure.file_name,
                        Err(format!("{}: {}", storage.backend(), failure.message)),
                    );
                }
            }
            Err(e) => {
                for value in outcome.values_mut() {
                    *value = Err(format!("{}: {}", storage.backend(), e));
                }
            }
        }
        outcome
    }

    async fn api_update(&self, cycle: &Cycle) -> OperationReport {
        let mut failures = Vec::new();
        let chains = self.ctx.config.chains();
        let file_types = self.ctx.config.file_types();
        let mut units = 1;

        for chain in &chains {
            for file_type in &file_types {
                let target = target_name(chain, *file_type);
                units += 1;
                if let Err(e) = self.ctx.short_term.ensure_target(&target).await {
                    failures.push(OperationFailure::new(FailureKind::StorageWrite, target, e));
                }
            }
        }

        let index_path = self.ctx.config.paths.chain_index_file();
        let rebuilt = match build_chain_index(self.ctx.outputs.as_ref(), cycle.as_of).await {
            Ok(index) => write_json(&index_path, &index).await.map(|()| index),
            Err(e) => Err(e),
        };
        match rebuilt {
            Ok(index) => log::info!(
                "Chain index: {} chains, {} records",
                index.chains.len(),
                index.record_count
            ),
            Err(e) => failures.push(OperationFailure::new(
                FailureKind::StorageWrite,
                "chain_index",
                e,
            )),
        }
        OperationReport::from_failures(Operation::ApiUpdate, units, failures)
    }

    async fn clean_dump_files(&self, state: &PipelineState) -> OperationReport {
        let staged = match staged_files(&self.ctx.config.paths.dumps_dir()).await {
            Ok(staged) => staged,
            Err(e) => {
                return OperationReport::failed(
                    Operation::CleanDumpFiles,
                    OperationFailure::new(FailureKind::Cleanup, "dumps", e),
                );
            }
        };

        let mut removed = 0;
        let mut failures = Vec::new();
        let converted: Vec<_> = staged
            .iter()
            .filter(|f| state.is_converted(&f.chain, &f.file_name))
            .collect();
        for file in &converted {
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => removed += 1,
                Err(e) => failures.push(OperationFailure::new(
                    FailureKind::Cleanup,
                    &file.file_name,
                    e,
                )),
            }
        }
        log::info!(
            "Removed {} converted dump files ({} still pending conversion)",
            removed,
            staged.len() - converted.len()
        );
        OperationReport::from_failures(Operation::CleanDumpFiles, converted.len(), failures)
    }

    async fn publishing(&self, cycle: &Cycle, state: &mut PipelineState) -> OperationReport {
        match self.ctx.publisher.publish(cycle.as_of, cycle.timezone).await {
            Ok(outcome) => {
                match &outcome {
                    PublishOutcome::Published(version) => {
                        log::info!(
                            "Published version {} with {} files",
                            version.version,
                            version.manifest.len()
                        );
                        state.converted_since_publish = false;
                    }
                    PublishOutcome::AlreadyPublished { version, .. } => {
                        log::info!(
                            "{} already published as version {}",
                            cycle.scrape_date(),
                            version
                        )
                    }
                }
                state.last_publish = Some(PublishMark {
                    scrape_date: cycle.scrape_date(),
                    cutoff: outcome.cutoff(),
                    version: outcome.version(),
                });
                OperationReport::from_failures(Operation::Publishing, 1, Vec::new())
            }
            Err(e) => OperationReport::failed(
                Operation::Publishing,
                OperationFailure::new(FailureKind::Publish, "dataset", e),
            ),
        }
    }

    async fn clean_all_source_data(&self, state: &mut PipelineState) -> OperationReport {
        let Some(mark) = state.last_publish.clone() else {
            return OperationReport::skipped(Operation::CleanAllSourceData, "nothing published");
        };
        let mut units = 0;
        let mut failures = Vec::new();

        let stores: [&dyn RecordStorage; 2] =
            [self.ctx.outputs.as_ref(), self.ctx.short_term.as_ref()];
        for storage in stores {
            let targets = match storage.list_targets().await {
                Ok(targets) => targets,
                Err(e) if e.is_unsupported() => {
                    log::info!("{} store keeps no purgeable records: {}", storage.backend(), e);
                    continue;
                }
                Err(e) => {
                    units += 1;
                    failures.push(OperationFailure::new(
                        FailureKind::Cleanup,
                        storage.backend(),
                        e,
                    ));
                    continue;
                }
            };
            for target in targets {
                units += 1;
                match storage.purge_until(&target, mark.cutoff).await {
                    Ok(removed) if removed > 0 => {
                        log::info!(
                            "Purged {} records from {} {}",
                            removed,
                            storage.backend(),
                            target
                        )
                    }
                    Ok(_) => {}
                    Err(e) if e.is_unsupported() => {}
                    Err(e) => failures.push(OperationFailure::new(
                        FailureKind::Cleanup,
                        format!("{}:{}", storage.backend(), target),
                        e,
                    )),
                }
            }
        }

        // Converted dump files go; files not yet converted stay for the next cycle.
        match staged_files(&self.ctx.config.paths.dumps_dir()).await {
            Ok(staged) => {
                for file in staged
                    .iter()
                    .filter(|f| state.is_converted(&f.chain, &f.file_name))
                {
                    units += 1;
                    if let Err(e) = tokio::fs::remove_file(&file.path).await {
                        failures.push(OperationFailure::new(
                            FailureKind::Cleanup,
                            &file.file_name,
                            e,
                        ));
                    }
                }
                // Ledger entries survive only while their dump file does.
                let remaining = staged_files(&self.ctx.config.paths.dumps_dir())
                    .await
                    .unwrap_or_default();
                state.converted.retain(|c| {
                    remaining
                        .iter()
                        .any(|f| f.chain == c.chain && f.file_name == c.file_name)
                });
            }
            Err(e) => {
                units += 1;
                failures.push(OperationFailure::new(FailureKind::Cleanup, "dumps", e));
            }
        }

        OperationReport::from_failures(Operation::CleanAllSourceData, units, failures)
    }
}

/// Every file under `{dumps}/{chain}/`.
async fn staged_files(dumps: &Path) -> Result<Vec<StagedFile>> {
    let mut staged = Vec::new();
    let mut entries = match tokio::fs::read_dir(dumps).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(staged),
        Err(e) => return Err(AppError::Io(e)),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let chain = entry.file_name().to_string_lossy().to_string();
        for path in list_files(&entry.path()).await? {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            // Partial downloads and our own temp files.
            if file_name.starts_with('.') || file_name.ends_with(".tmp") {
                continue;
            }
            staged.push(StagedFile {
                chain: chain.clone(),
                file_name,
                path,
            });
        }
    }
    staged.sort_by(|a, b| (&a.chain, &a.file_name).cmp(&(&b.chain, &b.file_name)));
    Ok(staged)
}

/// Read a staged file into a record stamped with the cycle's as-of time.
async fn to_record(file: &StagedFile, cycle: &Cycle) -> Result<StorageRecord> {
    let file_type = FileType::from_file_name(&file.file_name)
        .ok_or_else(|| AppError::conversion(&file.file_name, "unknown file type"))?;
    let bytes = tokio::fs::read(&file.path).await?;
    if bytes.is_empty() {
        return Err(AppError::conversion(&file.file_name, "file is empty"));
    }
    let content = String::from_utf8(bytes)
        .map_err(|_| AppError::conversion(&file.file_name, "content is not UTF-8 text"))?;
    Ok(StorageRecord::new(
        &file.chain,
        file_type,
        &file.file_name,
        content,
        cycle.as_of,
    ))
}
