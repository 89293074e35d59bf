// src/heartbeat.rs

//! Liveness record for external health probes.
//!
//! A single JSON file, overwritten atomically after every attempted
//! operation. The `failed` flag is raised by any failed or partially failed
//! operation and only cleared by a cycle in which every attempted operation
//! succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{Cycle, CycleOutcome, Operation, OperationReport, OperationStatus};
use crate::utils::fs::{read_json, write_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Running,
    Success,
    PartialFailure,
    Failed,
}

/// Latest known state of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub status: EntryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub last_update: Option<DateTime<Utc>>,
    pub last_operation: Option<Operation>,
    pub current_operation: Option<Operation>,
    pub failed: bool,
    #[serde(default)]
    pub cycle: Option<u64>,
    #[serde(default)]
    pub cycle_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_outcome: Option<CycleOutcome>,
    #[serde(default)]
    pub operations: BTreeMap<Operation, OperationEntry>,
}

/// Writes the heartbeat file.
pub struct HeartbeatRecorder {
    path: PathBuf,
    // Serializes read-modify-write of the file.
    lock: Mutex<()>,
}

impl HeartbeatRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<HeartbeatRecord>> {
        read_json(&self.path).await
    }

    async fn update(&self, change: impl FnOnce(&mut HeartbeatRecord)) -> Result<HeartbeatRecord> {
        let _guard = self.lock.lock().await;
        let mut record = match read_json::<HeartbeatRecord>(&self.path).await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                log::warn!("Heartbeat file unreadable, starting over: {}", e);
                HeartbeatRecord::default()
            }
        };
        change(&mut record);
        record.last_update = Some(Utc::now());
        write_json(&self.path, &record).await?;
        Ok(record)
    }

    /// Mark `operation` as running.
    pub async fn start_operation(&self, cycle: &Cycle, operation: Operation) -> Result<()> {
        self.update(|hb| {
            hb.cycle = Some(cycle.number);
            hb.cycle_started_at = Some(cycle.started_at);
            hb.current_operation = Some(operation);
            hb.operations.insert(
                operation,
                OperationEntry {
                    status: EntryStatus::Running,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                },
            );
        })
        .await?;
        log::debug!("Heartbeat: started {}", operation);
        Ok(())
    }

    /// Record how an attempted operation ended. Skipped operations leave no trace.
    pub async fn record_operation(&self, cycle: &Cycle, report: &OperationReport) -> Result<()> {
        let status = match &report.status {
            OperationStatus::Skipped(_) => return Ok(()),
            OperationStatus::Succeeded => EntryStatus::Success,
            OperationStatus::PartiallyFailed => EntryStatus::PartialFailure,
            OperationStatus::Failed => EntryStatus::Failed,
        };
        let record = self
            .update(|hb| {
                hb.cycle = Some(cycle.number);
                hb.cycle_started_at = Some(cycle.started_at);
                hb.current_operation = None;
                hb.last_operation = Some(report.operation);
                if status != EntryStatus::Success {
                    hb.failed = true;
                }
                let started_at = hb
                    .operations
                    .get(&report.operation)
                    .map(|e| e.started_at)
                    .unwrap_or(report.finished_at);
                hb.operations.insert(
                    report.operation,
                    OperationEntry {
                        status,
                        started_at,
                        completed_at: Some(report.finished_at),
                        error: report.error_message(),
                    },
                );
            })
            .await?;
        log::debug!(
            "Heartbeat: {} finished as {:?} (failed flag: {})",
            report.operation,
            status,
            record.failed
        );
        Ok(())
    }

    /// Record the cycle outcome; a fully successful cycle clears the failure flag.
    pub async fn record_cycle(&self, cycle: &Cycle) -> Result<()> {
        let outcome = cycle.outcome();
        if outcome == CycleOutcome::Idle {
            return Ok(());
        }
        self.update(|hb| {
            hb.last_outcome = Some(outcome);
            if outcome == CycleOutcome::Success {
                hb.failed = false;
            }
        })
        .await?;
        Ok(())
    }

    /// Refresh `last_update` only, e.g. while waiting between cycles.
    pub async fn touch(&self) -> Result<()> {
        // Nothing to refresh before the first attempted operation.
        if !self.path.exists() {
            return Ok(());
        }
        self.update(|_| {}).await?;
        Ok(())
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HealthStatus::Healthy(m) | HealthStatus::Unhealthy(m) => m,
        }
    }
}

/// Judge process health from the heartbeat file.
pub async fn check_health(path: &Path, max_age: Duration) -> HealthStatus {
    check_health_at(path, max_age, Utc::now()).await
}

pub async fn check_health_at(path: &Path, max_age: Duration, now: DateTime<Utc>) -> HealthStatus {
    let record = match read_json::<HeartbeatRecord>(path).await {
        Ok(Some(record)) => record,
        Ok(None) => return HealthStatus::Unhealthy("Heartbeat file does not exist".into()),
        Err(e) => return HealthStatus::Unhealthy(format!("Error reading heartbeat file: {e}")),
    };

    let Some(last_update) = record.last_update else {
        return HealthStatus::Unhealthy("Heartbeat file missing 'last_update' field".into());
    };
    let age = now.signed_duration_since(last_update).num_seconds().max(0);
    if age as u64 > max_age.as_secs() {
        return HealthStatus::Unhealthy(format!(
            "Heartbeat is stale (last update: {age}s ago)"
        ));
    }

    if record.failed {
        let errors: Vec<String> = record
            .operations
            .iter()
            .filter(|(_, e)| matches!(e.status, EntryStatus::Failed | EntryStatus::PartialFailure))
            .map(|(op, e)| format!("{}: {}", op, e.error.as_deref().unwrap_or("unknown error")))
            .collect();
        return HealthStatus::Unhealthy(format!("Operations failed. {}", errors.join("; ")));
    }

    if let Some(current) = record.current_operation {
        if let Some(entry) = record.operations.get(&current) {
            let running = now.signed_duration_since(entry.started_at).num_seconds();
            return HealthStatus::Healthy(format!(
                "Healthy. Currently running: {current} (for {running}s)"
            ));
        }
    }
    HealthStatus::Healthy("Healthy".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::models::OperationFailure;
    use tempfile::TempDir;

    const MAX_AGE: Duration = Duration::from_secs(300);

    fn cycle() -> Cycle {
        Cycle::new(1, None, Operation::ongoing())
    }

    fn failed(op: Operation) -> OperationReport {
        OperationReport::failed(
            op,
            OperationFailure::new(FailureKind::Fetch, "SHUFERSAL", "timeout"),
        )
    }

    #[tokio::test]
    async fn test_missing_file_is_unhealthy() {
        let tmp = TempDir::new().unwrap();
        let status = check_health(&tmp.path().join("heartbeat.json"), MAX_AGE).await;
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn test_failure_flag_cleared_only_by_successful_cycle() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("heartbeat.json");
        let recorder = HeartbeatRecorder::new(&path);

        // Cycle 1: scraping fails.
        let mut first = cycle();
        let report = failed(Operation::Scraping);
        recorder.record_operation(&first, &report).await.unwrap();
        first.reports.push(report);
        recorder.record_cycle(&first).await.unwrap();
        assert!(recorder.load().await.unwrap().unwrap().failed);
        assert!(!check_health(&path, MAX_AGE).await.is_healthy());

        // Cycle 2: one success, one failure; flag stays.
        let mut second = cycle();
        let ok = OperationReport::from_failures(Operation::Scraping, 1, vec![]);
        recorder.record_operation(&second, &ok).await.unwrap();
        second.reports.push(ok);
        assert!(recorder.load().await.unwrap().unwrap().failed);
        let bad = failed(Operation::Converting);
        recorder.record_operation(&second, &bad).await.unwrap();
        second.reports.push(bad);
        recorder.record_cycle(&second).await.unwrap();
        assert!(recorder.load().await.unwrap().unwrap().failed);

        // Cycle 3: everything succeeds.
        let mut third = cycle();
        let ok = OperationReport::from_failures(Operation::Scraping, 1, vec![]);
        recorder.record_operation(&third, &ok).await.unwrap();
        third.reports.push(ok);
        recorder.record_cycle(&third).await.unwrap();

        let record = recorder.load().await.unwrap().unwrap();
        assert!(!record.failed);
        assert_eq!(record.last_operation, Some(Operation::Scraping));
        assert!(check_health(&path, MAX_AGE).await.is_healthy());
    }

    #[tokio::test]
    async fn test_skipped_and_idle_leave_no_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("heartbeat.json");
        let recorder = HeartbeatRecorder::new(&path);

        let mut idle = cycle();
        let skipped = OperationReport::skipped(Operation::Publishing, "nothing converted");
        recorder.record_operation(&idle, &skipped).await.unwrap();
        idle.reports.push(skipped);
        recorder.record_cycle(&idle).await.unwrap();
        recorder.touch().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_heartbeat() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("heartbeat.json");
        let recorder = HeartbeatRecorder::new(&path);
        let ok = OperationReport::from_failures(Operation::Scraping, 1, vec![]);
        recorder.record_operation(&cycle(), &ok).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(301);
        let status = check_health_at(&path, MAX_AGE, later).await;
        assert!(!status.is_healthy());
        assert!(status.message().contains("stale"));
    }
}
