//! Cycle scheduler: the long-running loop around the operation graph.
//!
//! ```text
//! Idle → RunningCycle → Waiting → RunningCycle … → Stopped
//! ```
//!
//! Each iteration resolves its as-of time, merges the end-of-day operations
//! when they are due, runs the graph and records the outcome. Operation
//! failures never end the loop; only cancellation or `repeat = ONCE` do.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::Instant;

use crate::models::{
    Cycle, CycleOutcome, Operation, OperationStatus, RepeatPolicy, StopCondition,
};
use crate::pipeline::graph::OperationGraph;
use crate::utils::log as banner;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RunningCycle(u64),
    Waiting,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => f.write_str("idle"),
            SchedulerState::RunningCycle(n) => write!(f, "running cycle {n}"),
            SchedulerState::Waiting => f.write_str("waiting"),
            SchedulerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Cycles run by one call to [`Scheduler::run`].
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub cycles: Vec<Cycle>,
}

impl SchedulerReport {
    pub fn outcomes(&self) -> Vec<CycleOutcome> {
        self.cycles.iter().map(Cycle::outcome).collect()
    }

    pub fn had_failures(&self) -> bool {
        self.outcomes().iter().any(CycleOutcome::had_failures)
    }
}

pub struct Scheduler {
    graph: OperationGraph,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(graph: OperationGraph) -> Self {
        Self {
            graph,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn graph(&self) -> &OperationGraph {
        &self.graph
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            log::info!("Scheduler: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Loop until cancelled, or once under `repeat = ONCE`.
    pub async fn run(&mut self) -> SchedulerReport {
        let ctx = self.graph.context();
        let cancel = ctx.cancel.clone();
        let repeat = ctx.config.schedule.repeat;
        let wait = ctx.config.schedule.wait();

        let mut report = SchedulerReport::default();
        let mut number = 0;
        while !cancel.is_cancelled() {
            number += 1;
            let cycle = self.run_cycle(number).await;
            // An idle cycle must not make the process look alive.
            let keep_alive = cycle.outcome() != CycleOutcome::Idle;
            report.cycles.push(cycle);

            if repeat == RepeatPolicy::Once {
                break;
            }
            self.transition(SchedulerState::Waiting);
            log::info!("Next cycle in {}s", wait.as_secs());
            if !self.wait(wait, keep_alive).await {
                log::info!("Shutdown requested while waiting");
                break;
            }
        }
        self.transition(SchedulerState::Stopped);
        report
    }

    /// Run a single cycle with the configured operations, merging the
    /// end-of-day operations when due.
    pub async fn run_cycle(&mut self, number: u64) -> Cycle {
        let config = self.graph.context().config.clone();
        let mut cycle = Cycle::new(number, config.schedule.as_of, config.cycle_operations())
            .in_timezone(config.schedule.timezone);

        let final_due = config.schedule.stop == StopCondition::EndOfDay
            && self.last_final_run().await != Some(cycle.scrape_date());
        if final_due {
            cycle.operations.extend(Operation::end_of_day());
        }

        let cycle = self.execute(cycle).await;
        if final_due && final_ops_done(&cycle) {
            self.mark_final_run(cycle.scrape_date()).await;
        }
        cycle
    }

    /// Run one cycle with exactly `operations`.
    pub async fn run_once(&mut self, operations: BTreeSet<Operation>) -> Cycle {
        let schedule = &self.graph.context().config.schedule;
        let cycle = Cycle::new(1, schedule.as_of, operations).in_timezone(schedule.timezone);
        let cycle = self.execute(cycle).await;
        self.transition(SchedulerState::Stopped);
        cycle
    }

    async fn execute(&mut self, mut cycle: Cycle) -> Cycle {
        self.transition(SchedulerState::RunningCycle(cycle.number));
        banner::header(&format!(
            "Cycle {} ({}{})",
            cycle.number,
            cycle.as_of.to_rfc3339(),
            if cycle.fixed_as_of { ", fixed" } else { "" }
        ));

        self.graph.run(&mut cycle).await;

        let outcome = cycle.outcome();
        if let Err(e) = self.graph.context().heartbeat.record_cycle(&cycle).await {
            log::warn!("Heartbeat write failed: {}", e);
        }
        banner::summary(
            &format!("Cycle {}", cycle.number),
            &[
                ("Outcome", outcome.to_string()),
                ("Attempted", cycle.attempted().to_string()),
                (
                    "Skipped",
                    (cycle.reports.len() - cycle.attempted()).to_string(),
                ),
            ],
        );
        match outcome {
            CycleOutcome::Failure => log::error!("Cycle {} failed", cycle.number),
            CycleOutcome::PartialFailure => {
                log::warn!("Cycle {} finished with failures", cycle.number)
            }
            _ => {}
        }
        cycle
    }

    /// Sleep for `total`, refreshing the heartbeat when `keep_alive` is set.
    /// Returns false when cancelled.
    async fn wait(&self, total: Duration, keep_alive: bool) -> bool {
        let ctx = self.graph.context();
        let half_max_age = Duration::from_secs(ctx.config.health.max_age_secs / 2);
        let tick = total.min(half_max_age).max(Duration::from_secs(1));
        let deadline = Instant::now() + total;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return false,
                _ = tokio::time::sleep((deadline - now).min(tick)) => {}
            }
            if !keep_alive {
                continue;
            }
            if let Err(e) = ctx.heartbeat.touch().await {
                log::warn!("Heartbeat refresh failed: {}", e);
            }
        }
    }

    async fn last_final_run(&self) -> Option<NaiveDate> {
        match self.graph.context().state.load().await {
            Ok(state) => state.last_final_run,
            Err(e) => {
                log::warn!("Pipeline state unreadable: {}", e);
                None
            }
        }
    }

    async fn mark_final_run(&self, date: NaiveDate) {
        let store = &self.graph.context().state;
        let result = match store.load().await {
            Ok(mut state) => {
                state.last_final_run = Some(date);
                store.save(&state).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => log::info!("End-of-day operations done for {}", date),
            Err(e) => log::error!("Failed to record end-of-day run: {}", e),
        }
    }
}

/// The end-of-day operations count as done once publishing succeeded.
/// A skipped or failed publish is retried on the next cycle.
fn final_ops_done(cycle: &Cycle) -> bool {
    cycle
        .reports
        .iter()
        .any(|r| r.operation == Operation::Publishing && r.status == OperationStatus::Succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, Result};
    use crate::heartbeat::{HeartbeatRecord, HeartbeatRecorder};
    use crate::models::{Config, FileType};
    use crate::pipeline::graph::PipelineContext;
    use crate::pipeline::state::StateStore;
    use crate::publish::{LocalDatasetHost, LongTermPublisher};
    use crate::services::{ScrapeRequest, Scraper};
    use crate::storage::FileStorage;
    use crate::utils::fs::write_json;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Stages one file per call; fails when `fail` is set and cancels after
    /// `cancel_after` calls.
    struct CountingScraper {
        calls: AtomicUsize,
        fail: bool,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl Scraper for CountingScraper {
        async fn scrape(&self, request: &ScrapeRequest) -> Result<Vec<PathBuf>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if call >= *limit {
                    token.cancel();
                }
            }
            if self.fail {
                return Err(AppError::fetch(&request.chain, "connection reset"));
            }
            tokio::fs::create_dir_all(&request.dump_dir).await?;
            let path = request.dump_dir.join(format!("PriceFull-{call:03}.xml"));
            tokio::fs::write(&path, "<prices/>").await?;
            Ok(vec![path])
        }
    }

    fn scheduler(
        tmp: &TempDir,
        config: impl FnOnce(&mut Config),
        scraper: CountingScraper,
        cancel: CancellationToken,
    ) -> Scheduler {
        let mut cfg = Config::default();
        cfg.paths.app_data = tmp.path().to_path_buf();
        cfg.scraping.enabled_chains = vec!["SHUFERSAL".into()];
        cfg.scraping.enabled_file_types = vec![FileType::PriceFullFile];
        cfg.schedule.wait_secs = 0;
        config(&mut cfg);

        let config = Arc::new(cfg);
        let outputs = Arc::new(FileStorage::new(config.paths.outputs_dir(), 3));
        let host = Arc::new(LocalDatasetHost::new(tmp.path().join("long_term"), "feeds"));
        Scheduler::new(OperationGraph::new(PipelineContext {
            scraper: Arc::new(scraper),
            short_term: Arc::new(FileStorage::new(config.paths.short_term_dir(), 3)),
            publisher: LongTermPublisher::new(
                host,
                outputs.clone(),
                config.paths.export_dir(),
                "feeds",
            ),
            outputs,
            state: StateStore::new(config.paths.state_file()),
            heartbeat: Arc::new(HeartbeatRecorder::new(config.paths.heartbeat_file())),
            cancel,
            config,
        }))
    }

    fn scraper() -> CountingScraper {
        CountingScraper {
            calls: AtomicUsize::new(0),
            fail: false,
            cancel_after: None,
        }
    }

    fn ran(cycle: &Cycle, op: Operation) -> bool {
        cycle
            .reports
            .iter()
            .any(|r| r.operation == op && r.status.attempted())
    }

    #[tokio::test]
    async fn test_once_runs_exactly_one_cycle() {
        let tmp = TempDir::new().unwrap();
        let mut scheduler = scheduler(
            &tmp,
            |c| {
                c.schedule.repeat = RepeatPolicy::Once;
                c.schedule.stop = StopCondition::Never;
            },
            scraper(),
            CancellationToken::new(),
        );

        let report = scheduler.run().await;

        assert_eq!(report.cycles.len(), 1);
        assert_eq!(report.outcomes(), vec![CycleOutcome::Success]);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        // NEVER: no end-of-day operations merged.
        assert!(!report.cycles[0].operations.contains(&Operation::Publishing));
    }

    #[tokio::test]
    async fn test_end_of_day_operations_run_once_per_date() {
        let tmp = TempDir::new().unwrap();
        let as_of = Utc.with_ymd_and_hms(2025, 3, 4, 21, 0, 0).unwrap();
        let mut scheduler = scheduler(
            &tmp,
            |c| c.schedule.as_of = Some(as_of),
            scraper(),
            CancellationToken::new(),
        );

        let first = scheduler.run_cycle(1).await;
        assert!(ran(&first, Operation::Publishing));
        assert!(ran(&first, Operation::CleanAllSourceData));
        assert_eq!(first.outcome(), CycleOutcome::Success, "{:?}", first.reports);

        let second = scheduler.run_cycle(2).await;
        assert!(!second.operations.contains(&Operation::Publishing));
        assert!(ran(&second, Operation::Converting));

        let state = scheduler.graph().context().state.load().await.unwrap();
        assert_eq!(state.last_final_run, Some(first.scrape_date()));
    }

    #[tokio::test]
    async fn test_cancellation_during_wait_stops_promptly() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut scheduler = scheduler(
            &tmp,
            |c| c.schedule.wait_secs = 3600,
            scraper(),
            cancel.clone(),
        );

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        };
        let (report, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(scheduler.run(), canceller)
        })
        .await
        .expect("scheduler did not stop");

        assert_eq!(report.cycles.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let failing = CountingScraper {
            calls: AtomicUsize::new(0),
            fail: true,
            cancel_after: Some((3, cancel.clone())),
        };
        let mut scheduler = scheduler(&tmp, |_| {}, failing, cancel);

        let report = scheduler.run().await;

        assert_eq!(report.cycles.len(), 3);
        // Scraping fails every time; the cheap operations still run.
        assert_eq!(report.cycles[0].outcome(), CycleOutcome::PartialFailure);
        assert_eq!(report.cycles[1].outcome(), CycleOutcome::PartialFailure);
        assert!(ran(&report.cycles[1], Operation::ApiUpdate));
        // Cancelled mid-cycle: everything after scraping is skipped.
        assert_eq!(report.cycles[2].outcome(), CycleOutcome::Failure);
        assert!(report.had_failures());

        let heartbeat = scheduler
            .graph()
            .context()
            .heartbeat
            .load()
            .await
            .unwrap()
            .unwrap();
        assert!(heartbeat.failed);
    }

    #[tokio::test]
    async fn test_idle_cycles_leave_heartbeat_untouched() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut scheduler = scheduler(
            &tmp,
            |c| {
                c.schedule.stop = StopCondition::Never;
                c.schedule.wait_secs = 1;
                // Nothing converted yet, so publishing is always skipped.
                c.schedule.operations = Some(vec![Operation::Publishing]);
            },
            scraper(),
            cancel.clone(),
        );
        let heartbeat = scheduler.graph().context().heartbeat.clone();
        let before = Utc::now() - chrono::Duration::hours(1);
        write_json(
            heartbeat.path(),
            &HeartbeatRecord {
                last_update: Some(before),
                ..HeartbeatRecord::default()
            },
        )
        .await
        .unwrap();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        };
        let (report, ()) = tokio::join!(scheduler.run(), canceller);

        assert!(!report.cycles.is_empty());
        assert!(report.outcomes().iter().all(|o| *o == CycleOutcome::Idle));
        let record = heartbeat.load().await.unwrap().unwrap();
        assert_eq!(record.last_update, Some(before));
    }

    #[tokio::test]
    async fn test_run_once_uses_explicit_operations() {
        let tmp = TempDir::new().unwrap();
        let mut scheduler = scheduler(&tmp, |_| {}, scraper(), CancellationToken::new());

        let cycle = scheduler
            .run_once([Operation::Scraping].into_iter().collect())
            .await;

        assert_eq!(cycle.reports.len(), 1);
        assert!(ran(&cycle, Operation::Scraping));
        assert!(!ran(&cycle, Operation::Publishing));
    }
}
