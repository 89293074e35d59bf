//! feedkeeper CLI
//!
//! Runs the cycle loop, single cycles and the maintenance commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use feedkeeper::{
    access::{AccessLayer, HealthReport},
    config::load_config,
    error::{AppError, Result},
    models::{Config, Cycle, Operation, VersionIndex},
    pipeline::{self, PipelineState, SchedulerReport},
    publish::open_host,
    services::CommandScraper,
    storage::open_storage,
    utils::{fs::read_json, log as banner},
};
use tokio_util::sync::CancellationToken;

/// feedkeeper - retail feed pipeline
#[derive(Parser, Debug)]
#[command(
    name = "feedkeeper",
    version,
    about = "Scrape retail price feeds, store them and publish daily datasets"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FEEDKEEPER_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler loop until stopped
    Run,

    /// Run one cycle with the given operations, e.g. `scraping,converting`
    Ops {
        /// Comma-separated operation names
        operations: String,
    },

    /// Validate configuration and environment
    Validate,

    /// Show pipeline state and published versions
    Info,

    /// Probe process, short-term store and long-term host
    Health,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, configured: Option<&str>) {
    let level = match configured {
        _ if verbose => "debug",
        Some(level) if !level.is_empty() => level,
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        log::warn!("Shutdown requested, finishing the current operation...");
        token.cancel();
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging comes up before the config so load errors are visible.
    let config = load_config(Some(cli.config.as_path()));
    let level = config
        .as_ref()
        .ok()
        .map(|c| c.logging.level.clone());
    init_logging(cli.verbose, level.as_deref());

    let config = match config {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!("Configuration error: {}", e);
            return Err(e);
        }
    };

    match cli.command {
        Command::Run => {
            log::info!("feedkeeper starting...");
            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            let scraper = Arc::new(CommandScraper::from_config(&config.scraping));
            let mut scheduler = pipeline::build_scheduler(config.clone(), scraper, cancel).await?;
            let report = scheduler.run().await;
            print_report(&report);
        }

        Command::Ops { operations } => {
            let operations = Operation::parse_list(&operations)?;
            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            let scraper = Arc::new(CommandScraper::from_config(&config.scraping));
            let mut scheduler = pipeline::build_scheduler(config.clone(), scraper, cancel).await?;
            let cycle = scheduler.run_once(operations).await;
            for report in &cycle.reports {
                log::info!("  {}: {:?}", report.operation, report.status);
            }
            check_cycle(&cycle)?;
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            // load_config already validated; report what was resolved.
            log::info!("✓ Config OK");
            log::info!("  Chains: {}", config.chains().join(", "));
            log::info!(
                "  File types: {}",
                config
                    .file_types()
                    .iter()
                    .map(|ft| ft.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            log::info!("  Destination: {}", config.storage.destination);
            log::info!("  Long-term host: {:?}", config.long_term.host);

            log::info!("All validations passed!");
        }

        Command::Info => show_info(&config).await?,

        Command::Health => {
            let short_term = open_storage(&config).await?;
            let host = open_host(&config).await?;
            let report = AccessLayer::new(&config, short_term, host).health().await;
            for (name, probe) in [
                ("process", &report.process),
                ("short-term", &report.short_term),
                ("long-term", &report.long_term),
            ] {
                let mark = if probe.healthy { "✓" } else { "✗" };
                log::info!("{} {}: {}", mark, name, probe.message);
            }
            check_report(&report)?;
        }
    }

    log::info!("Done!");

    Ok(())
}

/// A cycle with failures makes the command fail.
fn check_cycle(cycle: &Cycle) -> Result<()> {
    let outcome = cycle.outcome();
    if outcome.had_failures() {
        return Err(AppError::validation(format!(
            "cycle finished with failures ({outcome})"
        )));
    }
    Ok(())
}

fn check_report(report: &HealthReport) -> Result<()> {
    if report.is_healthy() {
        Ok(())
    } else {
        Err(AppError::validation("health check failed"))
    }
}

fn print_report(report: &SchedulerReport) {
    let outcomes = report.outcomes();
    let failed = outcomes.iter().filter(|o| o.had_failures()).count();
    banner::summary(
        "Scheduler stopped",
        &[
            ("Cycles", report.cycles.len().to_string()),
            ("With failures", failed.to_string()),
        ],
    );
}

async fn show_info(config: &Config) -> Result<()> {
    let paths = &config.paths;
    log::info!("App data: {}", paths.app_data.display());

    match read_json::<PipelineState>(&paths.state_file()).await? {
        Some(state) => {
            log::info!("Converted files awaiting cleanup: {}", state.converted.len());
            log::info!(
                "New data since last publish: {}",
                if state.converted_since_publish { "yes" } else { "no" }
            );
            match &state.last_publish {
                Some(mark) => log::info!(
                    "Last publish: version {} for {} (cutoff {})",
                    mark.version,
                    mark.scrape_date,
                    mark.cutoff.to_rfc3339()
                ),
                None => log::info!("Nothing published yet."),
            }
            if let Some(date) = state.last_final_run {
                log::info!("End-of-day operations last ran for {}", date);
            }
        }
        None => log::info!("No pipeline state found yet."),
    }

    let host = open_host(config).await?;
    let index: VersionIndex = host.fetch_index().await?;
    match index.latest() {
        Some((version, info)) => log::info!(
            "Dataset '{}' on {}: {} versions, latest v{} ({})",
            index.dataset,
            host.name(),
            index.versions.len(),
            version,
            info.scrape_date
        ),
        None => log::info!("Dataset has no versions yet."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedkeeper::access::ProbeResult;
    use feedkeeper::error::FailureKind;
    use feedkeeper::models::{OperationFailure, OperationReport};

    fn result(healthy: bool) -> ProbeResult {
        ProbeResult {
            healthy,
            message: String::new(),
        }
    }

    #[test]
    fn test_failed_cycle_is_an_error() {
        let mut cycle = Cycle::new(1, None, Operation::ongoing());
        assert!(check_cycle(&cycle).is_ok());

        cycle.reports.push(OperationReport::failed(
            Operation::Scraping,
            OperationFailure::new(FailureKind::Fetch, "SHUFERSAL", "timeout"),
        ));
        assert!(matches!(check_cycle(&cycle), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_unhealthy_report_is_an_error() {
        let healthy = HealthReport {
            process: result(true),
            short_term: result(true),
            long_term: result(true),
        };
        assert!(check_report(&healthy).is_ok());

        let unhealthy = HealthReport {
            short_term: result(false),
            ..healthy
        };
        assert!(check_report(&unhealthy).is_err());
    }
}
