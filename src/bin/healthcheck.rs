//! Container healthcheck: exits 0 when the heartbeat is fresh and no
//! operation has failed since the last successful cycle, 1 otherwise.
//!
//! Reads `APP_DATA_PATH` and `HEALTHCHECK_MAX_AGE_SECONDS`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use feedkeeper::heartbeat::check_health;
use feedkeeper::models::{HealthConfig, PathsConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut paths = PathsConfig::default();
    if let Ok(dir) = std::env::var("APP_DATA_PATH") {
        paths.app_data = PathBuf::from(dir);
    }

    let mut max_age = HealthConfig::default().max_age_secs;
    if let Ok(raw) = std::env::var("HEALTHCHECK_MAX_AGE_SECONDS") {
        match raw.trim().parse() {
            Ok(secs) => max_age = secs,
            Err(_) => {
                eprintln!("✗ HEALTHCHECK_MAX_AGE_SECONDS is not a number: {raw}");
                return ExitCode::FAILURE;
            }
        }
    }

    let status = check_health(&paths.heartbeat_file(), Duration::from_secs(max_age)).await;
    if status.is_healthy() {
        println!("✓ {}", status.message());
        ExitCode::SUCCESS
    } else {
        println!("✗ {}", status.message());
        ExitCode::FAILURE
    }
}
