// src/utils/log.rs

//! Banner helpers on top of the `log` facade.
//!
//! Keeps cycle output readable in plain container logs:
//!
//! ```text
//! [INFO] ════════════════════════════════════════════════════════════
//! [INFO]   Cycle 3 (2025-01-01T10:00:00+00:00)
//! [INFO] ════════════════════════════════════════════════════════════
//! [INFO] [STEP 1/4] scraping
//! ```

/// Log a header
pub fn header(title: &str) {
    let border = "═".repeat(60);
    log::info!("{}", border);
    log::info!("  {}", title);
    log::info!("{}", border);
}

/// Log a step in a process
pub fn step(step_num: usize, total: usize, message: &str) {
    log::info!("[STEP {}/{}] {}", step_num, total, message);
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    log::info!("[SUMMARY] {}", title);
    for (key, value) in items {
        log::info!("    {}: {}", key, value);
    }
}
