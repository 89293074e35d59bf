// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use crate::error::Result;

const USER_AGENT: &str = concat!("feedkeeper/", env!("CARGO_PKG_VERSION"));

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;
    Ok(client)
}
