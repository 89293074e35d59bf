// src/lib.rs

//! feedkeeper: scrape retail price feeds, keep them in a short-term store and
//! publish daily snapshots to a versioned long-term dataset.

pub mod access;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod models;
pub mod pipeline;
pub mod publish;
pub mod services;
pub mod storage;
pub mod utils;
