//! Service layer for the pipeline.
//!
//! This module contains the external collaborators the operations call:
//! - Feed scraping (`Scraper`, `CommandScraper`)

mod scraper;

pub use scraper::{CommandScraper, ScrapeRequest, Scraper};
