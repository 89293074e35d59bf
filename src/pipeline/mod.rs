//! Pipeline entry points.
//!
//! - `graph`: the six operations and their fixed order
//! - `scheduler`: the cycle loop around the graph
//! - `index`: chain index for the serving layer
//! - `state`: converted-file ledger and publish marks

pub mod graph;
pub mod index;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::heartbeat::HeartbeatRecorder;
use crate::models::Config;
use crate::publish::{LongTermPublisher, open_host};
use crate::services::Scraper;
use crate::storage::{FileStorage, open_storage};

pub use graph::{OperationGraph, PipelineContext};
pub use index::{ChainIndex, IndexBuilder, build_chain_index};
pub use scheduler::{Scheduler, SchedulerReport, SchedulerState};
pub use state::{PipelineState, StateStore};

/// Wire the configured backends into a scheduler.
///
/// Connects to the short-term store and the long-term host up front, so a
/// misconfigured destination fails before the first cycle.
pub async fn build_scheduler(
    config: Arc<Config>,
    scraper: Arc<dyn Scraper>,
    cancel: CancellationToken,
) -> Result<Scheduler> {
    let short_term = open_storage(&config).await?;
    let outputs = Arc::new(FileStorage::new(
        config.paths.outputs_dir(),
        config.storage.max_write_attempts,
    ));
    let host = open_host(&config).await?;
    log::info!(
        "Short-term store: {}, long-term host: {}",
        short_term.backend(),
        host.name()
    );

    let publisher = LongTermPublisher::new(
        host,
        outputs.clone(),
        config.paths.export_dir(),
        config.long_term.dataset.clone(),
    );
    let graph = OperationGraph::new(PipelineContext {
        scraper,
        short_term,
        outputs,
        publisher,
        state: StateStore::new(config.paths.state_file()),
        heartbeat: Arc::new(HeartbeatRecorder::new(config.paths.heartbeat_file())),
        cancel,
        config,
    });
    Ok(Scheduler::new(graph))
}
