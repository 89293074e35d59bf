//! Data models for the feed pipeline.

pub mod config;
pub mod cycle;
pub mod dataset;
pub mod record;

pub use config::{
    Config, Destination, HealthConfig, HostKind, LongTermConfig, PathsConfig, RepeatPolicy,
    ScheduleConfig, ScrapingConfig, StopCondition, StorageConfig, parse_as_of,
};
pub use cycle::{
    Cycle, CycleOutcome, Operation, OperationFailure, OperationReport, OperationStatus,
    local_date,
};
pub use dataset::{DatasetVersion, ManifestEntry, VersionIndex, VersionInfo};
pub use record::{FileType, StorageRecord, split_target, target_name};
