use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use clap::Args;

use crate::storage::StorageOptions;

/// Command line options, before validation.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Directory path to create and fill the data store under.
    #[arg(long = "storage.path", default_value = "data")]
    pub storage_path: PathBuf,

    /// Period of time to store data for.
    #[arg(
        long = "storage.retention-period",
        default_value = "360h",
        value_parser = humantime::parse_duration
    )]
    pub retention_period: Duration,

    /// Maximum period of time between checkpoints.
    #[arg(
        long = "storage.checkpoint-interval",
        default_value = "30m",
        value_parser = humantime::parse_duration
    )]
    pub checkpoint_interval: Duration,

    /// Number of series with unpersisted samples that triggers a checkpoint.
    #[arg(long = "storage.checkpoint-dirty-series-limit", default_value_t = 10_000)]
    pub checkpoint_dirty_series_limit: usize,

    /// Samples waiting to be persisted above which ingestion is throttled.
    #[arg(long = "storage.max-pending-points", default_value_t = 1 << 20)]
    pub max_pending_points: usize,

    /// Amount of data to buffer for ingestion in bytes.
    #[arg(long = "prefiller.buffer-size", default_value_t = 100 << 20)]
    pub buffer_size: usize,

    /// Give up when the storage throttles for longer than this (default: wait forever).
    #[arg(long = "prefiller.max-throttle-wait", value_parser = humantime::parse_duration)]
    pub max_throttle_wait: Option<Duration>,

    /// Logging level (trace, debug, info, warn, error) or filter directive.
    #[arg(long = "log.level", default_value = "info")]
    pub log_level: String,
}

/// Validated configuration, built once and passed to each component.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageOptions,
    /// Batch size threshold in bytes.
    pub buffer_size: usize,
    pub max_throttle_wait: Option<Duration>,
    pub log_level: String,
}
impl Config {
    pub fn from_args(args: ConfigArgs) -> Result<Self> {
        if args.buffer_size == 0 {
            bail!("prefiller.buffer-size must be > 0");
        }
        if args.checkpoint_dirty_series_limit == 0 {
            bail!("storage.checkpoint-dirty-series-limit must be > 0");
        }
        if args.max_pending_points == 0 {
            bail!("storage.max-pending-points must be > 0");
        }
        if args.retention_period.is_zero() {
            bail!("storage.retention-period must be > 0");
        }
        if args.checkpoint_interval.is_zero() {
            bail!("storage.checkpoint-interval must be > 0");
        }
        Ok(Self {
            storage: StorageOptions {
                path: args.storage_path,
                retention_period: args.retention_period,
                checkpoint_interval: args.checkpoint_interval,
                checkpoint_dirty_series_limit: args.checkpoint_dirty_series_limit,
                max_pending_points: args.max_pending_points,
            },
            buffer_size: args.buffer_size,
            max_throttle_wait: args.max_throttle_wait,
            log_level: args.log_level,
        })
    }
}
