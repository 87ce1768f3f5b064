//! The time-series storage the pipeline writes into.

mod local;
mod persist;
mod series;

use thiserror::Error;

use crate::Sample;

pub use local::{LocalStorage, StorageOptions, DATA_FILE};

/// Why a single sample was not committed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppendError {
    /// The sample is older than the last committed sample of its series.
    #[error("sample timestamp out of order")]
    OutOfOrder,
    /// The series already holds a different value at this timestamp.
    #[error("sample with repeated timestamp but different value")]
    DuplicateTimestamp,
    #[error("{0}")]
    Other(String),
}

/// Storage engine as seen by the ingestion pipeline.
///
/// The pipeline is the only writer; `append` is called in decode order.
#[allow(async_fn_in_trait)]
pub trait SeriesStorage {
    async fn start(&mut self) -> anyhow::Result<()>;
    async fn stop(&mut self) -> anyhow::Result<()>;
    fn append(&mut self, sample: &Sample) -> Result<(), AppendError>;
    /// Whether the storage wants writers to pause.
    fn needs_throttling(&self) -> bool;
}
