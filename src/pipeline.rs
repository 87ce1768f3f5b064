//! Drives ingestion: read a batch, decode it, wait for the storage, write it.

use anyhow::{Context, Result};
use tokio::io::AsyncBufRead;
use tracing::{debug, error, info};

use crate::{
    buf::LineBatcher,
    config::Config,
    exposition, now_millis,
    storage::SeriesStorage,
    throttle::ThrottleGate,
    write::{write_all, IngestStats},
    Time,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
pub struct Pipeline<S> {
    storage: S,
    gate: ThrottleGate,
    buffer_size: usize,
    clock: fn() -> Time,
    state: State,
    stats: IngestStats,
}
impl<S> Pipeline<S>
where
    S: SeriesStorage,
{
    pub fn new(storage: S, buffer_size: usize, gate: ThrottleGate) -> Self {
        Self {
            storage,
            gate,
            buffer_size,
            clock: now_millis,
            state: State::Starting,
            stats: IngestStats::default(),
        }
    }
    pub fn from_config(storage: S, config: &Config) -> Self {
        let gate = ThrottleGate::new(config.max_throttle_wait);
        Self::new(storage, config.buffer_size, gate)
    }
    /// Replaces the source of the timestamp stamped on each batch.
    pub fn with_clock(mut self, clock: fn() -> Time) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }
    pub fn storage(&self) -> &S {
        &self.storage
    }
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Ingests `input` until it is exhausted.
    ///
    /// Fails if the storage cannot start or the input cannot be read. Once
    /// started, the storage is stopped exactly once; a failing stop is only
    /// logged.
    pub async fn run<R>(&mut self, input: R) -> Result<IngestStats>
    where
        R: AsyncBufRead + Unpin,
    {
        self.state = State::Starting;
        info!("starting the storage engine");
        self.storage
            .start()
            .await
            .context("opening series storage")?;

        self.state = State::Running;
        let ingested = self.ingest(input).await;

        self.state = State::Draining;
        let total = &self.stats.samples;
        info!(
            batches = self.stats.batches,
            decode_failures = self.stats.decode_failures,
            appended = total.appended,
            out_of_order = total.out_of_order,
            duplicates = total.duplicates,
            other_failures = total.other,
            "shutting down"
        );
        if let Err(e) = self.storage.stop().await {
            error!(error = %format!("{e:#}"), "error stopping storage");
        }
        self.state = State::Stopped;

        ingested?;
        Ok(self.stats)
    }

    async fn ingest<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut batcher = LineBatcher::new(input, self.buffer_size);
        while let Some(batch) = batcher.next_batch().await.context("reading input")? {
            self.stats.batches += 1;
            let timestamp = (self.clock)();
            let samples = match exposition::decode(&batch, timestamp) {
                Ok(samples) => samples,
                Err(e) => {
                    self.stats.decode_failures += 1;
                    error!(error = %e, bytes = batch.len(), "could not decode batch");
                    continue;
                }
            };

            self.gate.await_ready(&self.storage).await?;

            let tally = write_all(&mut self.storage, &samples);
            debug!(
                samples = tally.attempted,
                appended = tally.appended,
                out_of_order = tally.out_of_order,
                duplicates = tally.duplicates,
                other_failures = tally.other,
                "batch written"
            );
            self.stats.record(&tally);
        }
        Ok(())
    }
}
