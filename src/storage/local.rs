use std::{
    collections::HashMap,
    fs::OpenOptions,
    io,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    codec::{decode_record, encode_series, MAGIC, MAX_KEY_LEN},
    now_millis, MetricKey, Point, Sample, Time,
};

use super::{
    persist::{Checkpoint, Persister},
    series::Series,
    AppendError, SeriesStorage,
};

pub const DATA_FILE: &str = "series.db";

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub path: PathBuf,
    pub retention_period: Duration,
    pub checkpoint_interval: Duration,
    /// Number of series with unpersisted points that forces a checkpoint.
    pub checkpoint_dirty_series_limit: usize,
    /// Writers are throttled while more points than this wait to be persisted.
    pub max_pending_points: usize,
}

/// Series storage on the local disk.
///
/// Appends land in per-series heads. Heads are drained at each checkpoint
/// and appended to [`DATA_FILE`] by a background persister; only the newest
/// point of each series stays in memory.
#[derive(Debug)]
pub struct LocalStorage {
    options: StorageOptions,
    series: HashMap<MetricKey, Series>,
    dirty_series: usize,
    last_checkpoint: Instant,
    persister: Option<Persister>,
}
impl LocalStorage {
    pub fn new(options: StorageOptions) -> Self {
        Self {
            options,
            series: HashMap::new(),
            dirty_series: 0,
            last_checkpoint: Instant::now(),
            persister: None,
        }
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
    /// Series holding points that were not yet checkpointed.
    pub fn dirty_series(&self) -> usize {
        self.dirty_series
    }
    pub fn pending_points(&self) -> usize {
        self.persister
            .as_ref()
            .map_or(0, |persister| persister.pending_points())
    }

    fn data_path(&self) -> PathBuf {
        self.options.path.join(DATA_FILE)
    }

    fn retention_cutoff(&self) -> Time {
        let retention =
            Time::try_from(self.options.retention_period.as_millis()).unwrap_or(Time::MAX);
        now_millis().saturating_sub(retention)
    }

    /// Restores each series' newest point from the data file and rewrites the
    /// file without points outside the retention period.
    ///
    /// A record cut short at the end of the file is dropped. Any other damage
    /// fails recovery and leaves the data file untouched.
    async fn recover(&mut self) -> anyhow::Result<()> {
        let data_path = self.data_path();
        let tmp_path = self.options.path.join(format!("{DATA_FILE}.tmp"));

        let tmp = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        let mut wtr = tokio::io::BufWriter::new(tmp);
        let expired = match self.compact_into(&mut wtr).await {
            Ok(expired) => expired,
            Err(e) => {
                drop(wtr);
                if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
                    warn!(
                        error = %cleanup,
                        path = %tmp_path.display(),
                        "could not remove temporary file"
                    );
                }
                return Err(e);
            }
        };
        drop(wtr);
        tokio::fs::rename(&tmp_path, &data_path)
            .await
            .with_context(|| format!("replacing {}", data_path.display()))?;
        info!(
            series = self.series.len(),
            expired_points = expired,
            "recovered series from data file"
        );
        Ok(())
    }

    /// Copies the live records of the data file to `wtr`, returning how many
    /// points expired.
    async fn compact_into(
        &mut self,
        wtr: &mut tokio::io::BufWriter<tokio::fs::File>,
    ) -> anyhow::Result<usize> {
        let data_path = self.data_path();
        let cutoff = self.retention_cutoff();
        wtr.write_all(&MAGIC).await?;

        let mut expired = 0;
        match tokio::fs::File::open(&data_path).await {
            Ok(file) => {
                let mut rdr = tokio::io::BufReader::new(file);
                let mut magic = [0; 4];
                let valid = match rdr.read_exact(&mut magic).await {
                    Ok(_) => magic == MAGIC,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
                    Err(e) => return Err(e).context("reading data file header"),
                };
                if !valid {
                    bail!("{} is not a series data file", data_path.display());
                }

                let mut key = MetricKey::new();
                let mut points = vec![];
                let mut buf = vec![];
                loop {
                    match decode_record(&mut rdr, &mut key, &mut points).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            warn!(
                                path = %data_path.display(),
                                "discarding truncated record at end of data file"
                            );
                            break;
                        }
                        Err(e) => {
                            return Err(e)
                                .with_context(|| format!("reading {}", data_path.display()));
                        }
                    }
                    let before = points.len();
                    points.retain(|point| cutoff <= point.time);
                    expired += before - points.len();
                    let Some(newest) = points.iter().max_by_key(|point| point.time) else {
                        continue;
                    };
                    self.series.entry(key.clone()).or_default().recover(*newest);

                    buf.clear();
                    encode_series(&mut buf, &key, &points)?;
                    wtr.write_all(&buf).await?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("opening {}", data_path.display()));
            }
        }

        wtr.flush().await?;
        wtr.get_ref().sync_all().await?;
        Ok(expired)
    }

    fn drain_heads(&mut self) -> Checkpoint {
        let mut checkpoint = Checkpoint::default();
        for (key, series) in &mut self.series {
            if !series.is_dirty() {
                continue;
            }
            let head = series.take_head();
            checkpoint.points += head.len();
            checkpoint.series.push((key.clone(), head));
        }
        self.dirty_series = 0;
        checkpoint
    }

    fn checkpoint(&mut self) -> io::Result<()> {
        self.last_checkpoint = Instant::now();
        let checkpoint = self.drain_heads();
        if checkpoint.is_empty() {
            return Ok(());
        }
        debug!(
            series = checkpoint.series.len(),
            points = checkpoint.points,
            "checkpointing series"
        );
        match &self.persister {
            Some(persister) => persister.submit(checkpoint),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "storage is not running",
            )),
        }
    }
}

impl SeriesStorage for LocalStorage {
    async fn start(&mut self) -> anyhow::Result<()> {
        if self.persister.is_some() {
            bail!("storage is already running");
        }
        let path = &self.options.path;
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("creating storage directory {}", path.display()))?;
        self.recover().await?;

        let data_path = self.data_path();
        let file = OpenOptions::new()
            .append(true)
            .open(&data_path)
            .with_context(|| format!("opening {}", data_path.display()))?;
        self.persister = Some(Persister::spawn(file).context("spawning persister")?);
        self.last_checkpoint = Instant::now();
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let flushed = self.checkpoint();
        let Some(persister) = self.persister.take() else {
            bail!("storage is not running");
        };
        let shutdown = persister.shutdown().await;
        flushed.context("final checkpoint")?;
        shutdown
    }

    fn append(&mut self, sample: &Sample) -> Result<(), AppendError> {
        if self.persister.is_none() {
            return Err(AppendError::Other("storage is not running".into()));
        }
        if sample.time < self.retention_cutoff() {
            return Err(AppendError::Other(format!(
                "sample at {} is outside the retention period",
                sample.time
            )));
        }
        let key = sample.metric.key();
        if MAX_KEY_LEN < key.len() {
            return Err(AppendError::Other(format!(
                "series key of {} bytes exceeds {MAX_KEY_LEN}",
                key.len()
            )));
        }

        let series = self.series.entry(key).or_default();
        let was_dirty = series.is_dirty();
        let point = Point {
            time: sample.time,
            value: sample.value,
        };
        if series.append(point)? && !was_dirty {
            self.dirty_series += 1;
        }

        let limit_reached = self.options.checkpoint_dirty_series_limit <= self.dirty_series;
        if limit_reached || self.options.checkpoint_interval <= self.last_checkpoint.elapsed() {
            self.checkpoint()
                .map_err(|e| AppendError::Other(format!("checkpoint failed: {e}")))?;
        }
        Ok(())
    }

    fn needs_throttling(&self) -> bool {
        self.pending_points() > self.options.max_pending_points
    }
}
