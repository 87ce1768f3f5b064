use std::{
    fs::File,
    io::{self, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, error};

use crate::{codec::encode_series, MetricKey, Point};

/// Series heads drained at one checkpoint.
#[derive(Debug, Default)]
pub(super) struct Checkpoint {
    pub series: Vec<(MetricKey, Vec<Point>)>,
    pub points: usize,
}
impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Append-only file the persister writes checkpoints to.
pub(super) trait DataFile: Write + Send + 'static {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}
impl DataFile for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Background thread appending checkpoints to the data file.
#[derive(Debug)]
pub(super) struct Persister {
    tx: mpsc::Sender<Checkpoint>,
    handle: thread::JoinHandle<()>,
    pending: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}
impl Persister {
    pub fn spawn(file: impl DataFile) -> io::Result<Self> {
        let committed = file.len()?;
        let (tx, rx) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let handle = {
            let pending = pending.clone();
            let failures = failures.clone();
            thread::Builder::new()
                .name("persister".into())
                .spawn(move || persist_loop(rx, file, committed, &pending, &failures))?
        };
        Ok(Self {
            tx,
            handle,
            pending,
            failures,
        })
    }

    /// Points submitted but not yet written.
    pub fn pending_points(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn submit(&self, checkpoint: Checkpoint) -> io::Result<()> {
        let points = checkpoint.points;
        self.pending.fetch_add(points, Ordering::AcqRel);
        if self.tx.send(checkpoint).is_err() {
            self.pending.fetch_sub(points, Ordering::AcqRel);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "persister is not running",
            ));
        }
        Ok(())
    }

    /// Waits for every submitted checkpoint to be written.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let Self {
            tx,
            handle,
            failures,
            ..
        } = self;
        drop(tx);
        tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("waiting for persister")?
            .map_err(|_| anyhow!("persister thread panicked"))?;
        let failures = failures.load(Ordering::Acquire);
        if failures > 0 {
            bail!("{failures} checkpoints failed to persist");
        }
        Ok(())
    }
}

/// Writes each checkpoint whole or not at all.
///
/// A failed write is cut back to the last committed length. If that fails
/// too, the file is left alone and every later checkpoint fails.
fn persist_loop(
    rx: mpsc::Receiver<Checkpoint>,
    mut file: impl DataFile,
    committed: u64,
    pending: &AtomicUsize,
    failures: &AtomicUsize,
) {
    let mut committed = Some(committed);
    let mut buf = vec![];
    for checkpoint in rx {
        let written = match committed {
            Some(len) => {
                let written = write_checkpoint(&mut file, &mut buf, &checkpoint);
                match &written {
                    Ok(()) => committed = Some(len + buf.len() as u64),
                    Err(_) => {
                        if let Err(e) = file.truncate(len) {
                            error!(error = %e, "could not roll back data file, persisting stops");
                            committed = None;
                        }
                    }
                }
                written
            }
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "data file holds a partial checkpoint",
            )),
        };
        match written {
            Ok(()) => debug!(
                series = checkpoint.series.len(),
                points = checkpoint.points,
                "checkpoint persisted"
            ),
            Err(e) => {
                failures.fetch_add(1, Ordering::AcqRel);
                error!(
                    error = %e,
                    series = checkpoint.series.len(),
                    points = checkpoint.points,
                    "failed to persist checkpoint"
                );
            }
        }
        pending.fetch_sub(checkpoint.points, Ordering::AcqRel);
    }
}

fn write_checkpoint(
    file: &mut impl DataFile,
    buf: &mut Vec<u8>,
    checkpoint: &Checkpoint,
) -> io::Result<()> {
    buf.clear();
    for (key, points) in &checkpoint.series {
        encode_series(buf, key, points)?;
    }
    file.write_all(buf)?;
    file.sync()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::codec::decode_record;

    /// In-memory data file whose writes can be made to fail halfway.
    #[derive(Clone, Default)]
    struct MemFile {
        bytes: Arc<Mutex<Vec<u8>>>,
        /// Each flag fails one upcoming write after keeping half its bytes.
        fail_writes: Arc<Mutex<Vec<bool>>>,
        fail_truncate: bool,
    }
    impl Write for MemFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut fail_writes = self.fail_writes.lock().unwrap();
            let fail = !fail_writes.is_empty() && fail_writes.remove(0);
            let mut bytes = self.bytes.lock().unwrap();
            if fail {
                bytes.extend_from_slice(&buf[..buf.len() / 2]);
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            bytes.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl DataFile for MemFile {
        fn len(&self) -> io::Result<u64> {
            Ok(self.bytes.lock().unwrap().len() as u64)
        }
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.fail_truncate {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only"));
            }
            self.bytes.lock().unwrap().truncate(len as usize);
            Ok(())
        }
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn checkpoint(key: &str, time: i64) -> Checkpoint {
        Checkpoint {
            series: vec![(key.to_string(), vec![Point { time, value: 1.0 }])],
            points: 1,
        }
    }

    async fn keys(bytes: &[u8]) -> Vec<MetricKey> {
        let mut rdr = bytes;
        let mut key = MetricKey::new();
        let mut points = vec![];
        let mut keys = vec![];
        while decode_record(&mut rdr, &mut key, &mut points).await.unwrap() {
            keys.push(key.clone());
        }
        keys
    }

    #[tokio::test]
    async fn test_failed_write_is_rolled_back() {
        let file = MemFile {
            fail_writes: Arc::new(Mutex::new(vec![false, true])),
            ..Default::default()
        };
        let persister = Persister::spawn(file.clone()).unwrap();
        for (key, time) in [("a", 1), ("b", 2), ("c", 3)] {
            persister.submit(checkpoint(key, time)).unwrap();
        }
        let err = persister.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("1 checkpoints"));

        let bytes = file.bytes.lock().unwrap().clone();
        assert_eq!(keys(&bytes).await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_unrecoverable_write_stops_persisting() {
        let file = MemFile {
            fail_writes: Arc::new(Mutex::new(vec![false, true])),
            fail_truncate: true,
            ..Default::default()
        };
        let persister = Persister::spawn(file.clone()).unwrap();
        for (key, time) in [("a", 1), ("b", 2), ("c", 3)] {
            persister.submit(checkpoint(key, time)).unwrap();
        }
        let err = persister.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("2 checkpoints"));

        let mut expected = vec![];
        encode_series(&mut expected, &"a".to_string(), &[Point { time: 1, value: 1.0 }]).unwrap();
        let mut torn = vec![];
        encode_series(&mut torn, &"b".to_string(), &[Point { time: 2, value: 1.0 }]).unwrap();
        expected.extend_from_slice(&torn[..torn.len() / 2]);
        assert_eq!(*file.bytes.lock().unwrap(), expected);
    }
}
