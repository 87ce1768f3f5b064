use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::info;

/// Raw exposition lines, each terminated by `\n`.
pub type Batch = Vec<u8>;

/// Accumulates input lines into batches of roughly `max_bytes`.
#[derive(Debug)]
pub struct LineBatcher<R> {
    rdr: R,
    max_bytes: usize,
    line: Vec<u8>,
}
impl<R> LineBatcher<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(rdr: R, max_bytes: usize) -> Self {
        Self {
            rdr,
            max_bytes,
            line: vec![],
        }
    }

    /// Reads lines until the batch reaches `max_bytes` or the input ends.
    ///
    /// Returns `None` only when the input was already exhausted; a partial
    /// batch at end of input is still returned.
    pub async fn next_batch(&mut self) -> io::Result<Option<Batch>> {
        let mut batch = Batch::new();
        loop {
            self.line.clear();
            let n = self.rdr.read_until(b'\n', &mut self.line).await?;
            if n == 0 {
                break;
            }
            let mut line = &self.line[..];
            if let Some(rest) = line.strip_suffix(b"\n") {
                line = rest;
            }
            if let Some(rest) = line.strip_suffix(b"\r") {
                line = rest;
            }
            batch.extend_from_slice(line);
            batch.push(b'\n');
            if batch.len() >= self.max_bytes {
                info!(size = batch.len(), "ingestion buffer full: flushing");
                break;
            }
        }
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}
