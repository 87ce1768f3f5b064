use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::storage::SeriesStorage;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("storage still throttling after {waited:?}")]
    Timeout { waited: Duration },
}

/// Holds writers back while the storage asks for throttling.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleGate {
    poll_interval: Duration,
    max_wait: Option<Duration>,
}
impl ThrottleGate {
    /// Without `max_wait` the gate waits as long as the storage throttles.
    pub fn new(max_wait: Option<Duration>) -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            max_wait,
        }
    }

    /// Polls the storage until it stops throttling and returns how many
    /// intervals were slept.
    pub async fn await_ready(&self, storage: &impl SeriesStorage) -> Result<u32, ThrottleError> {
        let started = Instant::now();
        let mut waits = 0;
        while storage.needs_throttling() {
            if let Some(max_wait) = self.max_wait {
                let waited = started.elapsed();
                if max_wait <= waited {
                    return Err(ThrottleError::Timeout { waited });
                }
            }
            debug!(
                interval = ?self.poll_interval,
                "waiting for storage to be ready for more data"
            );
            tokio::time::sleep(self.poll_interval).await;
            waits += 1;
        }
        Ok(waits)
    }
}
impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{storage::AppendError, Sample};

    /// Throttles for the first `throttled_polls` polls.
    struct Backlog {
        throttled_polls: u32,
        polls: Cell<u32>,
    }
    impl SeriesStorage for Backlog {
        async fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn append(&mut self, _sample: &Sample) -> Result<(), AppendError> {
            Ok(())
        }
        fn needs_throttling(&self) -> bool {
            let polls = self.polls.get();
            self.polls.set(polls + 1);
            polls < self.throttled_polls
        }
    }

    fn backlog(throttled_polls: u32) -> Backlog {
        Backlog {
            throttled_polls,
            polls: Cell::new(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_storage_passes_immediately() {
        let storage = backlog(0);
        let before = Instant::now();
        assert_eq!(ThrottleGate::default().await_ready(&storage).await, Ok(0));
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(storage.polls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_one_interval_per_throttled_poll() {
        let storage = backlog(2);
        let before = Instant::now();
        assert_eq!(ThrottleGate::default().await_ready(&storage).await, Ok(2));
        assert_eq!(before.elapsed(), 2 * POLL_INTERVAL);
        assert_eq!(storage.polls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_gives_up() {
        let storage = backlog(u32::MAX);
        let gate = ThrottleGate::new(Some(Duration::from_millis(250)));
        let err = gate.await_ready(&storage).await.unwrap_err();
        assert_eq!(
            err,
            ThrottleError::Timeout {
                waited: Duration::from_millis(300)
            }
        );
    }
}
