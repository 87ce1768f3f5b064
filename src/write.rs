use tracing::{debug, warn};

use crate::{
    storage::{AppendError, SeriesStorage},
    Sample,
};

/// Outcome counts of writing one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub attempted: usize,
    pub appended: usize,
    pub out_of_order: usize,
    pub duplicates: usize,
    pub other: usize,
}
impl Tally {
    pub fn discarded(&self) -> usize {
        self.out_of_order + self.duplicates + self.other
    }
}

/// Totals over a whole ingestion run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub batches: usize,
    pub decode_failures: usize,
    pub samples: Tally,
}
impl IngestStats {
    pub fn record(&mut self, tally: &Tally) {
        let total = &mut self.samples;
        total.attempted += tally.attempted;
        total.appended += tally.appended;
        total.out_of_order += tally.out_of_order;
        total.duplicates += tally.duplicates;
        total.other += tally.other;
    }
}

/// Appends every sample once, in order. A failed sample is logged and
/// dropped; it never stops the rest of the batch.
pub fn write_all(storage: &mut impl SeriesStorage, samples: &[Sample]) -> Tally {
    let mut tally = Tally::default();
    for sample in samples {
        tally.attempted += 1;
        let Err(e) = storage.append(sample) else {
            tally.appended += 1;
            continue;
        };
        match e {
            AppendError::OutOfOrder => {
                tally.out_of_order += 1;
                debug!(sample = %sample, error = %e, "sample discarded");
            }
            AppendError::DuplicateTimestamp => {
                tally.duplicates += 1;
                debug!(sample = %sample, error = %e, "sample discarded");
            }
            AppendError::Other(_) => {
                tally.other += 1;
                warn!(sample = %sample, error = %e, "sample discarded");
            }
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metric;

    /// Answers appends from a script keyed by metric name.
    #[derive(Default)]
    struct Scripted {
        appended: Vec<String>,
        attempts: Vec<String>,
    }
    impl SeriesStorage for Scripted {
        async fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn append(&mut self, sample: &Sample) -> Result<(), AppendError> {
            let name = sample.metric.name().to_string();
            self.attempts.push(name.clone());
            match name.as_str() {
                "a" => Err(AppendError::OutOfOrder),
                "b" => Err(AppendError::DuplicateTimestamp),
                "x" => Err(AppendError::Other("disk on fire".into())),
                _ => {
                    self.appended.push(name);
                    Ok(())
                }
            }
        }
        fn needs_throttling(&self) -> bool {
            false
        }
    }

    fn samples(names: &[&str]) -> Vec<Sample> {
        names
            .iter()
            .map(|name| Sample {
                metric: Metric::new(*name),
                value: 1.0,
                time: 1,
            })
            .collect()
    }

    #[test]
    fn test_failures_are_classified() {
        let mut storage = Scripted::default();
        let tally = write_all(&mut storage, &samples(&["a", "b", "c"]));
        assert_eq!(
            tally,
            Tally {
                attempted: 3,
                appended: 1,
                out_of_order: 1,
                duplicates: 1,
                other: 0,
            }
        );
        assert_eq!(storage.attempts, vec!["a", "b", "c"]);
        assert_eq!(storage.appended, vec!["c"]);
    }

    #[test]
    fn test_failure_does_not_abort_batch() {
        let mut storage = Scripted::default();
        let tally = write_all(&mut storage, &samples(&["x", "c", "x", "d"]));
        assert_eq!(tally.other, 2);
        assert_eq!(tally.discarded(), 2);
        assert_eq!(storage.appended, vec!["c", "d"]);
    }

    #[test]
    fn test_stats_accumulate_across_batches() {
        let mut stats = IngestStats::default();
        let mut storage = Scripted::default();
        stats.record(&write_all(&mut storage, &samples(&["a", "c"])));
        stats.record(&write_all(&mut storage, &samples(&["a", "b"])));
        assert_eq!(stats.samples.attempted, 4);
        assert_eq!(stats.samples.appended, 1);
        assert_eq!(stats.samples.out_of_order, 2);
        assert_eq!(stats.samples.duplicates, 1);
    }
}
