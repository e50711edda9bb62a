use std::collections::BTreeMap;

/// Telemetry events sent from pipeline tasks to the progress tracker
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// The reader parsed a batch of raw rows
    RowsParsed { rows: u64 },
    /// A worker finished importing one batch
    BatchImported {
        committed: u64,
        failed: u64,
        bulk_attempts: u64,
        duration_ms: u64,
    },
    /// The failure writer appended rows to the failure file
    FailuresWritten { rows: u64 },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub rows_parsed: u64,
    pub rows_committed: u64,
    pub rows_failed: u64,
    pub rows_written_to_failure_file: u64,
    pub batches_imported: u64,
    pub bulk_attempts: u64,
    /// Batch duration in ms -> number of batches that took that long
    pub batch_durations_ms: BTreeMap<u64, u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::RowsParsed { rows } => {
                self.rows_parsed += rows;
            }
            TelemetryEvent::BatchImported {
                committed,
                failed,
                bulk_attempts,
                duration_ms,
            } => {
                self.rows_committed += committed;
                self.rows_failed += failed;
                self.bulk_attempts += bulk_attempts;
                self.batches_imported += 1;
                *self.batch_durations_ms.entry(*duration_ms).or_default() += 1;
            }
            TelemetryEvent::FailuresWritten { rows } => {
                self.rows_written_to_failure_file += rows;
            }
        }
    }

    /// Rows parsed but not yet committed or failed
    pub fn rows_in_flight(&self) -> u64 {
        self.rows_parsed
            .saturating_sub(self.rows_committed + self.rows_failed)
    }

    /// Nearest-rank percentile of batch durations
    ///
    /// Walks the histogram, so the cost depends on the number of distinct
    /// durations and not on the number of batches.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let total: u64 = self.batch_durations_ms.values().sum();
        if total == 0 {
            return None;
        }

        let rank = (((p / 100.0) * total as f64).ceil() as u64).clamp(1, total);
        let mut seen = 0;
        for (duration, count) in &self.batch_durations_ms {
            seen += count;
            if seen >= rank {
                return Some(*duration);
            }
        }
        self.batch_durations_ms.keys().next_back().copied()
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
