use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{Span, debug};

use crate::config::INSERT_ONE_BY_ONE_THRESHOLD;
use crate::db::StorageClient;
use crate::entity::{Entity, EntityBuilder};
use crate::formats::RawRow;

/// Result of importing one batch of raw rows
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub committed: usize,
    /// Rows that failed conversion or insertion, in their original text form
    pub failed: Vec<RawRow>,
    pub bulk_attempts: usize,
    pub duration: Duration,
}

/// Converts and stores batches, isolating bad rows by bisection
pub struct Importer {
    builder: EntityBuilder,
    storage: Box<dyn StorageClient>,
    table: String,
    span: Span,
}

impl Importer {
    pub fn new(
        builder: EntityBuilder,
        storage: Box<dyn StorageClient>,
        table: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            builder,
            storage,
            table: table.into(),
            span,
        }
    }

    /// Convert and insert `rows`; every input row ends up committed or failed
    ///
    /// A rejected bulk insert is split at its midpoint and both halves are
    /// retried; ranges at or below [`INSERT_ONE_BY_ONE_THRESHOLD`] are
    /// inserted row by row.
    pub async fn parse_and_import(&mut self, rows: Vec<RawRow>) -> ImportOutcome {
        let start = Instant::now();
        let total = rows.len();

        let (converted, mut failed) = self.builder.build_batch(rows);
        let (raw_rows, entities): (Vec<RawRow>, Vec<Entity>) = converted.into_iter().unzip();

        let mut bulk_attempts = 0;
        let mut rejected = vec![false; entities.len()];
        let mut pending: Vec<Range<usize>> = vec![0..entities.len()];

        while let Some(range) = pending.pop() {
            if range.is_empty() {
                continue;
            }
            let slice = &entities[range.clone()];

            if slice.len() <= INSERT_ONE_BY_ONE_THRESHOLD {
                for index in self.storage.insert_one_by_one(&self.table, slice).await {
                    rejected[range.start + index] = true;
                }
                continue;
            }

            bulk_attempts += 1;
            if self.storage.insert_in_batch(&self.table, slice).await {
                continue;
            }

            let mid = range.start + slice.len() / 2;
            pending.push(mid..range.end);
            pending.push(range.start..mid);
        }

        failed.extend(
            raw_rows
                .into_iter()
                .zip(rejected)
                .filter_map(|(row, is_rejected)| is_rejected.then_some(row)),
        );

        let outcome = ImportOutcome {
            committed: total - failed.len(),
            failed,
            bulk_attempts,
            duration: start.elapsed(),
        };

        debug!(
            parent: &self.span,
            rows = total,
            committed = outcome.committed,
            failed = outcome.failed.len(),
            bulk_attempts,
            duration_ms = outcome.duration.as_millis() as u64,
            "Imported batch"
        );

        outcome
    }

    /// Release the storage client
    pub async fn close(self) -> anyhow::Result<()> {
        self.storage.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::{MockStorage, StorageLog, int_schema};
    use std::sync::Arc;

    fn rows(values: impl IntoIterator<Item = String>) -> Vec<RawRow> {
        values.into_iter().map(|v| RawRow { cells: vec![v] }).collect()
    }

    fn importer(log: &StorageLog) -> Importer {
        Importer::new(
            EntityBuilder::new(Arc::new(int_schema()), Span::none()),
            Box::new(MockStorage::new(log.clone())),
            "t",
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_clean_batch_commits_in_one_attempt() {
        let log = StorageLog::default();
        let outcome = importer(&log)
            .parse_and_import(rows((0..100).map(|i| i.to_string())))
            .await;

        assert_eq!(outcome.committed, 100);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.bulk_attempts, 1);
        assert_eq!(log.stored().len(), 100);
    }

    #[tokio::test]
    async fn test_single_bad_row_isolated_in_logarithmic_attempts() {
        let log = StorageLog::default();
        let n = 1024;
        let input: Vec<String> = (0..n)
            .map(|i| if i == 700 { "-1".to_string() } else { i.to_string() })
            .collect();

        let outcome = importer(&log).parse_and_import(rows(input)).await;

        assert_eq!(outcome.committed, n - 1);
        assert_eq!(outcome.failed, rows(["-1".to_string()]));
        let bound = 2 * (n as f64).log2().ceil() as usize + 1;
        assert!(
            outcome.bulk_attempts <= bound,
            "{} attempts exceeds {}",
            outcome.bulk_attempts,
            bound
        );
        assert_eq!(log.stored().len(), n - 1);
    }

    #[tokio::test]
    async fn test_every_row_committed_or_failed_exactly_once() {
        let log = StorageLog::default();
        let input: Vec<String> = (0..300)
            .map(|i| match i % 37 {
                0 => "-5".to_string(),
                1 => "not a number".to_string(),
                _ => i.to_string(),
            })
            .collect();

        let outcome = importer(&log).parse_and_import(rows(input.clone())).await;

        let stored = log.stored();
        assert_eq!(outcome.committed + outcome.failed.len(), input.len());
        assert_eq!(stored.len(), outcome.committed);
        for row in &outcome.failed {
            let cell = &row.cells[0];
            assert!(cell == "-5" || cell == "not a number", "unexpected failure {}", cell);
        }
        let mut unique = stored.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), stored.len());
    }

    #[tokio::test]
    async fn test_conversion_failures_never_reach_storage() {
        let log = StorageLog::default();
        let outcome = importer(&log)
            .parse_and_import(rows(["x".to_string(), "".to_string(), "3".to_string()]))
            .await;

        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(log.stored(), vec![3]);
    }

    #[tokio::test]
    async fn test_small_batch_goes_straight_to_one_by_one() {
        let log = StorageLog::default();
        let outcome = importer(&log)
            .parse_and_import(rows((0..INSERT_ONE_BY_ONE_THRESHOLD).map(|i| i.to_string())))
            .await;

        assert_eq!(outcome.bulk_attempts, 0);
        assert_eq!(outcome.committed, INSERT_ONE_BY_ONE_THRESHOLD);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let log = StorageLog::default();
        let outcome = importer(&log).parse_and_import(Vec::new()).await;

        assert_eq!(outcome.committed, 0);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.bulk_attempts, 0);
    }
}
