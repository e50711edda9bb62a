use anyhow::{Result, anyhow};
use derive_builder::Builder;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};

use super::failure_sink::{FailureSink, FailureSinkReport};
use super::importer::Importer;
use super::worker::{FailureMessage, WorkMessage, Worker, WorkerReport};
use crate::config::{PROGRESS_REFRESH_INTERVAL, QUEUE_CAPACITY_FACTOR};
use crate::db::{Schema, StorageClient};
use crate::entity::EntityBuilder;
use crate::formats::{ChunkReader, DecodePolicy, InputFileConfig};
use crate::io::ByteReader;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Configuration for one pipeline run
#[derive(Debug, Clone, Builder)]
pub struct PipelineConfig {
    #[builder(setter(into))]
    pub table_name: String,
    pub chunk_size_bytes: usize,
    #[builder(default)]
    pub decode_policy: DecodePolicy,
    #[builder(default)]
    pub quiet: bool,
    /// Receives a copy of every telemetry event
    #[builder(default)]
    pub progress_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

/// Totals of a completed pipeline run
#[derive(Debug)]
pub struct PipelineResult {
    pub rows_read: u64,
    pub rows_committed: u64,
    pub rows_failed: u64,
    pub failure_report: FailureSinkReport,
    pub stats: ProgressStats,
    pub duration: Duration,
    pub worker_reports: Vec<WorkerReport>,
}

/// Wires the chunk reader, the worker pool and the failure writer together
///
/// The reader feeds batches into a bounded task queue that N workers share.
/// Failed rows travel on a second bounded queue to a single writer task.
pub struct Pipeline {
    schema: Arc<Schema>,
    file_config: InputFileConfig,
}

impl Pipeline {
    pub fn new(schema: Arc<Schema>, file_config: InputFileConfig) -> Self {
        Self {
            schema,
            file_config,
        }
    }

    /// Run the import with one worker per storage client
    ///
    /// Shutdown order: the reader finishes, one shutdown message per worker is
    /// enqueued, all workers are joined, then the failure writer is stopped.
    pub async fn run<R: ByteReader + 'static>(
        &self,
        config: &PipelineConfig,
        reader: R,
        storages: Vec<Box<dyn StorageClient>>,
        failure_sink: FailureSink,
    ) -> Result<PipelineResult> {
        let start_time = Instant::now();
        let worker_count = storages.len();
        if worker_count == 0 {
            return Err(anyhow!("Pipeline needs at least one storage client"));
        }
        let queue_capacity = worker_count * QUEUE_CAPACITY_FACTOR;

        let (tasks_tx, tasks_rx) = mpsc::channel::<WorkMessage>(queue_capacity);
        let (failures_tx, failures_rx) = mpsc::channel::<FailureMessage>(queue_capacity);
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();

        let writer_handle = tokio::spawn(failure_sink.run(failures_rx, telemetry_tx.clone()));
        let worker_handles =
            self.spawn_worker_pool(config, storages, tasks_rx, &failures_tx, &telemetry_tx);
        let progress_handle = Self::setup_progress_tracking(config, telemetry_rx);

        let read_result = self
            .feed_tasks(config, reader, &tasks_tx, &telemetry_tx)
            .await;

        // One shutdown per worker; a closed queue means every worker already exited
        for _ in 0..worker_count {
            if tasks_tx.send(WorkMessage::Shutdown).await.is_err() {
                break;
            }
        }
        drop(tasks_tx);

        let worker_results = futures::future::join_all(worker_handles).await;
        let mut worker_reports = Vec::with_capacity(worker_count);
        let mut worker_failures = 0;
        for (i, result) in worker_results.into_iter().enumerate() {
            match result {
                Ok(Ok(report)) => worker_reports.push(report),
                Ok(Err(e)) => {
                    worker_failures += 1;
                    warn!("Worker {} failed: {:#}", i, e);
                }
                Err(e) => {
                    worker_failures += 1;
                    warn!("Worker {} panicked: {:#}", i, e);
                }
            }
        }

        // Workers are done, so no failed rows can follow the shutdown message
        let _ = failures_tx.send(FailureMessage::Shutdown).await;
        drop(failures_tx);
        let failure_report = writer_handle
            .await
            .map_err(|e| anyhow!("Failure writer panicked: {}", e))?;

        drop(telemetry_tx);
        let stats = progress_handle
            .await
            .map_err(|e| anyhow!("Progress tracker panicked: {}", e))?;

        let rows_read = read_result?;
        if worker_failures > 0 {
            return Err(anyhow!("{} of {} workers failed", worker_failures, worker_count));
        }

        let duration = start_time.elapsed();
        let rows_committed: u64 = worker_reports.iter().map(|r| r.rows_committed).sum();
        let rows_failed: u64 = worker_reports.iter().map(|r| r.rows_failed).sum();

        info!(
            "Import complete: {} rows read, {} committed, {} failed in {:.2}s",
            rows_read,
            rows_committed,
            rows_failed,
            duration.as_secs_f64()
        );

        Ok(PipelineResult {
            rows_read,
            rows_committed,
            rows_failed,
            failure_report,
            stats,
            duration,
            worker_reports,
        })
    }

    /// Read the input and enqueue non-empty batches; returns the rows read
    async fn feed_tasks<R: ByteReader + 'static>(
        &self,
        config: &PipelineConfig,
        reader: R,
        tasks_tx: &mpsc::Sender<WorkMessage>,
        telemetry_tx: &mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Result<u64> {
        let mut batches = ChunkReader::new(
            reader,
            self.file_config.clone(),
            config.chunk_size_bytes,
            config.decode_policy,
            info_span!("chunk_reader"),
        )
        .read_rows_in_chunks();

        let mut rows_read = 0u64;
        while let Some(batch) = batches.next().await {
            let rows = batch?;
            if rows.is_empty() {
                continue;
            }

            rows_read += rows.len() as u64;
            let _ = telemetry_tx.send(TelemetryEvent::RowsParsed {
                rows: rows.len() as u64,
            });
            tasks_tx
                .send(WorkMessage::Batch(rows))
                .await
                .map_err(|_| anyhow!("All workers stopped before the input was consumed"))?;
        }

        Ok(rows_read)
    }

    /// Spawn one worker task per storage client
    fn spawn_worker_pool(
        &self,
        config: &PipelineConfig,
        storages: Vec<Box<dyn StorageClient>>,
        tasks_rx: mpsc::Receiver<WorkMessage>,
        failures_tx: &mpsc::Sender<FailureMessage>,
        telemetry_tx: &mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Vec<JoinHandle<Result<WorkerReport>>> {
        info!("Spawning {} workers...", storages.len());
        let tasks = Arc::new(Mutex::new(tasks_rx));

        storages
            .into_iter()
            .enumerate()
            .map(|(worker_id, storage)| {
                let span = info_span!("worker", worker_id);
                let importer_span =
                    info_span!(parent: &span, "importer", table = %config.table_name);
                let importer = Importer::new(
                    EntityBuilder::new(Arc::clone(&self.schema), importer_span.clone()),
                    storage,
                    config.table_name.clone(),
                    importer_span,
                );
                let worker = Worker::new(
                    worker_id,
                    importer,
                    Arc::clone(&tasks),
                    failures_tx.clone(),
                    telemetry_tx.clone(),
                    span,
                );
                tokio::spawn(worker.run())
            })
            .collect()
    }

    /// Aggregate telemetry, drawing a spinner unless quiet
    fn setup_progress_tracking(
        config: &PipelineConfig,
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> JoinHandle<ProgressStats> {
        let bar = if config.quiet {
            None
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            Some(bar)
        };
        let forward_tx = config.progress_tx.clone();

        tokio::spawn(async move {
            let mut stats = ProgressStats::new();
            let mut last_refresh = Instant::now();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);
                if let Some(tx) = &forward_tx {
                    let _ = tx.send(event);
                }

                if let Some(bar) = &bar {
                    if last_refresh.elapsed() >= PROGRESS_REFRESH_INTERVAL {
                        bar.set_message(progress_message(&stats));
                        last_refresh = Instant::now();
                    }
                }
            }

            if let Some(bar) = bar {
                bar.finish_with_message(progress_message(&stats));
            }
            stats
        })
    }
}

fn progress_message(stats: &ProgressStats) -> String {
    let mut message = format!(
        "Rows parsed: {} | committed: {} | failed: {} | in flight: {}",
        stats.rows_parsed,
        stats.rows_committed,
        stats.rows_failed,
        stats.rows_in_flight()
    );
    if let (Some(p50), Some(p90), Some(p99)) = stats.get_percentiles() {
        message.push_str(&format!(
            " | batch p50: {}ms, p90: {}ms, p99: {}ms",
            p50, p90, p99
        ));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::{MemoryByteReader, MockStorage, StorageLog, int_schema};
    use tempfile::TempDir;
    use tracing::Span;

    fn storages(log: &StorageLog, count: usize) -> Vec<Box<dyn StorageClient>> {
        (0..count)
            .map(|_| Box::new(MockStorage::new(log.clone())) as Box<dyn StorageClient>)
            .collect()
    }

    fn config(chunk_size_bytes: usize) -> PipelineConfig {
        PipelineConfigBuilder::default()
            .table_name("t")
            .chunk_size_bytes(chunk_size_bytes)
            .quiet(true)
            .build()
            .unwrap()
    }

    fn input(rows: usize) -> String {
        let mut text = String::from("n\n");
        for i in 0..rows {
            let cell = match i % 50 {
                7 => "-1".to_string(),
                13 => "bad".to_string(),
                _ => i.to_string(),
            };
            text.push_str(&cell);
            text.push('\n');
        }
        text
    }

    #[tokio::test]
    async fn test_every_row_accounted_for() {
        let dir = TempDir::new().unwrap();
        let fail_path = dir.path().join("failed.csv");
        let log = StorageLog::default();
        let pipeline = Pipeline::new(Arc::new(int_schema()), InputFileConfig::csv());

        let result = pipeline
            .run(
                &config(64),
                MemoryByteReader::new(input(1000)),
                storages(&log, 4),
                FailureSink::new(&fail_path, InputFileConfig::csv(), Span::none()),
            )
            .await
            .unwrap();

        assert_eq!(result.rows_read, 1000);
        assert_eq!(result.rows_failed, 40);
        assert_eq!(result.rows_committed, 960);
        assert_eq!(result.failure_report.rows_written, 40);
        assert_eq!(result.worker_reports.len(), 4);
        assert_eq!(log.stored().len(), 960);
        assert_eq!(log.closed(), 4);

        let failed_lines = std::fs::read_to_string(&fail_path).unwrap();
        let mut failed: Vec<&str> = failed_lines.lines().collect();
        failed.sort_unstable();
        failed.dedup();
        assert_eq!(failed, vec!["-1", "bad"]);
        assert_eq!(failed_lines.lines().count(), 40);
    }

    #[tokio::test]
    async fn test_result_independent_of_worker_count_and_chunk_size() {
        for (workers, chunk_size) in [(1, 1), (2, 7), (8, 4096)] {
            let dir = TempDir::new().unwrap();
            let log = StorageLog::default();
            let pipeline = Pipeline::new(Arc::new(int_schema()), InputFileConfig::csv());

            let result = pipeline
                .run(
                    &config(chunk_size),
                    MemoryByteReader::new(input(200)),
                    storages(&log, workers),
                    FailureSink::new(dir.path().join("f"), InputFileConfig::csv(), Span::none()),
                )
                .await
                .unwrap();

            assert_eq!(result.rows_committed, 192, "workers={}", workers);
            assert_eq!(result.rows_failed, 8, "workers={}", workers);
            let mut stored = log.stored();
            stored.sort_unstable();
            assert_eq!(stored.len(), 192);
        }
    }

    #[tokio::test]
    async fn test_progress_events_forwarded() {
        let dir = TempDir::new().unwrap();
        let log = StorageLog::default();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut config = config(16);
        config.progress_tx = Some(progress_tx);

        let result = Pipeline::new(Arc::new(int_schema()), InputFileConfig::csv())
            .run(
                &config,
                MemoryByteReader::new(input(100)),
                storages(&log, 2),
                FailureSink::new(dir.path().join("f"), InputFileConfig::csv(), Span::none()),
            )
            .await
            .unwrap();

        let mut stats = ProgressStats::new();
        while let Ok(event) = progress_rx.try_recv() {
            stats.update(&event);
        }
        assert_eq!(stats.rows_parsed, 100);
        assert_eq!(stats.rows_committed, result.rows_committed);
        assert_eq!(stats.rows_failed, result.rows_failed);
        assert_eq!(stats.rows_written_to_failure_file, 4);
    }

    #[tokio::test]
    async fn test_decode_failure_fails_fast_after_shutting_down_workers() {
        let dir = TempDir::new().unwrap();
        let log = StorageLog::default();
        let mut config = config(4);
        config.decode_policy = DecodePolicy::FailFast;

        let result = Pipeline::new(Arc::new(int_schema()), InputFileConfig::csv())
            .run(
                &config,
                MemoryByteReader::new(b"n\n1\n2\n\xff\xfe\n3\n".to_vec()),
                storages(&log, 2),
                FailureSink::new(dir.path().join("f"), InputFileConfig::csv(), Span::none()),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(log.closed(), 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let dir = TempDir::new().unwrap();
        let log = StorageLog::default();

        let result = Pipeline::new(Arc::new(int_schema()), InputFileConfig::csv())
            .run(
                &config(16),
                MemoryByteReader::new(Vec::new()),
                storages(&log, 3),
                FailureSink::new(dir.path().join("f"), InputFileConfig::csv(), Span::none()),
            )
            .await
            .unwrap();

        assert_eq!(result.rows_read, 0);
        assert_eq!(result.rows_committed, 0);
        assert!(!dir.path().join("f").exists());
    }

    #[test]
    fn test_progress_message() {
        let mut stats = ProgressStats::new();
        stats.update(&TelemetryEvent::RowsParsed { rows: 50 });
        assert_eq!(
            progress_message(&stats),
            "Rows parsed: 50 | committed: 0 | failed: 0 | in flight: 50"
        );

        stats.update(&TelemetryEvent::BatchImported {
            committed: 18,
            failed: 2,
            bulk_attempts: 1,
            duration_ms: 7,
        });
        assert_eq!(
            progress_message(&stats),
            "Rows parsed: 50 | committed: 18 | failed: 2 | in flight: 30 \
             | batch p50: 7ms, p90: 7ms, p99: 7ms"
        );
    }

    #[tokio::test]
    async fn test_no_storage_clients_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = Pipeline::new(Arc::new(int_schema()), InputFileConfig::csv())
            .run(
                &config(16),
                MemoryByteReader::new("n\n1\n"),
                Vec::new(),
                FailureSink::new(dir.path().join("f"), InputFileConfig::csv(), Span::none()),
            )
            .await;

        assert!(result.is_err());
    }
}
