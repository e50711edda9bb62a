use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{Span, debug, warn};

use super::importer::Importer;
use crate::formats::RawRow;
use crate::telemetry::TelemetryEvent;

/// Message on the task queue
#[derive(Debug)]
pub enum WorkMessage {
    Batch(Vec<RawRow>),
    /// Each worker consumes exactly one and then stops
    Shutdown,
}

/// Message on the failure queue
#[derive(Debug)]
pub enum FailureMessage {
    Rows(Vec<RawRow>),
    Shutdown,
}

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    Terminated,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        matches!(
            (self, next),
            (WorkerState::Idle, WorkerState::Processing)
                | (WorkerState::Processing, WorkerState::Idle)
                | (WorkerState::Idle, WorkerState::Terminated)
        )
    }
}

/// Per-worker totals, returned when the worker terminates
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub batches: u64,
    pub rows_committed: u64,
    pub rows_failed: u64,
}

/// Worker that imports batches from the shared task queue
pub struct Worker {
    pub worker_id: usize,
    importer: Importer,
    tasks: Arc<Mutex<mpsc::Receiver<WorkMessage>>>,
    failures_tx: mpsc::Sender<FailureMessage>,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    state: WorkerState,
    span: Span,
}

impl Worker {
    pub fn new(
        worker_id: usize,
        importer: Importer,
        tasks: Arc<Mutex<mpsc::Receiver<WorkMessage>>>,
        failures_tx: mpsc::Sender<FailureMessage>,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
        span: Span,
    ) -> Self {
        Self {
            worker_id,
            importer,
            tasks,
            failures_tx,
            telemetry_tx,
            state: WorkerState::Idle,
            span,
        }
    }

    fn transition(&mut self, next: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            bail!(
                "Worker {} cannot move from {:?} to {:?}",
                self.worker_id,
                self.state,
                next
            );
        }
        self.state = next;
        Ok(())
    }

    /// Take batches until a shutdown message arrives, then release storage
    pub async fn run(mut self) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            worker_id: self.worker_id,
            ..Default::default()
        };

        loop {
            let message = { self.tasks.lock().await.recv().await };
            let rows = match message {
                Some(WorkMessage::Batch(rows)) => rows,
                Some(WorkMessage::Shutdown) => break,
                None => {
                    warn!(parent: &self.span, "Task queue closed without shutdown message");
                    break;
                }
            };

            self.transition(WorkerState::Processing)?;
            let outcome = self.importer.parse_and_import(rows).await;

            report.batches += 1;
            report.rows_committed += outcome.committed as u64;
            report.rows_failed += outcome.failed.len() as u64;
            let _ = self.telemetry_tx.send(TelemetryEvent::BatchImported {
                committed: outcome.committed as u64,
                failed: outcome.failed.len() as u64,
                bulk_attempts: outcome.bulk_attempts as u64,
                duration_ms: outcome.duration.as_millis() as u64,
            });

            if !outcome.failed.is_empty() {
                self.failures_tx
                    .send(FailureMessage::Rows(outcome.failed))
                    .await
                    .context("Failure queue closed")?;
            }
            self.transition(WorkerState::Idle)?;
        }

        self.transition(WorkerState::Terminated)?;
        let Self { importer, span, .. } = self;
        if let Err(e) = importer.close().await {
            warn!(parent: &span, "Failed to close storage client: {:#}", e);
        }

        debug!(
            parent: &span,
            batches = report.batches,
            committed = report.rows_committed,
            failed = report.rows_failed,
            "Worker terminated"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::{MockStorage, StorageLog, int_schema};
    use crate::entity::EntityBuilder;

    fn spawn_worker(
        log: &StorageLog,
        tasks: Arc<Mutex<mpsc::Receiver<WorkMessage>>>,
        failures_tx: mpsc::Sender<FailureMessage>,
    ) -> tokio::task::JoinHandle<Result<WorkerReport>> {
        let (telemetry_tx, _telemetry_rx) = mpsc::unbounded_channel();
        let importer = Importer::new(
            EntityBuilder::new(Arc::new(int_schema()), Span::none()),
            Box::new(MockStorage::new(log.clone())),
            "t",
            Span::none(),
        );
        let worker = Worker::new(0, importer, tasks, failures_tx, telemetry_tx, Span::none());
        tokio::spawn(worker.run())
    }

    fn batch(values: &[&str]) -> WorkMessage {
        WorkMessage::Batch(values.iter().map(|v| RawRow::from_line(v, ",")).collect())
    }

    #[test]
    fn test_state_transitions() {
        use WorkerState::*;
        assert!(Idle.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Terminated));
        assert!(!Processing.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Idle));
        assert!(!Terminated.can_transition_to(Processing));
    }

    #[tokio::test]
    async fn test_worker_imports_until_shutdown() {
        let log = StorageLog::default();
        let (tasks_tx, tasks_rx) = mpsc::channel(8);
        let (failures_tx, mut failures_rx) = mpsc::channel(8);
        let handle = spawn_worker(&log, Arc::new(Mutex::new(tasks_rx)), failures_tx);

        tasks_tx.send(batch(&["1", "2", "-3"])).await.unwrap();
        tasks_tx.send(batch(&["4", "oops"])).await.unwrap();
        tasks_tx.send(WorkMessage::Shutdown).await.unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.rows_committed, 3);
        assert_eq!(report.rows_failed, 2);
        assert_eq!(log.stored(), vec![1, 2, 4]);
        assert_eq!(log.closed(), 1);

        let mut failed = Vec::new();
        while let Ok(FailureMessage::Rows(rows)) = failures_rx.try_recv() {
            failed.extend(rows.into_iter().map(|r| r.cells[0].clone()));
        }
        assert_eq!(failed, vec!["-3", "oops"]);
    }

    #[tokio::test]
    async fn test_each_worker_consumes_one_shutdown() {
        let log = StorageLog::default();
        let (tasks_tx, tasks_rx) = mpsc::channel(8);
        let (failures_tx, _failures_rx) = mpsc::channel(8);
        let tasks = Arc::new(Mutex::new(tasks_rx));

        let handles: Vec<_> = (0..3)
            .map(|_| spawn_worker(&log, tasks.clone(), failures_tx.clone()))
            .collect();
        for _ in 0..3 {
            tasks_tx.send(WorkMessage::Shutdown).await.unwrap();
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().batches, 0);
        }
        assert_eq!(log.closed(), 3);
    }
}
