use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{Span, error, info};

use super::worker::FailureMessage;
use crate::formats::{InputFileConfig, RawRow};
use crate::telemetry::TelemetryEvent;

/// Totals reported by the failure writer when it stops
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FailureSinkReport {
    pub rows_written: u64,
    pub write_errors: u64,
}

/// Appends failed rows to the failure file in the input file's dialect
///
/// The file is opened in append mode on the first write, so earlier contents
/// are preserved and no file is created when nothing fails.
pub struct FailureSink {
    path: PathBuf,
    config: InputFileConfig,
    file: Option<File>,
    span: Span,
}

impl FailureSink {
    pub fn new(path: impl Into<PathBuf>, config: InputFileConfig, span: Span) -> Self {
        Self {
            path: path.into(),
            config,
            file: None,
            span,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize rows as the input dialect: cells joined, each row terminated
    pub fn encode_rows(&self, rows: &[RawRow]) -> Vec<u8> {
        let mut text = String::new();
        for row in rows {
            text.push_str(&row.to_line(&self.config.cell_delimiter));
            text.push_str(&self.config.row_delimiter);
        }

        let (bytes, _, _) = self.config.encoding.encode(&text);
        bytes.into_owned()
    }

    /// Append rows to the failure file
    pub async fn handle_failed_rows(&mut self, rows: &[RawRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let bytes = self.encode_rows(rows);
        let file = match &mut self.file {
            Some(file) => file,
            slot => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                    .with_context(|| {
                        format!("Failed to open failure file {}", self.path.display())
                    })?;
                slot.insert(file)
            }
        };

        file.write_all(&bytes)
            .await
            .with_context(|| format!("Failed to write failure file {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Drain the failure queue until the shutdown message arrives
    ///
    /// Write errors are logged and counted; they never stop the drain.
    pub async fn run(
        mut self,
        mut failures_rx: mpsc::Receiver<FailureMessage>,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> FailureSinkReport {
        let mut report = FailureSinkReport::default();

        while let Some(message) = failures_rx.recv().await {
            let rows = match message {
                FailureMessage::Rows(rows) => rows,
                FailureMessage::Shutdown => break,
            };

            match self.handle_failed_rows(&rows).await {
                Ok(()) => {
                    report.rows_written += rows.len() as u64;
                    let _ = telemetry_tx.send(TelemetryEvent::FailuresWritten {
                        rows: rows.len() as u64,
                    });
                }
                Err(e) => {
                    report.write_errors += 1;
                    let lost: Vec<String> = rows
                        .iter()
                        .map(|row| row.to_line(&self.config.cell_delimiter))
                        .collect();
                    error!(
                        parent: &self.span,
                        rows = rows.len(),
                        ?lost,
                        "Could not save failed rows: {:#}",
                        e
                    );
                }
            }
        }

        if report.rows_written > 0 {
            info!(
                parent: &self.span,
                rows = report.rows_written,
                path = %self.path.display(),
                "Saved failed rows"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(cells: &[&str]) -> RawRow {
        cells.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_rows_written_in_input_dialect() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed.csv");
        let config = InputFileConfig::from_strings("utf-8", true, "\r\n", ";").unwrap();
        let mut sink = FailureSink::new(&path, config, Span::none());

        sink.handle_failed_rows(&[row(&["a", "b"]), row(&["c", ""])])
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a;b\r\nc;\r\n");
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed.csv");
        std::fs::write(&path, "earlier\n").unwrap();

        let mut sink = FailureSink::new(&path, InputFileConfig::csv(), Span::none());
        sink.handle_failed_rows(&[row(&["x", "1"])]).await.unwrap();
        sink.handle_failed_rows(&[row(&["y", "2"])]).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "earlier\nx,1\ny,2\n"
        );
    }

    #[tokio::test]
    async fn test_rows_encoded_with_input_encoding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed.csv");
        let config = InputFileConfig::from_strings("windows-1250", false, "\n", ",").unwrap();
        let mut sink = FailureSink::new(&path, config, Span::none());

        sink.handle_failed_rows(&[row(&["Łódź"])]).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (expected, _, _) = encoding_rs::WINDOWS_1250.encode("Łódź\n");
        assert_eq!(bytes, expected.into_owned());
    }

    #[tokio::test]
    async fn test_nothing_created_without_failures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed.csv");
        let (tx, rx) = mpsc::channel(4);
        let (telemetry_tx, _telemetry_rx) = mpsc::unbounded_channel();

        let sink = FailureSink::new(&path, InputFileConfig::csv(), Span::none());
        let handle = tokio::spawn(sink.run(rx, telemetry_tx));
        tx.send(FailureMessage::Shutdown).await.unwrap();

        assert_eq!(handle.await.unwrap(), FailureSinkReport::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_run_drains_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed.csv");
        let (tx, rx) = mpsc::channel(4);
        let (telemetry_tx, mut telemetry_rx) = mpsc::unbounded_channel();

        let sink = FailureSink::new(&path, InputFileConfig::csv(), Span::none());
        let handle = tokio::spawn(sink.run(rx, telemetry_tx));
        tx.send(FailureMessage::Rows(vec![row(&["a"]), row(&["b"])]))
            .await
            .unwrap();
        tx.send(FailureMessage::Rows(vec![row(&["c"])])).await.unwrap();
        tx.send(FailureMessage::Shutdown).await.unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.rows_written, 3);
        assert_eq!(report.write_errors, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc\n");
        assert_eq!(
            telemetry_rx.recv().await,
            Some(TelemetryEvent::FailuresWritten { rows: 2 })
        );
    }

    #[tokio::test]
    async fn test_write_errors_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("failed.csv");
        let (tx, rx) = mpsc::channel(4);
        let (telemetry_tx, _telemetry_rx) = mpsc::unbounded_channel();

        let sink = FailureSink::new(&path, InputFileConfig::csv(), Span::none());
        let handle = tokio::spawn(sink.run(rx, telemetry_tx));
        tx.send(FailureMessage::Rows(vec![row(&["a"])])).await.unwrap();
        tx.send(FailureMessage::Rows(vec![row(&["b"])])).await.unwrap();
        tx.send(FailureMessage::Shutdown).await.unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.write_errors, 2);
    }
}
