use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::byte_reader::ByteReader;

/// ByteReader implementation for local files
pub struct LocalFileByteReader {
    file_path: PathBuf,
    file: File,
}

impl LocalFileByteReader {
    /// Open the file for a single forward pass
    pub async fn open(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        let file = File::open(&file_path)
            .await
            .with_context(|| format!("Failed to open input file {}", file_path.display()))?;
        Ok(Self { file_path, file })
    }
}

#[async_trait]
impl ByteReader for LocalFileByteReader {
    async fn size(&self) -> Result<u64> {
        let size = self
            .file
            .metadata()
            .await
            .context("Failed to read file metadata")?
            .len();
        Ok(size)
    }

    async fn read_next(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(max_len);
        (&mut self.file)
            .take(max_len as u64)
            .read_to_end(&mut buffer)
            .await
            .with_context(|| format!("Failed to read from {}", self.file_path.display()))?;
        Ok(buffer)
    }
}
