use anyhow::Result;
use async_trait::async_trait;

/// Abstraction for forward-only byte-level I/O
/// A reader is consumed in a single pass; there is no seeking back
#[async_trait]
pub trait ByteReader: Send {
    /// Get the total size of the input in bytes
    async fn size(&self) -> Result<u64>;

    /// Read up to `max_len` bytes from the current position
    /// Returns an empty buffer once the end of input is reached
    async fn read_next(&mut self, max_len: usize) -> Result<Vec<u8>>;
}

/// Fill a buffer of exactly `len` bytes unless the input ends first
/// Short reads from the underlying reader are retried until the buffer is full
pub async fn read_full<R: ByteReader + ?Sized>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buffer = reader.read_next(len).await?;

    while !buffer.is_empty() && buffer.len() < len {
        let more = reader.read_next(len - buffer.len()).await?;
        if more.is_empty() {
            break;
        }
        buffer.extend_from_slice(&more);
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::MemoryByteReader;

    #[tokio::test]
    async fn test_read_full_retries_short_reads() {
        let mut reader = MemoryByteReader::new("line1\nline2\nline3\n").with_max_read(4);

        let first = read_full(&mut reader, 10).await.unwrap();
        assert_eq!(first, b"line1\nline");

        let second = read_full(&mut reader, 10).await.unwrap();
        assert_eq!(second, b"2\nline3\n");

        let eof = read_full(&mut reader, 10).await.unwrap();
        assert!(eof.is_empty());
    }

    #[tokio::test]
    async fn test_size_reports_total_bytes() {
        let reader = MemoryByteReader::new(vec![0u8; 42]).with_max_read(8);
        assert_eq!(reader.size().await.unwrap(), 42);
    }
}
