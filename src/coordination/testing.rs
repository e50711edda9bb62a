//! In-memory doubles for pipeline tests
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::db::schema::{ColumnType, ConfColumn, PrimaryKeyConf, Schema};
use crate::db::StorageClient;
use crate::entity::{Entity, Value};
use crate::io::ByteReader;

/// Single non-nullable int column `n`
pub fn int_schema() -> Schema {
    Schema::new(
        vec![ConfColumn::new("n", 0, ColumnType::Int, false, false, false)],
        PrimaryKeyConf::autoincrement(),
    )
    .unwrap()
}

#[derive(Debug, Default)]
struct LogInner {
    stored: Vec<i32>,
    closed: usize,
}

/// Shared record of what mock storages committed
#[derive(Debug, Clone, Default)]
pub struct StorageLog {
    inner: Arc<Mutex<LogInner>>,
}

impl StorageLog {
    pub fn stored(&self) -> Vec<i32> {
        self.inner.lock().unwrap().stored.clone()
    }

    pub fn closed(&self) -> usize {
        self.inner.lock().unwrap().closed
    }
}

/// Storage that rejects any statement containing a negative `n`
pub struct MockStorage {
    log: StorageLog,
}

impl MockStorage {
    pub fn new(log: StorageLog) -> Self {
        Self { log }
    }

    fn value(entity: &Entity) -> Option<i32> {
        match entity.values().first() {
            Some(Value::Int(n)) if *n >= 0 => Some(*n),
            _ => None,
        }
    }
}

#[async_trait]
impl StorageClient for MockStorage {
    async fn init_table(&mut self, _: &str, _: &[ConfColumn], _: &PrimaryKeyConf) -> Result<()> {
        Ok(())
    }

    async fn insert_in_batch(&mut self, _table: &str, entities: &[Entity]) -> bool {
        let values: Option<Vec<i32>> = entities.iter().map(Self::value).collect();
        match values {
            Some(values) => {
                self.log.inner.lock().unwrap().stored.extend(values);
                true
            }
            None => false,
        }
    }

    async fn insert_one_by_one(&mut self, _table: &str, entities: &[Entity]) -> BTreeSet<usize> {
        let mut failed = BTreeSet::new();
        for (index, entity) in entities.iter().enumerate() {
            match Self::value(entity) {
                Some(v) => self.log.inner.lock().unwrap().stored.push(v),
                None => {
                    failed.insert(index);
                }
            }
        }
        failed
    }

    async fn count(&mut self, _table: &str) -> Result<u64> {
        Ok(self.log.stored().len() as u64)
    }

    async fn drop_table(&mut self, _name: &str) -> Result<()> {
        self.log.inner.lock().unwrap().stored.clear();
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.log.inner.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Byte reader over an in-memory buffer
pub struct MemoryByteReader {
    data: Vec<u8>,
    position: usize,
    max_read: usize,
}

impl MemoryByteReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            max_read: usize::MAX,
        }
    }

    /// Never return more than `max_read` bytes per call
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }
}

#[async_trait]
impl ByteReader for MemoryByteReader {
    async fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read_next(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let end = (self.position + max_len.min(self.max_read)).min(self.data.len());
        let bytes = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(bytes)
    }
}
