//! Storage layer - table schema, DDL, and SQL storage clients

pub mod client;
pub mod schema;
pub mod sql;

pub use client::{StorageBackend, StorageClient, connect};
pub use schema::{ColumnType, ConfColumn, PrimaryKeyConf, PrimaryKeyMode, Schema};
