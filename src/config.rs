//! Configuration constants for the importer
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Parsing Configuration
// ============================================================================

/// Bytes per kilobyte when converting `chunk_size_kB` into a read buffer size.
pub const BYTES_PER_KB: usize = 1000;

pub const DEFAULT_CHUNK_SIZE_KB: usize = 16;
pub const MIN_CHUNK_SIZE_KB: usize = 1;
pub const MAX_CHUNK_SIZE_KB: usize = 64_000;

pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const MIN_WORKER_COUNT: usize = 1;
pub const MAX_WORKER_COUNT: usize = 128;

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Task and failure queue capacity, as a multiple of the worker count
///
/// Memory held in queued batches stays below `2 * workers * chunk size`.
pub const QUEUE_CAPACITY_FACTOR: usize = 2;

/// Batches at or below this many entities are inserted row by row
pub const INSERT_ONE_BY_ONE_THRESHOLD: usize = 8;

/// Minimum time between progress spinner message refreshes
pub const PROGRESS_REFRESH_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// Storage Configuration
// ============================================================================

/// Maximum bind parameters in a single PostgreSQL statement
pub const POSTGRES_MAX_BIND_PARAMS: usize = 65_535;

/// Maximum bind parameters in a single SQLite statement (SQLITE_MAX_VARIABLE_NUMBER)
pub const SQLITE_MAX_BIND_PARAMS: usize = 32_766;

/// How long a SQLite connection waits on a locked database before failing
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest identifier PostgreSQL keeps without truncating (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Hex digits of the name hash appended to shortened index names
pub const INDEX_NAME_HASH_LEN: usize = 8;

/// Name of the synthetic identity column for autoincrement and generated keys
pub const ID_COLUMN: &str = "id";

/// Namespace for content-derived row identifiers (UUIDv5)
pub const ROW_ID_NAMESPACE: Uuid = Uuid::from_u128(1_248_789_574);

// ============================================================================
// CLI Configuration
// ============================================================================

/// Longest input-file prefix used when generating a table name
pub const TABLE_NAME_PREFIX_LEN: usize = 48;
