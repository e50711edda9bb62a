//! SQL storage client over one dedicated PostgreSQL or SQLite connection
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, Database, Encode, Type};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{Span, debug, warn};

use super::client::{StorageBackend, StorageClient, redact_url};
use super::schema::{
    ColumnType, ConfColumn, Dialect, PrimaryKeyConf, PrimaryKeyMode, Schema, quote_identifier,
};
use crate::config::{POSTGRES_MAX_BIND_PARAMS, SQLITE_BUSY_TIMEOUT, SQLITE_MAX_BIND_PARAMS};
use crate::entity::{Entity, Value};
use crate::error::StatementError;

type BoundQuery<'q, DB> = Query<'q, DB, <DB as Database>::Arguments<'q>>;

/// Dedicated connection variants
enum SqlConnection {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

pub struct SqlClient {
    connection: SqlConnection,
    span: Span,
}

impl SqlClient {
    /// Open a connection to `url` on the given backend
    pub async fn connect(backend: StorageBackend, url: &str, span: Span) -> Result<Self> {
        let connection = match backend {
            StorageBackend::Postgres => {
                let options = PgConnectOptions::from_str(url)
                    .with_context(|| format!("Invalid PostgreSQL URL {}", redact_url(url)))?;
                let conn = options
                    .connect()
                    .await
                    .with_context(|| format!("Failed to connect to {}", redact_url(url)))?;
                SqlConnection::Postgres(conn)
            }
            StorageBackend::Sqlite => {
                let options = SqliteConnectOptions::from_str(url)
                    .with_context(|| format!("Invalid SQLite URL {}", url))?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(SQLITE_BUSY_TIMEOUT);
                let conn = options
                    .connect()
                    .await
                    .with_context(|| format!("Failed to open {}", url))?;
                SqlConnection::Sqlite(conn)
            }
        };

        debug!(parent: &span, backend = ?backend, "Opened storage connection");
        Ok(Self { connection, span })
    }

    fn dialect(&self) -> Dialect {
        match self.connection {
            SqlConnection::Postgres(_) => Dialect::Postgres,
            SqlConnection::Sqlite(_) => Dialect::Sqlite,
        }
    }

    fn max_bind_params(&self) -> usize {
        match self.dialect() {
            Dialect::Postgres => POSTGRES_MAX_BIND_PARAMS,
            Dialect::Sqlite => SQLITE_MAX_BIND_PARAMS,
        }
    }

    /// Execute a statement without parameters (for DDL like CREATE TABLE)
    async fn execute_query(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        match &mut self.connection {
            SqlConnection::Postgres(conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
            SqlConnection::Sqlite(conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }

    /// Execute an INSERT binding every entity's values in order
    async fn execute_insert(
        &mut self,
        table: &str,
        entities: &[Entity],
    ) -> Result<u64, StatementError> {
        let Some(first) = entities.first() else {
            return Ok(0);
        };
        let sql = insert_statement(self.dialect(), table, first.schema(), entities.len());

        let result = match &mut self.connection {
            SqlConnection::Postgres(conn) => entities
                .iter()
                .fold(sqlx::query(&sql), |query, entity| bind_entity(query, entity))
                .execute(&mut *conn)
                .await
                .map(|done| done.rows_affected()),
            SqlConnection::Sqlite(conn) => entities
                .iter()
                .fold(sqlx::query(&sql), |query, entity| bind_entity(query, entity))
                .execute(&mut *conn)
                .await
                .map(|done| done.rows_affected()),
        };

        result.map_err(|e| StatementError {
            table: table.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl StorageClient for SqlClient {
    async fn init_table(
        &mut self,
        name: &str,
        columns: &[ConfColumn],
        primary_key: &PrimaryKeyConf,
    ) -> Result<()> {
        let schema = Schema::new(columns.to_vec(), primary_key.clone())?;
        for statement in schema.generate_ddl(self.dialect(), name) {
            debug!(parent: &self.span, sql = %statement, "Executing DDL");
            self.execute_query(&statement)
                .await
                .with_context(|| format!("Failed to initialize table '{}'", name))?;
        }
        Ok(())
    }

    async fn insert_in_batch(&mut self, table: &str, entities: &[Entity]) -> bool {
        let Some(first) = entities.first() else {
            return true;
        };

        let params = entities.len() * first.schema().params_per_row();
        if params > self.max_bind_params() {
            debug!(
                parent: &self.span,
                rows = entities.len(),
                params,
                limit = self.max_bind_params(),
                "Batch exceeds bind parameter limit"
            );
            return false;
        }

        match self.execute_insert(table, entities).await {
            Ok(_) => true,
            Err(e) => {
                debug!(parent: &self.span, rows = entities.len(), error = %e, "Batch insert rejected");
                false
            }
        }
    }

    async fn insert_one_by_one(&mut self, table: &str, entities: &[Entity]) -> BTreeSet<usize> {
        let mut failed = BTreeSet::new();
        for (index, entity) in entities.iter().enumerate() {
            if let Err(e) = self.execute_insert(table, std::slice::from_ref(entity)).await {
                warn!(parent: &self.span, index, error = %e, "Row insert rejected");
                failed.insert(index);
            }
        }
        failed
    }

    async fn count(&mut self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let count: i64 = match &mut self.connection {
            SqlConnection::Postgres(conn) => {
                sqlx::query_scalar::<_, i64>(&sql)
                    .fetch_one(&mut *conn)
                    .await
            }
            SqlConnection::Sqlite(conn) => {
                sqlx::query_scalar::<_, i64>(&sql)
                    .fetch_one(&mut *conn)
                    .await
            }
        }
        .with_context(|| format!("Failed to count rows in '{}'", table))?;

        u64::try_from(count).context("Row count is negative")
    }

    async fn drop_table(&mut self, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_identifier(name));
        self.execute_query(&sql)
            .await
            .with_context(|| format!("Failed to drop table '{}'", name))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        match self.connection {
            SqlConnection::Postgres(conn) => conn.close().await,
            SqlConnection::Sqlite(conn) => conn.close().await,
        }
        .context("Failed to close storage connection")
    }
}

/// Build a multi-row INSERT with `rows` placeholder groups
fn insert_statement(dialect: Dialect, table: &str, schema: &Schema, rows: usize) -> String {
    let per_row = schema.params_per_row();
    let groups: Vec<String> = (0..rows)
        .map(|row| {
            let placeholders: Vec<String> = (0..per_row)
                .map(|col| dialect.placeholder(row * per_row + col + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} {} VALUES {}",
        quote_identifier(table),
        schema.insert_column_list(),
        groups.join(", ")
    )
}

fn bind_entity<'q, DB>(mut query: BoundQuery<'q, DB>, entity: &Entity) -> BoundQuery<'q, DB>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Option<i32>: Encode<'q, DB> + Type<DB>,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<f64>: Encode<'q, DB> + Type<DB>,
    Option<bool>: Encode<'q, DB> + Type<DB>,
    Option<NaiveDate>: Encode<'q, DB> + Type<DB>,
    Option<NaiveTime>: Encode<'q, DB> + Type<DB>,
    Option<NaiveDateTime>: Encode<'q, DB> + Type<DB>,
{
    let schema = entity.schema();
    if schema.primary_key.mode == PrimaryKeyMode::GeneratedIdentifier {
        query = query.bind(Some(entity.content_id().to_string()));
    }
    for (column, value) in schema.columns.iter().zip(entity.values()) {
        query = bind_value(query, column.column_type, value);
    }
    query
}

fn bind_value<'q, DB>(
    query: BoundQuery<'q, DB>,
    column_type: ColumnType,
    value: &Value,
) -> BoundQuery<'q, DB>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Option<i32>: Encode<'q, DB> + Type<DB>,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<f64>: Encode<'q, DB> + Type<DB>,
    Option<bool>: Encode<'q, DB> + Type<DB>,
    Option<NaiveDate>: Encode<'q, DB> + Type<DB>,
    Option<NaiveTime>: Encode<'q, DB> + Type<DB>,
    Option<NaiveDateTime>: Encode<'q, DB> + Type<DB>,
{
    match value {
        Value::Null => bind_null(query, column_type),
        Value::Text(v) => query.bind(Some(v.clone())),
        Value::Int(v) => query.bind(Some(*v)),
        Value::BigInt(v) => query.bind(Some(*v)),
        Value::Float(v) => query.bind(Some(*v)),
        Value::Bool(v) => query.bind(Some(*v)),
        Value::Date(v) => query.bind(Some(*v)),
        Value::Time(v) => query.bind(Some(*v)),
        Value::DateTime(v) => query.bind(Some(*v)),
    }
}

/// Bind a NULL typed after the column it fills
fn bind_null<'q, DB>(query: BoundQuery<'q, DB>, column_type: ColumnType) -> BoundQuery<'q, DB>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Option<i32>: Encode<'q, DB> + Type<DB>,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<f64>: Encode<'q, DB> + Type<DB>,
    Option<bool>: Encode<'q, DB> + Type<DB>,
    Option<NaiveDate>: Encode<'q, DB> + Type<DB>,
    Option<NaiveTime>: Encode<'q, DB> + Type<DB>,
    Option<NaiveDateTime>: Encode<'q, DB> + Type<DB>,
{
    match column_type {
        ColumnType::String => query.bind(None::<String>),
        ColumnType::Int => query.bind(None::<i32>),
        ColumnType::BigInt => query.bind(None::<i64>),
        ColumnType::Float | ColumnType::LatLon => query.bind(None::<f64>),
        ColumnType::Bool => query.bind(None::<bool>),
        ColumnType::Date => query.bind(None::<NaiveDate>),
        ColumnType::Time => query.bind(None::<NaiveTime>),
        ColumnType::DateTime => query.bind(None::<NaiveDateTime>),
    }
}
