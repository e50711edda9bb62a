use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use uuid::Uuid;

use crate::config::{ID_COLUMN, INDEX_NAME_HASH_LEN, MAX_IDENTIFIER_LEN};
use crate::error::SchemaValidationError;
use crate::formats::{InputFileConfig, InputFileConfigJson};

/// SQL dialect spoken by a storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Bind parameter placeholder for the 1-based parameter `index`
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Sqlite => "?".to_string(),
        }
    }
}

/// Declared column type, as spelled in the model file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    BigInt,
    Float,
    Bool,
    Date,
    Time,
    DateTime,
    LatLon,
}

impl ColumnType {
    /// Returns the SQL type name used for the column in `dialect`
    pub fn sql_type(self, dialect: Dialect) -> &'static str {
        match (self, dialect) {
            (ColumnType::String, _) => "TEXT",
            (ColumnType::Int, _) => "INTEGER",
            (ColumnType::BigInt, _) => "BIGINT",
            (ColumnType::Float | ColumnType::LatLon, Dialect::Postgres) => "DOUBLE PRECISION",
            (ColumnType::Float | ColumnType::LatLon, Dialect::Sqlite) => "REAL",
            (ColumnType::Bool, _) => "BOOLEAN",
            (ColumnType::Date, _) => "DATE",
            (ColumnType::Time, _) => "TIME",
            (ColumnType::DateTime, _) => "TIMESTAMP",
        }
    }
}

/// A column declared in the model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfColumn {
    pub name: String,
    pub source_index: usize,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub indexed: bool,
    pub unique: bool,
}

impl ConfColumn {
    pub fn new(
        name: impl Into<String>,
        source_index: usize,
        column_type: ColumnType,
        nullable: bool,
        indexed: bool,
        unique: bool,
    ) -> Self {
        Self {
            name: name.into(),
            source_index,
            column_type,
            nullable,
            indexed,
            unique,
        }
    }
}

/// How the identity of a stored row is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryKeyMode {
    /// Synthetic sequential integer `id`
    #[default]
    Autoincrement,
    /// Deterministic UUIDv5 `id` computed from the row's values
    #[serde(rename = "uuid")]
    GeneratedIdentifier,
    /// The listed model columns form a composite key
    #[serde(rename = "columns")]
    ExplicitColumns,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrimaryKeyConf {
    pub mode: PrimaryKeyMode,
    pub columns: Vec<String>,
}

impl PrimaryKeyConf {
    pub fn autoincrement() -> Self {
        Self::default()
    }

    pub fn generated() -> Self {
        Self {
            mode: PrimaryKeyMode::GeneratedIdentifier,
            columns: Vec::new(),
        }
    }

    pub fn columns<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            mode: PrimaryKeyMode::ExplicitColumns,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether an `id` column precedes the model columns
    pub fn has_id_column(&self) -> bool {
        self.mode != PrimaryKeyMode::ExplicitColumns
    }
}

/// Immutable description of the target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<ConfColumn>,
    pub primary_key: PrimaryKeyConf,
}

impl Schema {
    /// Validate and build a schema
    pub fn new(
        columns: Vec<ConfColumn>,
        primary_key: PrimaryKeyConf,
    ) -> Result<Self, SchemaValidationError> {
        if columns.is_empty() {
            return Err(SchemaValidationError::NoColumns);
        }

        let mut names = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !names.insert(column.name.as_str()) {
                return Err(SchemaValidationError::DuplicateColumn(column.name.clone()));
            }
        }

        if let Some(column) = columns
            .iter()
            .find(|c| primary_key.has_id_column() && c.name.eq_ignore_ascii_case(ID_COLUMN))
        {
            return Err(SchemaValidationError::ReservedColumn(column.name.clone()));
        }

        if primary_key.mode == PrimaryKeyMode::ExplicitColumns {
            if primary_key.columns.is_empty() {
                return Err(SchemaValidationError::EmptyPrimaryKey);
            }
            if let Some(unknown) = primary_key
                .columns
                .iter()
                .find(|name| !names.contains(name.as_str()))
            {
                return Err(SchemaValidationError::UnknownPrimaryKeyColumn(
                    unknown.clone(),
                ));
            }
        }

        Ok(Self {
            columns,
            primary_key,
        })
    }

    /// Number of bind parameters one row takes in an INSERT
    pub fn params_per_row(&self) -> usize {
        let id_param = usize::from(self.primary_key.mode == PrimaryKeyMode::GeneratedIdentifier);
        self.columns.len() + id_param
    }

    /// Quoted column list for an INSERT, including a generated `id` column
    pub fn insert_column_list(&self) -> String {
        let mut names = Vec::with_capacity(self.params_per_row());
        if self.primary_key.mode == PrimaryKeyMode::GeneratedIdentifier {
            names.push(quote_identifier(ID_COLUMN));
        }
        names.extend(self.columns.iter().map(|c| quote_identifier(&c.name)));
        format!("({})", names.join(", "))
    }

    /// Generate the idempotent DDL statements creating the table and its indexes
    pub fn generate_ddl(&self, dialect: Dialect, table_name: &str) -> Vec<String> {
        let table = quote_identifier(table_name);
        let mut definitions = Vec::with_capacity(self.columns.len() + 2);

        match (self.primary_key.mode, dialect) {
            (PrimaryKeyMode::Autoincrement, Dialect::Postgres) => {
                definitions.push(format!("  {} BIGSERIAL PRIMARY KEY", quote_identifier(ID_COLUMN)))
            }
            (PrimaryKeyMode::Autoincrement, Dialect::Sqlite) => definitions.push(format!(
                "  {} INTEGER PRIMARY KEY AUTOINCREMENT",
                quote_identifier(ID_COLUMN)
            )),
            (PrimaryKeyMode::GeneratedIdentifier, _) => {
                definitions.push(format!("  {} TEXT PRIMARY KEY", quote_identifier(ID_COLUMN)))
            }
            (PrimaryKeyMode::ExplicitColumns, _) => {}
        }

        for col in &self.columns {
            let nullable_clause = if col.nullable { "" } else { " NOT NULL" };
            let unique_clause = if col.unique { " UNIQUE" } else { "" };
            definitions.push(format!(
                "  {} {}{}{}",
                quote_identifier(&col.name),
                col.column_type.sql_type(dialect),
                nullable_clause,
                unique_clause
            ));
        }

        if self.primary_key.mode == PrimaryKeyMode::ExplicitColumns {
            let key_columns: Vec<String> = self
                .primary_key
                .columns
                .iter()
                .map(|name| quote_identifier(name))
                .collect();
            definitions.push(format!("  PRIMARY KEY ({})", key_columns.join(", ")));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            table,
            definitions.join(",\n")
        )];

        for col in self.columns.iter().filter(|c| c.indexed) {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_identifier(&index_name(table_name, &col.name)),
                table,
                quote_identifier(&col.name)
            ));
        }

        statements
    }
}

/// Name of the index on `column`, kept within the identifier length limit
///
/// Names that would be too long are cut and suffixed with a hash of the full
/// name, so distinct columns keep distinct index names.
pub fn index_name(table_name: &str, column: &str) -> String {
    let name = format!("ix_{}_{}", table_name, column);
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }

    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).simple().to_string();
    let suffix = &digest[..INDEX_NAME_HASH_LEN];
    let mut cut = MAX_IDENTIFIER_LEN - INDEX_NAME_HASH_LEN - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &name[..cut], suffix)
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column declaration (JSON serialization format)
#[derive(Debug, Clone, Deserialize)]
struct ColumnJson {
    input_file_column: usize,
    #[serde(rename = "type")]
    col_type: ColumnType,
    #[serde(default = "default_nullable")]
    nullable: bool,
    #[serde(default)]
    index: bool,
    #[serde(default)]
    unique: bool,
}

fn default_nullable() -> bool {
    true
}

/// Primary key declaration (JSON serialization format)
#[derive(Debug, Clone, Default, Deserialize)]
struct PrimaryKeyJson {
    #[serde(default)]
    mode: PrimaryKeyMode,
    #[serde(default)]
    columns: Vec<String>,
}

/// Model file (JSON serialization format)
#[derive(Debug, Clone, Deserialize)]
struct ModelFileJson {
    #[serde(default)]
    file: InputFileConfigJson,
    columns: BTreeMap<String, ColumnJson>,
    #[serde(default)]
    primary_key: PrimaryKeyJson,
}

/// Parse a model file's contents into a validated schema and file dialect
pub fn parse_model(contents: &str) -> Result<(Schema, InputFileConfig)> {
    let model: ModelFileJson =
        serde_json::from_str(contents).context("Model file is not valid JSON")?;

    let mut columns: Vec<ConfColumn> = model
        .columns
        .into_iter()
        .map(|(name, col)| {
            ConfColumn::new(
                name,
                col.input_file_column,
                col.col_type,
                col.nullable,
                col.index,
                col.unique,
            )
        })
        .collect();
    columns.sort_by(|a, b| {
        a.source_index
            .cmp(&b.source_index)
            .then_with(|| a.name.cmp(&b.name))
    });

    let primary_key = PrimaryKeyConf {
        mode: model.primary_key.mode,
        columns: model.primary_key.columns,
    };
    let schema = Schema::new(columns, primary_key)?;
    let file_config =
        InputFileConfig::try_from(model.file).context("Invalid 'file' section in model file")?;

    Ok((schema, file_config))
}

/// Read and validate a model file from disk
pub async fn load_model_file(path: &Path) -> Result<(Schema, InputFileConfig)> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read model file {}", path.display()))?;
    parse_model(&contents).with_context(|| format!("Invalid model file {}", path.display()))
}
