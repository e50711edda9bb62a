use std::sync::Arc;
use tracing::{Span, debug, warn};

use super::casting::cast_value;
use super::{Entity, Value};
use crate::db::schema::{ConfColumn, Schema};
use crate::error::ConversionError;
use crate::formats::RawRow;

/// Converts raw rows into typed entities following the schema
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    schema: Arc<Schema>,
    span: Span,
}

impl EntityBuilder {
    pub fn new(schema: Arc<Schema>, span: Span) -> Self {
        Self { schema, span }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Convert one row; the row is rejected unless every column yields a value
    pub fn to_entity(&self, row: &RawRow) -> Result<Entity, ConversionError> {
        let values = self
            .schema
            .columns
            .iter()
            .map(|column| {
                let cell = row
                    .get(column.source_index)
                    .ok_or_else(|| ConversionError::MissingCell {
                        column: column.name.clone(),
                        index: column.source_index,
                        cells: row.len(),
                    })?;
                self.cast_cell(column, cell)
            })
            .collect::<Result<Vec<Value>, ConversionError>>()?;

        Ok(Entity::new(Arc::clone(&self.schema), values))
    }

    /// Split rows into converted pairs and rejected rows, preserving order
    pub fn build_batch(&self, rows: Vec<RawRow>) -> (Vec<(RawRow, Entity)>, Vec<RawRow>) {
        let mut converted = Vec::with_capacity(rows.len());
        let mut rejected = Vec::new();

        for row in rows {
            match self.to_entity(&row) {
                Ok(entity) => converted.push((row, entity)),
                Err(e) => {
                    debug!(parent: &self.span, error = %e, row = ?row.cells, "Cannot build entity from row");
                    rejected.push(row);
                }
            }
        }

        (converted, rejected)
    }

    fn cast_cell(&self, column: &ConfColumn, cell: &str) -> Result<Value, ConversionError> {
        if cell.is_empty() || cell.eq_ignore_ascii_case("null") {
            return if column.nullable {
                Ok(Value::Null)
            } else {
                Err(ConversionError::NullNotAllowed {
                    column: column.name.clone(),
                })
            };
        }

        match cast_value(column.column_type, cell) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    parent: &self.span,
                    column = %column.name,
                    value = cell,
                    error = %e,
                    "Could not cast value"
                );
                if column.nullable {
                    Ok(Value::Null)
                } else {
                    Err(ConversionError::InvalidValue {
                        column: column.name.clone(),
                        value: cell.to_string(),
                        reason: e.0,
                    })
                }
            }
        }
    }
}
