pub mod builder;
pub mod casting;

pub use builder::EntityBuilder;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ROW_ID_NAMESPACE;
use crate::db::schema::Schema;

/// A typed cell value ready to be bound into a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i32),
    BigInt(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(v) => f.write_str(v),
            Value::Int(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "{}", v),
        }
    }
}

/// A fully converted row: one value per schema column, in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl Entity {
    pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Self {
        debug_assert_eq!(schema.columns.len(), values.len());
        Self { schema, values }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the named column
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema
            .columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }

    /// Deterministic identifier over the values, independent of column order
    ///
    /// Values are sorted by column name and each is hashed as `<len>:<text>`,
    /// so no cell content can shift a boundary between two values.
    pub fn content_id(&self) -> Uuid {
        let mut named: Vec<(&str, &Value)> = self
            .schema
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));

        let mut encoded = String::new();
        for (_, value) in named {
            let text = value.to_string();
            encoded.push_str(&format!("{}:{}", text.len(), text));
        }
        Uuid::new_v5(&ROW_ID_NAMESPACE, encoded.as_bytes())
    }
}
