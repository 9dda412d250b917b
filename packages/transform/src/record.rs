//! Typed records and per-file transform bookkeeping.

use std::fmt;
use std::time::Duration;

use crate::reader::Delimiter;
use crate::schema::SchemaId;
use taxroll_source_models::config::TextEncoding;

/// Most validation errors kept for one row.
pub const MAX_ERRORS_PER_ROW: usize = 10;

/// Most validation errors kept for one file.
pub const MAX_STORED_ERRORS: usize = 100;

/// A coerced field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    /// `Null` and the empty string count as empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Str(s) => s.is_empty(),
            _ => false,
        }
    }
}

/// One transformed row, with values in schema field order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: SchemaId,
    values: Vec<Value>,
}

impl Record {
    /// A record with every field null.
    #[must_use]
    pub fn empty(schema: SchemaId) -> Self {
        Self {
            schema,
            values: vec![Value::Null; schema.schema().fields.len()],
        }
    }

    pub(crate) const fn from_values(schema: SchemaId, values: Vec<Value>) -> Self {
        Self { schema, values }
    }

    #[must_use]
    pub const fn schema(&self) -> SchemaId {
        self.schema
    }

    /// Sets a field by name. Unknown names are ignored.
    #[must_use]
    pub fn with(mut self, field: &str, value: Value) -> Self {
        if let Some(i) = self.schema.schema().index_of(field) {
            self.values[i] = value;
        }
        self
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.schema
            .schema()
            .index_of(field)
            .and_then(|i| self.values.get(i))
    }

    /// Non-empty string value.
    #[must_use]
    pub fn str(&self, field: &str) -> Option<&str> {
        match self.get(field)? {
            Value::Str(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn int(&self, field: &str) -> Option<i64> {
        match self.get(field)? {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value; integers widen to floats.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn float(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn bool(&self, field: &str) -> Option<bool> {
        match self.get(field)? {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// `(name, value)` pairs in schema order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.schema
            .schema()
            .fields
            .iter()
            .map(|f| f.name)
            .zip(self.values.iter())
    }
}

/// A field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    /// Raw input, if the column was present.
    pub value: Option<String>,
    pub message: String,
    /// 1-based data row number (the header is row 0).
    pub row_number: u64,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}: {}", self.row_number, self.field, self.message)?;
        if let Some(value) = &self.value {
            write!(f, " (value {value:?})")?;
        }
        Ok(())
    }
}

/// Result of transforming one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Valid(Record),
    /// The record is still returned so callers can inspect the partial
    /// values, but it must not be loaded.
    Invalid {
        record: Record,
        errors: Vec<ValidationError>,
    },
}

impl RowOutcome {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    #[must_use]
    pub fn into_record(self) -> Record {
        match self {
            Self::Valid(record) | Self::Invalid { record, .. } => record,
        }
    }
}

/// Counters and diagnostics for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    pub schema: SchemaId,
    /// `false` if processing stopped early or the file could not be read
    /// to the end.
    pub success: bool,
    pub records_processed: u64,
    pub records_valid: u64,
    pub records_invalid: u64,
    /// Rows with no data at all.
    pub records_skipped: u64,
    /// At most [`MAX_STORED_ERRORS`].
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub encoding: TextEncoding,
    pub delimiter: Delimiter,
    pub duration: Duration,
}

impl TransformResult {
    pub(crate) const fn new(
        schema: SchemaId,
        encoding: TextEncoding,
        delimiter: Delimiter,
    ) -> Self {
        Self {
            schema,
            success: true,
            records_processed: 0,
            records_valid: 0,
            records_invalid: 0,
            records_skipped: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            encoding,
            delimiter,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn push_errors(&mut self, errors: &[ValidationError]) {
        let room = MAX_STORED_ERRORS.saturating_sub(self.errors.len());
        self.errors.extend(
            errors
                .iter()
                .take(MAX_ERRORS_PER_ROW.min(room))
                .cloned(),
        );
    }
}
