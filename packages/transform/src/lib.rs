#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Schema-driven transform of delimited appraisal exports.
//!
//! Files are opened with sniffed encoding and delimiter
//! ([`reader::open_reader`]), each row is resolved against a static
//! [`schema::TableSchema`] and coerced to typed [`record::Value`]s, and the
//! result is exposed as a pull-based [`engine::RecordIter`] that keeps
//! memory constant regardless of file size.
//!
//! The [`fixtures`] module pre-scans the building fixtures file into the
//! room-count lookup consulted while loading building details.

pub mod coerce;
pub mod engine;
pub mod fixtures;
pub mod reader;
pub mod record;
pub mod schema;

pub use engine::{RecordIter, Transformer};
pub use record::{Record, RowOutcome, TransformResult, ValidationError, Value};
pub use schema::{SchemaId, TableSchema, validate_registry};

/// Errors that stop a file from being transformed at all.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A static schema is internally inconsistent.
    #[error("invalid schema {schema}: {message}")]
    Schema { schema: String, message: String },
}
