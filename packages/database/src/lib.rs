#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Storage for the property tables.
//!
//! [`Store`] is the narrow interface the load stage writes through. Two
//! backends implement it: [`memory::MemoryStore`] for tests and dry runs,
//! and `duckdb_store::DuckDbStore` (feature `duckdb`) for real imports.
//!
//! Every [`Store::write_batch`] call is atomic: either all rows of the
//! batch are applied or none are.

pub mod memory;
pub mod paths;

#[cfg(feature = "duckdb")]
pub mod duckdb_store;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use taxroll_database_models::{
    ConflictPolicy, CoordinateUpdate, NaturalKey, RowBatch, TableCounts, TableId,
};

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be mapped back to a row type.
    #[error("Data conversion error: {message}")]
    Conversion { message: String },

    /// The backend refused the write and rolled it back.
    #[error("Write rejected for {table}: {message}")]
    Rejected { table: TableId, message: String },
}

/// Synchronous access to the property tables.
pub trait Store {
    /// Deletes every row of `table` and returns how many were removed.
    /// Truncating `properties` resets surrogate ids and detaches all child
    /// rows from their parents.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn truncate(&mut self, table: TableId) -> Result<u64, DbError>;

    /// Natural keys currently stored in `table`, active or not.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn natural_keys(&self, table: TableId) -> Result<HashSet<NaturalKey>, DbError>;

    /// `account_number -> id` for every property.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn property_ids(&self) -> Result<HashMap<String, i64>, DbError>;

    /// Writes `batch` in one transaction and returns the number of rows
    /// inserted or updated. Under [`ConflictPolicy::Skip`] existing keys
    /// are left untouched and not counted.
    ///
    /// # Errors
    ///
    /// * If the backend fails, in which case nothing was written
    fn write_batch(&mut self, batch: &RowBatch, policy: ConflictPolicy) -> Result<u64, DbError>;

    /// Marks active child rows written before `before` by any batch other
    /// than `exclude_batch` as superseded. Returns the number of rows
    /// changed.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn mark_superseded(
        &mut self,
        table: TableId,
        before: DateTime<Utc>,
        exclude_batch: &str,
    ) -> Result<u64, DbError>;

    /// Deletes up to `limit` superseded rows of a child table and returns
    /// how many went. Properties carry no history and always return 0.
    ///
    /// # Errors
    ///
    /// * If the backend fails, in which case nothing was deleted
    fn delete_superseded(&mut self, table: TableId, limit: usize) -> Result<u64, DbError>;

    /// Links child rows with no parent to the property with the same
    /// account number, where one now exists. Returns the number linked.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn link_orphans(&mut self, table: TableId) -> Result<u64, DbError>;

    /// Sets coordinates on existing properties and returns how many matched.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn update_coordinates(&mut self, updates: &[CoordinateUpdate]) -> Result<u64, DbError>;

    /// Row count of `table`, optionally only active rows. Every property
    /// counts as active.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn count(&self, table: TableId, active_only: bool) -> Result<u64, DbError>;

    /// Total and active counts for every table.
    ///
    /// # Errors
    ///
    /// * If the backend fails
    fn table_counts(&self) -> Result<Vec<TableCounts>, DbError> {
        <TableId as strum::IntoEnumIterator>::iter()
            .map(|table| {
                Ok(TableCounts {
                    table,
                    total: self.count(table, false)?,
                    active: self.count(table, true)?,
                })
            })
            .collect()
    }
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn truncate(&mut self, table: TableId) -> Result<u64, DbError> {
        (**self).truncate(table)
    }

    fn natural_keys(&self, table: TableId) -> Result<HashSet<NaturalKey>, DbError> {
        (**self).natural_keys(table)
    }

    fn property_ids(&self) -> Result<HashMap<String, i64>, DbError> {
        (**self).property_ids()
    }

    fn write_batch(&mut self, batch: &RowBatch, policy: ConflictPolicy) -> Result<u64, DbError> {
        (**self).write_batch(batch, policy)
    }

    fn mark_superseded(
        &mut self,
        table: TableId,
        before: DateTime<Utc>,
        exclude_batch: &str,
    ) -> Result<u64, DbError> {
        (**self).mark_superseded(table, before, exclude_batch)
    }

    fn delete_superseded(&mut self, table: TableId, limit: usize) -> Result<u64, DbError> {
        (**self).delete_superseded(table, limit)
    }

    fn link_orphans(&mut self, table: TableId) -> Result<u64, DbError> {
        (**self).link_orphans(table)
    }

    fn update_coordinates(&mut self, updates: &[CoordinateUpdate]) -> Result<u64, DbError> {
        (**self).update_coordinates(updates)
    }

    fn count(&self, table: TableId, active_only: bool) -> Result<u64, DbError> {
        (**self).count(table, active_only)
    }
}
