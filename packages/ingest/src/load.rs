//! Load manager.
//!
//! All store mutation goes through [`LoadManager`]. Records are mapped to
//! rows, filtered against the natural keys already present and the parent
//! snapshot, buffered to the configured batch size, and written one
//! transaction per batch. A batch that keeps failing after its retries is
//! counted as failed; batches already written stay written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use taxroll_database::{DbError, Store};
use taxroll_database_models::{
    ConflictPolicy, CoordinateUpdate, ImportStamp, NaturalKey, RowBatch, TableCounts, TableId,
};
use taxroll_ingest_models::{ImportCheckpoint, LoadMode, LoadResult};
use taxroll_source_models::config::{LoadConfig, OrphanPolicy};
use taxroll_transform::Record;
use taxroll_transform::fixtures::FixturesAggregator;

use crate::rows::map_record;

/// Generates a batch id: the UTC timestamp plus eight random hex digits.
#[must_use]
pub fn generate_batch_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Per-call load settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub mode: LoadMode,
    /// Stamped on every row written.
    pub batch_id: String,
}

impl LoadOptions {
    #[must_use]
    pub fn new(mode: LoadMode, batch_id: impl Into<String>) -> Self {
        Self {
            mode,
            batch_id: batch_id.into(),
        }
    }
}

/// Read-only snapshot of `account_number -> property id`, shared by every
/// child load until the properties change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentIndex {
    ids: HashMap<String, i64>,
}

impl ParentIndex {
    /// # Errors
    ///
    /// * If the store cannot list property ids
    pub fn build<S: Store + ?Sized>(store: &S) -> Result<Self, DbError> {
        let ids = store.property_ids()?;
        log::info!("Loaded {} account -> property mappings", ids.len());
        Ok(Self { ids })
    }

    #[must_use]
    pub fn get(&self, account_number: &str) -> Option<i64> {
        self.ids.get(account_number).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn key_label(key: &NaturalKey) -> String {
    match (key.number, key.code.as_str()) {
        (0, "") => key.account_number.clone(),
        (number, "") => format!("{}/{number}", key.account_number),
        (number, code) => format!("{}/{number}/{code}", key.account_number),
    }
}

/// Rows waiting to be written, with how many of them replace stored rows.
struct PendingBatch {
    rows: RowBatch,
    updates: u64,
    last_key: Option<NaturalKey>,
}

impl PendingBatch {
    const fn new(table: TableId) -> Self {
        Self {
            rows: RowBatch::empty(table),
            updates: 0,
            last_key: None,
        }
    }
}

/// Writes records into a [`Store`].
pub struct LoadManager<S> {
    store: S,
    config: LoadConfig,
    parents: Option<Arc<ParentIndex>>,
    checkpoints: HashMap<String, ImportCheckpoint>,
}

impl<S: Store> LoadManager<S> {
    #[must_use]
    pub fn new(store: S, config: &LoadConfig) -> Self {
        Self {
            store,
            config: config.clone(),
            parents: None,
            checkpoints: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Drops the parent snapshot so the next child load rebuilds it.
    pub fn reset_parents(&mut self) {
        self.parents = None;
    }

    /// The current parent snapshot, built on first use.
    ///
    /// # Errors
    ///
    /// * If the store cannot list property ids
    pub fn parents(&mut self) -> Result<Arc<ParentIndex>, DbError> {
        if let Some(parents) = &self.parents {
            return Ok(Arc::clone(parents));
        }
        let parents = Arc::new(ParentIndex::build(&self.store)?);
        self.parents = Some(Arc::clone(&parents));
        Ok(parents)
    }

    /// Last checkpoint recorded for `import_id`.
    #[must_use]
    pub fn checkpoint(&self, import_id: &str) -> Option<&ImportCheckpoint> {
        self.checkpoints.get(import_id)
    }

    /// Loads `records` into `table`.
    ///
    /// Records whose natural key is incomplete, or repeats a key seen
    /// earlier in this call, are skipped. In append mode, properties
    /// already stored are skipped while stored child rows are replaced
    /// and counted as updated. Child rows whose account has no property
    /// are invalid unless the orphan policy keeps them unlinked.
    ///
    /// Never fails: store errors are counted and reported in the result.
    #[allow(clippy::too_many_lines)]
    pub fn load_records<I>(
        &mut self,
        table: TableId,
        records: I,
        fixtures: Option<&FixturesAggregator>,
        options: &LoadOptions,
    ) -> LoadResult
    where
        I: IntoIterator<Item = Record>,
    {
        let start = Instant::now();
        let mut result = LoadResult::new(table, options.batch_id.clone());
        let records = records.into_iter();
        let import_id = format!("{table}_{}", options.batch_id);

        let existing = match self.prepare(table, options.mode) {
            Ok(existing) => existing,
            Err(e) => {
                log::error!("Load of {table} aborted before writing: {e}");
                result.failed = records.count() as u64;
                result.push_error(format!("{table}: {e}"));
                result.duration = start.elapsed();
                return result;
            }
        };

        let parents = if table.is_child() {
            match self.parents() {
                Ok(parents) => Some(parents),
                Err(e) => {
                    log::error!("Cannot resolve parents for {table}: {e}");
                    result.failed = records.count() as u64;
                    result.push_error(format!("{table}: {e}"));
                    result.duration = start.elapsed();
                    return result;
                }
            }
        } else {
            None
        };

        let policy = match (table.is_child(), options.mode) {
            (true, LoadMode::Append) => ConflictPolicy::Upsert,
            _ => ConflictPolicy::Skip,
        };
        let batch_size = self.config.effective_batch_size().max(1);
        let stamp = ImportStamp::active(options.batch_id.clone(), Utc::now());
        let mut seen: HashSet<NaturalKey> = HashSet::new();
        let mut pending = PendingBatch::new(table);
        let mut processed = 0u64;

        log::info!(
            "Loading {table} ({:?}, batch_size={batch_size}, batch_id={})",
            options.mode,
            options.batch_id
        );

        for record in records {
            processed += 1;
            if processed % self.config.checkpoint_interval.max(1) == 0 {
                self.save_checkpoint(&import_id, table, processed, pending.last_key.as_ref(), false);
            }

            let Some(mut row) = map_record(&record, fixtures, &stamp) else {
                result.skipped += 1;
                continue;
            };
            if row.table() != table {
                result.invalid += 1;
                result.push_error(format!(
                    "{} record cannot be loaded into {table}",
                    record.schema()
                ));
                continue;
            }

            let key = row.natural_key();
            if seen.contains(&key) {
                result.skipped += 1;
                continue;
            }
            let is_update = existing.contains(&key);
            if is_update && policy == ConflictPolicy::Skip {
                seen.insert(key);
                result.skipped += 1;
                continue;
            }

            if let Some(parents) = &parents {
                let parent = parents.get(row.account_number());
                if parent.is_none() && self.config.orphan_policy == OrphanPolicy::Reject {
                    result.invalid += 1;
                    continue;
                }
                row.set_property_id(parent);
            }

            if let Err(row) = row.push_into(&mut pending.rows) {
                result.invalid += 1;
                result.push_error(format!("{}: row does not fit batch", row.account_number()));
                continue;
            }
            if is_update {
                pending.updates += 1;
            }
            pending.last_key = Some(key.clone());
            seen.insert(key);

            if pending.rows.len() >= batch_size {
                self.flush(&mut pending, policy, &mut result);
                log::info!(
                    "Loaded {} {table} rows (updated: {}, invalid: {}, skipped: {}, failed: {})",
                    result.loaded,
                    result.updated,
                    result.invalid,
                    result.skipped,
                    result.failed
                );
            }
        }
        self.flush(&mut pending, policy, &mut result);
        self.save_checkpoint(&import_id, table, processed, pending.last_key.as_ref(), true);

        if table == TableId::Properties {
            self.reset_parents();
        }

        result.duration = start.elapsed();
        log::info!(
            "Completed {table}: {} loaded, {} updated, {} invalid, {} skipped, {} failed in {:.1}s",
            result.loaded,
            result.updated,
            result.invalid,
            result.skipped,
            result.failed,
            result.duration.as_secs_f64()
        );
        result
    }

    /// Marks active rows of `table` older than `before` and not from
    /// `exclude_batch` as superseded. Properties carry no history, so
    /// nothing changes for them.
    ///
    /// # Errors
    ///
    /// * If the store update fails
    pub fn mark_inactive(
        &mut self,
        table: TableId,
        before: DateTime<Utc>,
        exclude_batch: &str,
    ) -> Result<u64, DbError> {
        if !table.is_child() {
            return Ok(0);
        }
        let changed = self.store.mark_superseded(table, before, exclude_batch)?;
        if changed > 0 {
            log::info!("Marked {changed} {table} rows superseded");
        }
        Ok(changed)
    }

    /// Deletes superseded rows of `table` one batch-sized chunk at a time
    /// until none remain. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// * If a chunk cannot be deleted; earlier chunks stay deleted
    pub fn delete_inactive(&mut self, table: TableId) -> Result<u64, DbError> {
        if !table.is_child() {
            return Ok(0);
        }
        let chunk = self.config.effective_batch_size().max(1);
        let mut deleted = 0;
        loop {
            let removed = self.store.delete_superseded(table, chunk)?;
            if removed == 0 {
                break;
            }
            deleted += removed;
            log::debug!("Deleted {removed} superseded {table} rows ({deleted} so far)");
        }
        if deleted > 0 {
            log::info!("Deleted {deleted} superseded {table} rows");
        }
        Ok(deleted)
    }

    /// Links unlinked child rows of `table` to their property, where one
    /// now exists.
    ///
    /// # Errors
    ///
    /// * If the store update fails
    pub fn link_orphans(&mut self, table: TableId) -> Result<u64, DbError> {
        let linked = self.store.link_orphans(table)?;
        if linked > 0 {
            log::info!("Linked {linked} orphaned {table} rows");
        }
        Ok(linked)
    }

    /// Applies coordinate updates in chunks of the batch size. Returns the
    /// number of properties that matched.
    ///
    /// # Errors
    ///
    /// * If a chunk cannot be written; earlier chunks stay applied
    pub fn update_coordinates(&mut self, updates: &[CoordinateUpdate]) -> Result<u64, DbError> {
        let mut matched = 0;
        for chunk in updates.chunks(self.config.effective_batch_size().max(1)) {
            matched += self.store.update_coordinates(chunk)?;
        }
        Ok(matched)
    }

    /// Total and active row counts per table.
    ///
    /// # Errors
    ///
    /// * If the store cannot count
    pub fn record_counts(&self) -> Result<Vec<TableCounts>, DbError> {
        self.store.table_counts()
    }

    /// Truncates or prefetches the keys to skip for this load.
    fn prepare(&mut self, table: TableId, mode: LoadMode) -> Result<HashSet<NaturalKey>, DbError> {
        match mode {
            LoadMode::Truncate => {
                let removed = self.store.truncate(table)?;
                log::info!("Truncated {table} ({removed} rows)");
                if table == TableId::Properties {
                    self.reset_parents();
                }
                Ok(HashSet::new())
            }
            LoadMode::Append => {
                let keys = self.store.natural_keys(table)?;
                log::info!("Found {} existing {table} keys", keys.len());
                Ok(keys)
            }
        }
    }

    fn flush(&mut self, pending: &mut PendingBatch, policy: ConflictPolicy, result: &mut LoadResult) {
        if pending.rows.is_empty() {
            return;
        }
        let batch = pending.rows.take();
        let updates = std::mem::take(&mut pending.updates);
        let size = batch.len() as u64;
        let attempts = self.config.max_retries_per_batch + 1;

        for attempt in 1..=attempts {
            match self.store.write_batch(&batch, policy) {
                Ok(_) => {
                    result.loaded += size - updates;
                    result.updated += updates;
                    return;
                }
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "{} batch write failed (attempt {attempt}/{attempts}), retrying: {e}",
                        batch.table()
                    );
                }
                Err(e) => {
                    log::error!(
                        "{} batch of {size} rows failed after {attempts} attempt(s): {e}",
                        batch.table()
                    );
                    result.failed += size;
                    result.push_error(format!("batch of {size} rows failed: {e}"));
                }
            }
        }
    }

    fn save_checkpoint(
        &mut self,
        import_id: &str,
        table: TableId,
        records_processed: u64,
        last_key: Option<&NaturalKey>,
        completed: bool,
    ) {
        let checkpoint = ImportCheckpoint {
            import_id: import_id.to_string(),
            table,
            records_processed,
            last_key: last_key.map(key_label),
            completed,
            updated_at: Utc::now(),
        };
        log::debug!(
            "Checkpoint {import_id}: {records_processed} records (completed: {completed})"
        );
        self.checkpoints.insert(import_id.to_string(), checkpoint);
    }
}

#[cfg(test)]
mod tests {
    use taxroll_database::memory::MemoryStore;
    use taxroll_transform::{SchemaId, Value};

    use super::*;

    fn text(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    fn property(acct: &str) -> Record {
        Record::empty(SchemaId::RealAcct)
            .with("account_number", text(acct))
            .with("owner_name", text("OWNER"))
    }

    fn building(acct: &str, number: i64) -> Record {
        Record::empty(SchemaId::BuildingRes)
            .with("account_number", text(acct))
            .with("building_number", Value::Int(number))
            .with("year_built", Value::Int(1990))
    }

    fn manager(config: LoadConfig) -> LoadManager<MemoryStore> {
        LoadManager::new(MemoryStore::new(), &config)
    }

    fn truncate(batch: &str) -> LoadOptions {
        LoadOptions::new(LoadMode::Truncate, batch)
    }

    fn append(batch: &str) -> LoadOptions {
        LoadOptions::new(LoadMode::Append, batch)
    }

    #[test]
    fn batch_ids_have_timestamp_and_suffix() {
        let id = generate_batch_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_batch_id());
    }

    #[test]
    fn loads_properties_in_batches() {
        let mut loader = manager(LoadConfig {
            batch_size: 2,
            ..LoadConfig::default()
        });
        let records = ["1", "2", "3", "4", "5"].map(property);
        let result = loader.load_records(TableId::Properties, records, None, &truncate("a"));
        assert_eq!(result.loaded, 5);
        assert!(result.success());
        assert_eq!(loader.store().count(TableId::Properties, false).unwrap(), 5);
        assert_eq!(loader.store().property("3").unwrap().id, 3);
    }

    #[test]
    fn skips_empty_keys_and_in_run_duplicates() {
        let mut loader = manager(LoadConfig::default());
        let records = vec![
            property("1"),
            property("1"),
            Record::empty(SchemaId::RealAcct),
            property("2"),
        ];
        let result = loader.load_records(TableId::Properties, records, None, &truncate("a"));
        assert_eq!(result.loaded, 2);
        assert_eq!(result.skipped, 2);
    }

    #[test]
    fn append_is_idempotent() {
        let mut loader = manager(LoadConfig::default());
        let records = || vec![property("1"), property("2")];

        let first = loader.load_records(TableId::Properties, records(), None, &append("a"));
        assert_eq!(first.loaded, 2);
        let second = loader.load_records(TableId::Properties, records(), None, &append("b"));
        assert_eq!(second.loaded, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(loader.store().count(TableId::Properties, false).unwrap(), 2);
    }

    #[test]
    fn children_need_a_parent() {
        let mut loader = manager(LoadConfig::default());
        loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));

        let result = loader.load_records(
            TableId::BuildingDetails,
            [building("1", 1), building("9", 1)],
            None,
            &truncate("a"),
        );
        assert_eq!(result.loaded, 1);
        assert_eq!(result.invalid, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(
            loader.store().building("1", 1).unwrap().property_id,
            Some(1)
        );
    }

    #[test]
    fn kept_orphans_link_once_parent_arrives() {
        let mut loader = manager(LoadConfig {
            orphan_policy: OrphanPolicy::Keep,
            ..LoadConfig::default()
        });
        let result = loader.load_records(
            TableId::BuildingDetails,
            [building("7", 1)],
            None,
            &truncate("a"),
        );
        assert_eq!(result.loaded, 1);
        assert_eq!(loader.store().building("7", 1).unwrap().property_id, None);

        loader.load_records(TableId::Properties, [property("7")], None, &append("a"));
        assert_eq!(loader.link_orphans(TableId::BuildingDetails).unwrap(), 1);
        assert_eq!(
            loader.store().building("7", 1).unwrap().property_id,
            Some(1)
        );
    }

    #[test]
    fn parent_snapshot_rebuilt_after_property_load() {
        let mut loader = manager(LoadConfig::default());
        loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));
        assert_eq!(loader.parents().unwrap().len(), 1);

        loader.load_records(TableId::Properties, [property("2")], None, &append("a"));
        let parents = loader.parents().unwrap();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents.get("2"), Some(2));
    }

    #[test]
    fn child_append_updates_and_supersedes() {
        let mut loader = manager(LoadConfig::default());
        loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));
        loader.load_records(
            TableId::BuildingDetails,
            [building("1", 1), building("1", 2)],
            None,
            &truncate("a"),
        );

        let result = loader.load_records(
            TableId::BuildingDetails,
            [building("1", 1), building("1", 3)],
            None,
            &append("b"),
        );
        assert_eq!(result.loaded, 1);
        assert_eq!(result.updated, 1);

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let superseded = loader
            .mark_inactive(TableId::BuildingDetails, cutoff, "b")
            .unwrap();
        assert_eq!(superseded, 1);
        assert!(!loader.store().building("1", 2).unwrap().stamp.is_active());
        assert!(loader.store().building("1", 1).unwrap().stamp.is_active());
        assert_eq!(loader.store().building("1", 1).unwrap().stamp.batch_id, "b");
        assert_eq!(
            loader.store().count(TableId::BuildingDetails, true).unwrap(),
            2
        );
        assert_eq!(
            loader.mark_inactive(TableId::Properties, cutoff, "b").unwrap(),
            0
        );
    }

    #[test]
    fn delete_inactive_purges_in_chunks() {
        let mut loader = manager(LoadConfig {
            batch_size: 1,
            ..LoadConfig::default()
        });
        loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));
        loader.load_records(
            TableId::BuildingDetails,
            [building("1", 1), building("1", 2), building("1", 3)],
            None,
            &truncate("a"),
        );
        loader.load_records(TableId::BuildingDetails, [building("1", 1)], None, &append("b"));

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(
            loader.mark_inactive(TableId::BuildingDetails, cutoff, "b").unwrap(),
            2
        );
        assert_eq!(loader.delete_inactive(TableId::BuildingDetails).unwrap(), 2);

        assert!(loader.store().building("1", 2).is_none());
        assert!(loader.store().building("1", 3).is_none());
        assert!(loader.store().building("1", 1).unwrap().stamp.is_active());
        assert_eq!(
            loader.store().count(TableId::BuildingDetails, false).unwrap(),
            1
        );
        assert_eq!(loader.delete_inactive(TableId::BuildingDetails).unwrap(), 0);
        assert_eq!(loader.delete_inactive(TableId::Properties).unwrap(), 0);
        assert_eq!(loader.store().count(TableId::Properties, false).unwrap(), 1);
    }

    #[test]
    fn parent_snapshot_is_shared_until_reset() {
        let mut loader = manager(LoadConfig::default());
        loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));
        let first = loader.parents().unwrap();
        assert!(Arc::ptr_eq(&first, &loader.parents().unwrap()));

        loader.reset_parents();
        assert!(!Arc::ptr_eq(&first, &loader.parents().unwrap()));
    }

    #[test]
    fn retries_failed_batches() {
        let mut loader = manager(LoadConfig {
            max_retries_per_batch: 2,
            ..LoadConfig::default()
        });
        loader.store_mut().inject_write_failures(2);
        let result = loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));
        assert_eq!(result.loaded, 1);
        assert_eq!(result.failed, 0);
    }

    #[test]
    fn exhausted_batches_count_as_failed_without_undoing_others() {
        let mut loader = manager(LoadConfig {
            batch_size: 1,
            max_retries_per_batch: 0,
            ..LoadConfig::default()
        });
        loader.store_mut().inject_write_failures(1);
        let result = loader.load_records(
            TableId::Properties,
            [property("1"), property("2")],
            None,
            &truncate("a"),
        );
        assert_eq!(result.failed, 1);
        assert_eq!(result.loaded, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(!result.success());
        assert!(loader.store().property("2").is_some());
    }

    #[test]
    fn records_checkpoints() {
        let mut loader = manager(LoadConfig {
            checkpoint_interval: 2,
            ..LoadConfig::default()
        });
        let records = ["1", "2", "3"].map(property);
        loader.load_records(TableId::Properties, records, None, &truncate("run"));

        let checkpoint = loader.checkpoint("properties_run").unwrap();
        assert!(checkpoint.completed);
        assert_eq!(checkpoint.records_processed, 3);
        assert_eq!(checkpoint.last_key.as_deref(), Some("3"));
        assert!(loader.checkpoint("missing").is_none());
    }

    #[test]
    fn reports_counts_per_table() {
        let mut loader = manager(LoadConfig::default());
        loader.load_records(TableId::Properties, [property("1")], None, &truncate("a"));
        let counts = loader.record_counts().unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts[0].table, TableId::Properties);
        assert_eq!(counts[0].total, 1);
    }

    #[test]
    fn coordinates_update_in_chunks() {
        let mut loader = manager(LoadConfig {
            batch_size: 1,
            ..LoadConfig::default()
        });
        loader.load_records(
            TableId::Properties,
            [property("1"), property("2")],
            None,
            &truncate("a"),
        );
        let updates = ["1", "2", "3"].map(|acct| CoordinateUpdate {
            account_number: acct.to_string(),
            latitude: 29.76,
            longitude: -95.37,
        });
        assert_eq!(loader.update_coordinates(&updates).unwrap(), 2);
        assert_eq!(loader.store().property("2").unwrap().row.latitude, Some(29.76));
    }
}
