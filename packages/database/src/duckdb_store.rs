//! `DuckDB` storage for the property tables.
//!
//! One file holds all three tables. Each write runs inside its own
//! transaction and is rolled back on the first error.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use taxroll_database_models::{
    BuildingRow, ConflictPolicy, CoordinateUpdate, FeatureRow, NaturalKey, PropertyRow, RowBatch,
    TableId,
};

use crate::{DbError, Store};

/// Timestamps are bound as text and cast in SQL.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const PROPERTY_COLUMNS: &[&str] = &[
    "id",
    "account_number",
    "owner_name",
    "address",
    "city",
    "zipcode",
    "value",
    "assessed_value",
    "building_area",
    "land_area",
    "latitude",
    "longitude",
    "is_active",
    "import_date",
    "import_batch_id",
];

const BUILDING_COLUMNS: &[&str] = &[
    "property_id",
    "account_number",
    "building_number",
    "building_type",
    "building_style",
    "building_class",
    "quality_code",
    "condition_code",
    "year_built",
    "year_remodeled",
    "effective_year",
    "heat_area",
    "base_area",
    "gross_area",
    "stories",
    "foundation_type",
    "exterior_wall",
    "roof_cover",
    "roof_type",
    "bedrooms",
    "bathrooms",
    "half_baths",
    "fireplaces",
    "is_active",
    "import_date",
    "import_batch_id",
];

const FEATURE_COLUMNS: &[&str] = &[
    "property_id",
    "account_number",
    "feature_number",
    "feature_code",
    "feature_description",
    "quantity",
    "area",
    "length",
    "width",
    "quality_code",
    "condition_code",
    "year_built",
    "value",
    "is_active",
    "import_date",
    "import_batch_id",
];

/// A [`Store`] over a `DuckDB` connection.
pub struct DuckDbStore {
    conn: Connection,
}

impl DuckDbStore {
    /// Opens (or creates) the database file and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        crate::paths::ensure_parent(path)?;
        let conn = Connection::open(path)?;
        log::debug!("Opened {}", path.display());
        Self::with_connection(conn)
    }

    /// A throwaway in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        create_schema(&conn)?;
        Ok(Self { conn })
    }

    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback failed after {e}: {rollback}");
                }
                Err(e)
            }
        }
    }
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS properties (
            id BIGINT NOT NULL,
            account_number TEXT NOT NULL PRIMARY KEY,
            owner_name TEXT,
            address TEXT,
            city TEXT,
            zipcode TEXT,
            value DOUBLE,
            assessed_value DOUBLE,
            building_area DOUBLE,
            land_area DOUBLE,
            latitude DOUBLE,
            longitude DOUBLE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            import_date TIMESTAMP NOT NULL,
            import_batch_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS building_details (
            property_id BIGINT,
            account_number TEXT NOT NULL,
            building_number BIGINT NOT NULL,
            building_type TEXT,
            building_style TEXT,
            building_class TEXT,
            quality_code TEXT,
            condition_code TEXT,
            year_built BIGINT,
            year_remodeled BIGINT,
            effective_year BIGINT,
            heat_area DOUBLE,
            base_area DOUBLE,
            gross_area DOUBLE,
            stories DOUBLE,
            foundation_type TEXT,
            exterior_wall TEXT,
            roof_cover TEXT,
            roof_type TEXT,
            bedrooms BIGINT,
            bathrooms DOUBLE,
            half_baths BIGINT,
            fireplaces BIGINT,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            import_date TIMESTAMP NOT NULL,
            import_batch_id TEXT NOT NULL,
            PRIMARY KEY (account_number, building_number)
        );

        CREATE TABLE IF NOT EXISTS extra_features (
            property_id BIGINT,
            account_number TEXT NOT NULL,
            feature_number BIGINT NOT NULL,
            feature_code TEXT NOT NULL,
            feature_description TEXT,
            quantity DOUBLE,
            area DOUBLE,
            length DOUBLE,
            width DOUBLE,
            quality_code TEXT,
            condition_code TEXT,
            year_built BIGINT,
            value DOUBLE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            import_date TIMESTAMP NOT NULL,
            import_batch_id TEXT NOT NULL,
            PRIMARY KEY (account_number, feature_number, feature_code)
        );",
    )?;
    Ok(())
}

/// Builds an `INSERT ... ON CONFLICT` statement.
///
/// Under [`ConflictPolicy::Upsert`] every non-key column is overwritten
/// except `id`; `property_id`, `latitude` and `longitude` keep their
/// stored value when the incoming one is null.
fn insert_sql(
    table: TableId,
    columns: &[&str],
    key: &[&str],
    policy: ConflictPolicy,
) -> String {
    let placeholders = columns
        .iter()
        .map(|c| if *c == "import_date" { "CAST(? AS TIMESTAMP)" } else { "?" })
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT ({})",
        columns.join(", "),
        key.join(", "),
    );

    match policy {
        ConflictPolicy::Skip => sql.push_str(" DO NOTHING"),
        ConflictPolicy::Upsert => {
            let sets = columns
                .iter()
                .filter(|c| **c != "id" && !key.contains(*c))
                .map(|c| match *c {
                    "property_id" | "latitude" | "longitude" => {
                        format!("{c} = COALESCE(EXCLUDED.{c}, {table}.{c})")
                    }
                    _ => format!("{c} = EXCLUDED.{c}"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" DO UPDATE SET ");
            sql.push_str(&sets);
        }
    }
    sql
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn affected(rows: usize) -> u64 {
    u64::try_from(rows).unwrap_or(0)
}

fn write_properties(
    conn: &Connection,
    rows: &[PropertyRow],
    policy: ConflictPolicy,
) -> Result<u64, DbError> {
    let mut next_id: i64 =
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM properties", [], |row| row.get(0))?;
    let sql = insert_sql(
        TableId::Properties,
        PROPERTY_COLUMNS,
        &["account_number"],
        policy,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut written = 0u64;

    for row in rows {
        next_id += 1;
        written += affected(stmt.execute(params![
            next_id,
            row.account_number,
            row.owner_name.as_deref(),
            row.address.as_deref(),
            row.city.as_deref(),
            row.zipcode.as_deref(),
            row.value,
            row.assessed_value,
            row.building_area,
            row.land_area,
            row.latitude,
            row.longitude,
            row.stamp.is_active(),
            timestamp(&row.stamp.import_date),
            row.stamp.batch_id,
        ])?);
    }
    Ok(written)
}

fn write_buildings(
    conn: &Connection,
    rows: &[BuildingRow],
    policy: ConflictPolicy,
) -> Result<u64, DbError> {
    let sql = insert_sql(
        TableId::BuildingDetails,
        BUILDING_COLUMNS,
        &["account_number", "building_number"],
        policy,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut written = 0u64;

    for row in rows {
        written += affected(stmt.execute(params![
            row.property_id,
            row.account_number,
            row.building_number,
            row.building_type.as_deref(),
            row.building_style.as_deref(),
            row.building_class.as_deref(),
            row.quality_code.as_deref(),
            row.condition_code.as_deref(),
            row.year_built,
            row.year_remodeled,
            row.effective_year,
            row.heat_area,
            row.base_area,
            row.gross_area,
            row.stories,
            row.foundation_type.as_deref(),
            row.exterior_wall.as_deref(),
            row.roof_cover.as_deref(),
            row.roof_type.as_deref(),
            row.bedrooms,
            row.bathrooms,
            row.half_baths,
            row.fireplaces,
            row.stamp.is_active(),
            timestamp(&row.stamp.import_date),
            row.stamp.batch_id,
        ])?);
    }
    Ok(written)
}

fn write_features(
    conn: &Connection,
    rows: &[FeatureRow],
    policy: ConflictPolicy,
) -> Result<u64, DbError> {
    let sql = insert_sql(
        TableId::ExtraFeatures,
        FEATURE_COLUMNS,
        &["account_number", "feature_number", "feature_code"],
        policy,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut written = 0u64;

    for row in rows {
        written += affected(stmt.execute(params![
            row.property_id,
            row.account_number,
            row.feature_number,
            row.feature_code,
            row.feature_description.as_deref(),
            row.quantity,
            row.area,
            row.length,
            row.width,
            row.quality_code.as_deref(),
            row.condition_code.as_deref(),
            row.year_built,
            row.value,
            row.stamp.is_active(),
            timestamp(&row.stamp.import_date),
            row.stamp.batch_id,
        ])?);
    }
    Ok(written)
}

impl Store for DuckDbStore {
    fn truncate(&mut self, table: TableId) -> Result<u64, DbError> {
        self.in_transaction(|conn| {
            let removed = conn.execute(&format!("DELETE FROM {table}"), [])?;
            if table == TableId::Properties {
                for child in TableId::children() {
                    conn.execute(
                        &format!(
                            "UPDATE {child} SET property_id = NULL WHERE property_id IS NOT NULL"
                        ),
                        [],
                    )?;
                }
            }
            log::info!("Truncated {table}: {removed} rows removed");
            Ok(affected(removed))
        })
    }

    fn natural_keys(&self, table: TableId) -> Result<HashSet<NaturalKey>, DbError> {
        let sql = match table {
            TableId::Properties => "SELECT account_number, 0, '' FROM properties",
            TableId::BuildingDetails => {
                "SELECT account_number, building_number, '' FROM building_details"
            }
            TableId::ExtraFeatures => {
                "SELECT account_number, feature_number, feature_code FROM extra_features"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let keys = stmt
            .query_map([], |row| {
                Ok(NaturalKey {
                    account_number: row.get(0)?,
                    number: row.get(1)?,
                    code: row.get(2)?,
                })
            })?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    fn property_ids(&self) -> Result<HashMap<String, i64>, DbError> {
        let mut stmt = self.conn.prepare("SELECT account_number, id FROM properties")?;
        let ids = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(ids)
    }

    fn write_batch(&mut self, batch: &RowBatch, policy: ConflictPolicy) -> Result<u64, DbError> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.in_transaction(|conn| match batch {
            RowBatch::Properties(rows) => write_properties(conn, rows, policy),
            RowBatch::Buildings(rows) => write_buildings(conn, rows, policy),
            RowBatch::Features(rows) => write_features(conn, rows, policy),
        })
    }

    fn mark_superseded(
        &mut self,
        table: TableId,
        before: DateTime<Utc>,
        exclude_batch: &str,
    ) -> Result<u64, DbError> {
        if !table.is_child() {
            return Ok(0);
        }
        self.in_transaction(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {table} SET is_active = FALSE
                     WHERE is_active
                       AND import_date < CAST(? AS TIMESTAMP)
                       AND import_batch_id <> ?"
                ),
                params![timestamp(&before), exclude_batch],
            )?;
            Ok(affected(changed))
        })
    }

    fn delete_superseded(&mut self, table: TableId, limit: usize) -> Result<u64, DbError> {
        if !table.is_child() || limit == 0 {
            return Ok(0);
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.in_transaction(|conn| {
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM {table}
                     WHERE rowid IN (SELECT rowid FROM {table} WHERE NOT is_active LIMIT ?)"
                ),
                params![limit],
            )?;
            Ok(affected(deleted))
        })
    }

    fn link_orphans(&mut self, table: TableId) -> Result<u64, DbError> {
        if !table.is_child() {
            return Ok(0);
        }
        self.in_transaction(|conn| {
            let linked = conn.execute(
                &format!(
                    "UPDATE {table} SET property_id = p.id
                     FROM properties p
                     WHERE {table}.property_id IS NULL
                       AND {table}.account_number = p.account_number"
                ),
                [],
            )?;
            Ok(affected(linked))
        })
    }

    fn update_coordinates(&mut self, updates: &[CoordinateUpdate]) -> Result<u64, DbError> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.in_transaction(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE properties SET latitude = ?, longitude = ? WHERE account_number = ?",
            )?;
            let mut matched = 0u64;
            for update in updates {
                matched += affected(stmt.execute(params![
                    update.latitude,
                    update.longitude,
                    update.account_number,
                ])?);
            }
            Ok(matched)
        })
    }

    fn count(&self, table: TableId, active_only: bool) -> Result<u64, DbError> {
        let sql = if active_only && table.is_child() {
            format!("SELECT COUNT(*) FROM {table} WHERE is_active")
        } else {
            format!("SELECT COUNT(*) FROM {table}")
        };
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::memory::test_rows::{building, feature, property};

    #[test]
    fn skip_and_upsert() {
        let now = Utc::now();
        let mut store = DuckDbStore::open_in_memory().unwrap();
        let batch = RowBatch::Properties(vec![property("A", "b1", now), property("B", "b1", now)]);
        assert_eq!(store.write_batch(&batch, ConflictPolicy::Skip).unwrap(), 2);
        assert_eq!(store.write_batch(&batch, ConflictPolicy::Skip).unwrap(), 0);

        let ids = store.property_ids().unwrap();
        assert_eq!(ids["A"], 1);
        assert_eq!(ids["B"], 2);

        let mut row = building("A", 1, "b1", now);
        row.property_id = Some(1);
        store
            .write_batch(&RowBatch::Buildings(vec![row]), ConflictPolicy::Skip)
            .unwrap();
        let newer = building("A", 1, "b2", now);
        assert_eq!(
            store
                .write_batch(&RowBatch::Buildings(vec![newer]), ConflictPolicy::Upsert)
                .unwrap(),
            1
        );
        let linked: Option<i64> = store
            .conn
            .query_row(
                "SELECT property_id FROM building_details WHERE import_batch_id = 'b2'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(linked, Some(1));
    }

    #[test]
    fn superseding_and_orphans() {
        let start = Utc::now();
        let earlier = start - Duration::days(1);
        let mut store = DuckDbStore::open_in_memory().unwrap();
        store
            .write_batch(
                &RowBatch::Features(vec![
                    feature("A", 1, "POOL", "old", earlier),
                    feature("A", 1, "SHED", "new", start),
                ]),
                ConflictPolicy::Skip,
            )
            .unwrap();
        assert_eq!(
            store
                .mark_superseded(TableId::ExtraFeatures, start, "new")
                .unwrap(),
            1
        );
        assert_eq!(store.count(TableId::ExtraFeatures, true).unwrap(), 1);
        assert_eq!(store.count(TableId::ExtraFeatures, false).unwrap(), 2);

        assert_eq!(store.link_orphans(TableId::ExtraFeatures).unwrap(), 0);
        store
            .write_batch(&RowBatch::Properties(vec![property("A", "new", start)]), ConflictPolicy::Skip)
            .unwrap();
        assert_eq!(store.link_orphans(TableId::ExtraFeatures).unwrap(), 2);

        store.truncate(TableId::Properties).unwrap();
        assert_eq!(store.count(TableId::Properties, false).unwrap(), 0);
        assert_eq!(store.link_orphans(TableId::ExtraFeatures).unwrap(), 0);
    }

    #[test]
    fn purges_superseded_rows_in_chunks() {
        let start = Utc::now();
        let earlier = start - Duration::days(1);
        let mut store = DuckDbStore::open_in_memory().unwrap();
        store
            .write_batch(
                &RowBatch::Buildings(vec![
                    building("A", 1, "old", earlier),
                    building("A", 2, "old", earlier),
                    building("A", 3, "old", earlier),
                    building("B", 1, "new", start),
                ]),
                ConflictPolicy::Skip,
            )
            .unwrap();
        store
            .mark_superseded(TableId::BuildingDetails, start, "new")
            .unwrap();

        assert_eq!(store.delete_superseded(TableId::BuildingDetails, 2).unwrap(), 2);
        assert_eq!(store.count(TableId::BuildingDetails, false).unwrap(), 2);
        assert_eq!(store.delete_superseded(TableId::BuildingDetails, 2).unwrap(), 1);
        assert_eq!(store.delete_superseded(TableId::BuildingDetails, 2).unwrap(), 0);

        assert_eq!(store.count(TableId::BuildingDetails, false).unwrap(), 1);
        assert_eq!(store.count(TableId::BuildingDetails, true).unwrap(), 1);
        assert_eq!(store.delete_superseded(TableId::Properties, 2).unwrap(), 0);
    }

    #[test]
    fn keys_and_coordinates() {
        let now = Utc::now();
        let mut store = DuckDbStore::open_in_memory().unwrap();
        store
            .write_batch(&RowBatch::Properties(vec![property("A", "b", now)]), ConflictPolicy::Skip)
            .unwrap();
        store
            .write_batch(
                &RowBatch::Buildings(vec![building("A", 2, "b", now)]),
                ConflictPolicy::Skip,
            )
            .unwrap();

        let keys = store.natural_keys(TableId::BuildingDetails).unwrap();
        assert!(keys.contains(&NaturalKey::building("A", 2)));
        let keys = store.natural_keys(TableId::Properties).unwrap();
        assert!(keys.contains(&NaturalKey::property("A")));

        let updated = store
            .update_coordinates(&[CoordinateUpdate {
                account_number: "A".to_string(),
                latitude: 29.7,
                longitude: -95.4,
            }])
            .unwrap();
        assert_eq!(updated, 1);
    }

    #[test]
    fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/taxroll.duckdb");
        {
            let mut store = DuckDbStore::open(&path).unwrap();
            store
                .write_batch(
                    &RowBatch::Properties(vec![property("A", "b", Utc::now())]),
                    ConflictPolicy::Skip,
                )
                .unwrap();
        }
        let store = DuckDbStore::open(&path).unwrap();
        assert_eq!(store.count(TableId::Properties, false).unwrap(), 1);
    }
}
