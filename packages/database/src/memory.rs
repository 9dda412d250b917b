//! In-process [`Store`] backed by ordered maps.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use taxroll_database_models::{
    BuildingRow, ConflictPolicy, CoordinateUpdate, FeatureRow, ImportStamp, NaturalKey,
    PropertyRow, RowBatch, RowState, TableId,
};

use crate::{DbError, Store};

/// A property with its surrogate id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProperty {
    pub id: i64,
    pub row: PropertyRow,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    properties: BTreeMap<String, StoredProperty>,
    buildings: BTreeMap<NaturalKey, BuildingRow>,
    features: BTreeMap<NaturalKey, FeatureRow>,
    failing_writes: u32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to [`Store::write_batch`] fail without
    /// writing anything.
    pub const fn inject_write_failures(&mut self, count: u32) {
        self.failing_writes = count;
    }

    #[must_use]
    pub fn property(&self, account_number: &str) -> Option<&StoredProperty> {
        self.properties.get(account_number)
    }

    #[must_use]
    pub fn building(&self, account_number: &str, building_number: i64) -> Option<&BuildingRow> {
        self.buildings
            .get(&NaturalKey::building(account_number, building_number))
    }

    #[must_use]
    pub fn feature(
        &self,
        account_number: &str,
        feature_number: i64,
        feature_code: &str,
    ) -> Option<&FeatureRow> {
        self.features.get(&NaturalKey::feature(
            account_number,
            feature_number,
            feature_code,
        ))
    }

    pub fn buildings(&self) -> impl Iterator<Item = &BuildingRow> {
        self.buildings.values()
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureRow> {
        self.features.values()
    }

    fn next_property_id(&self) -> i64 {
        self.properties.values().map(|p| p.id).max().unwrap_or(0) + 1
    }

    fn stamps_mut(&mut self, table: TableId) -> Box<dyn Iterator<Item = &mut ImportStamp> + '_> {
        match table {
            TableId::Properties => Box::new(self.properties.values_mut().map(|p| &mut p.row.stamp)),
            TableId::BuildingDetails => Box::new(self.buildings.values_mut().map(|b| &mut b.stamp)),
            TableId::ExtraFeatures => Box::new(self.features.values_mut().map(|f| &mut f.stamp)),
        }
    }

    fn parents_mut(&mut self, table: TableId) -> Box<dyn Iterator<Item = (&str, &mut Option<i64>)> + '_> {
        match table {
            TableId::Properties => Box::new(std::iter::empty()),
            TableId::BuildingDetails => Box::new(
                self.buildings
                    .values_mut()
                    .map(|b| (b.account_number.as_str(), &mut b.property_id)),
            ),
            TableId::ExtraFeatures => Box::new(
                self.features
                    .values_mut()
                    .map(|f| (f.account_number.as_str(), &mut f.property_id)),
            ),
        }
    }
}

fn upsert_child<R: Clone>(
    rows: &mut BTreeMap<NaturalKey, R>,
    key: NaturalKey,
    row: &R,
    policy: ConflictPolicy,
    parent: impl Fn(&mut R) -> &mut Option<i64>,
) -> bool {
    match rows.get_mut(&key) {
        None => {
            rows.insert(key, row.clone());
            true
        }
        Some(_) if policy == ConflictPolicy::Skip => false,
        Some(existing) => {
            let linked = *parent(existing);
            *existing = row.clone();
            let slot = parent(existing);
            if slot.is_none() {
                *slot = linked;
            }
            true
        }
    }
}

impl Store for MemoryStore {
    fn truncate(&mut self, table: TableId) -> Result<u64, DbError> {
        let removed = match table {
            TableId::Properties => {
                let removed = self.properties.len();
                self.properties.clear();
                for child in TableId::children() {
                    for (_, parent) in self.parents_mut(child) {
                        *parent = None;
                    }
                }
                removed
            }
            TableId::BuildingDetails => {
                let removed = self.buildings.len();
                self.buildings.clear();
                removed
            }
            TableId::ExtraFeatures => {
                let removed = self.features.len();
                self.features.clear();
                removed
            }
        };
        Ok(removed as u64)
    }

    fn natural_keys(&self, table: TableId) -> Result<HashSet<NaturalKey>, DbError> {
        Ok(match table {
            TableId::Properties => self
                .properties
                .keys()
                .map(NaturalKey::property)
                .collect(),
            TableId::BuildingDetails => self.buildings.keys().cloned().collect(),
            TableId::ExtraFeatures => self.features.keys().cloned().collect(),
        })
    }

    fn property_ids(&self) -> Result<HashMap<String, i64>, DbError> {
        Ok(self
            .properties
            .iter()
            .map(|(account, p)| (account.clone(), p.id))
            .collect())
    }

    fn write_batch(&mut self, batch: &RowBatch, policy: ConflictPolicy) -> Result<u64, DbError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(DbError::Rejected {
                table: batch.table(),
                message: "injected write failure".to_string(),
            });
        }

        let mut written = 0u64;
        match batch {
            RowBatch::Properties(rows) => {
                let mut next_id = self.next_property_id();
                for row in rows {
                    match self.properties.get_mut(&row.account_number) {
                        None => {
                            self.properties.insert(
                                row.account_number.clone(),
                                StoredProperty {
                                    id: next_id,
                                    row: row.clone(),
                                },
                            );
                            next_id += 1;
                        }
                        Some(_) if policy == ConflictPolicy::Skip => continue,
                        Some(existing) => {
                            let (lat, lon) = (existing.row.latitude, existing.row.longitude);
                            existing.row = row.clone();
                            existing.row.latitude = existing.row.latitude.or(lat);
                            existing.row.longitude = existing.row.longitude.or(lon);
                        }
                    }
                    written += 1;
                }
            }
            RowBatch::Buildings(rows) => {
                for row in rows {
                    if upsert_child(&mut self.buildings, row.natural_key(), row, policy, |b| {
                        &mut b.property_id
                    }) {
                        written += 1;
                    }
                }
            }
            RowBatch::Features(rows) => {
                for row in rows {
                    if upsert_child(&mut self.features, row.natural_key(), row, policy, |f| {
                        &mut f.property_id
                    }) {
                        written += 1;
                    }
                }
            }
        }
        Ok(written)
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
        let mut changed = 0u64;
        for stamp in self.stamps_mut(table) {
            if stamp.is_active() && stamp.import_date < before && stamp.batch_id != exclude_batch
            {
                stamp.state = RowState::Superseded;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn delete_superseded(&mut self, table: TableId, limit: usize) -> Result<u64, DbError> {
        let deleted = match table {
            TableId::Properties => 0,
            TableId::BuildingDetails => retain_up_to(&mut self.buildings, limit, |b| &b.stamp),
            TableId::ExtraFeatures => retain_up_to(&mut self.features, limit, |f| &f.stamp),
        };
        Ok(deleted as u64)
    }

    fn link_orphans(&mut self, table: TableId) -> Result<u64, DbError> {
        let ids = self.property_ids()?;
        let mut linked = 0u64;
        for (account, parent) in self.parents_mut(table) {
            if parent.is_none()
                && let Some(id) = ids.get(account)
            {
                *parent = Some(*id);
                linked += 1;
            }
        }
        Ok(linked)
    }

    fn update_coordinates(&mut self, updates: &[CoordinateUpdate]) -> Result<u64, DbError> {
        let mut matched = 0u64;
        for update in updates {
            if let Some(property) = self.properties.get_mut(&update.account_number) {
                property.row.latitude = Some(update.latitude);
                property.row.longitude = Some(update.longitude);
                matched += 1;
            }
        }
        Ok(matched)
    }

    fn count(&self, table: TableId, active_only: bool) -> Result<u64, DbError> {
        let count = match (table, active_only) {
            (TableId::Properties, _) => self.properties.len(),
            (TableId::BuildingDetails, false) => self.buildings.len(),
            (TableId::ExtraFeatures, false) => self.features.len(),
            (TableId::BuildingDetails, true) => {
                self.buildings.values().filter(|b| b.stamp.is_active()).count()
            }
            (TableId::ExtraFeatures, true) => {
                self.features.values().filter(|f| f.stamp.is_active()).count()
            }
        };
        Ok(count as u64)
    }
}

/// Removes at most `limit` superseded rows, lowest keys first.
fn retain_up_to<R>(
    rows: &mut BTreeMap<NaturalKey, R>,
    limit: usize,
    stamp: impl Fn(&R) -> &ImportStamp,
) -> usize {
    let mut left = limit;
    rows.retain(|_, row| {
        if left > 0 && !stamp(row).is_active() {
            left -= 1;
            false
        } else {
            true
        }
    });
    limit - left
}

#[cfg(test)]
pub(crate) mod test_rows {
    use chrono::{DateTime, Utc};
    use taxroll_database_models::{BuildingRow, FeatureRow, ImportStamp, PropertyRow};

    pub fn property(account: &str, batch: &str, at: DateTime<Utc>) -> PropertyRow {
        PropertyRow {
            account_number: account.to_string(),
            owner_name: Some(format!("OWNER {account}")),
            address: Some("1 MAIN ST".to_string()),
            city: Some("HOUSTON".to_string()),
            zipcode: Some("77002".to_string()),
            value: Some(100_000.0),
            assessed_value: None,
            building_area: None,
            land_area: None,
            latitude: None,
            longitude: None,
            stamp: ImportStamp::active(batch, at),
        }
    }

    pub fn building(account: &str, number: i64, batch: &str, at: DateTime<Utc>) -> BuildingRow {
        BuildingRow {
            property_id: None,
            account_number: account.to_string(),
            building_number: number,
            building_type: None,
            building_style: None,
            building_class: None,
            quality_code: None,
            condition_code: None,
            year_built: Some(1990),
            year_remodeled: None,
            effective_year: None,
            heat_area: Some(1800.0),
            base_area: None,
            gross_area: None,
            stories: None,
            foundation_type: None,
            exterior_wall: None,
            roof_cover: None,
            roof_type: None,
            bedrooms: Some(3),
            bathrooms: Some(2.0),
            half_baths: None,
            fireplaces: None,
            stamp: ImportStamp::active(batch, at),
        }
    }

    pub fn feature(account: &str, number: i64, code: &str, batch: &str, at: DateTime<Utc>) -> FeatureRow {
        FeatureRow {
            property_id: None,
            account_number: account.to_string(),
            feature_number: number,
            feature_code: code.to_string(),
            feature_description: Some("Pool".to_string()),
            quantity: Some(1.0),
            area: None,
            length: None,
            width: None,
            quality_code: None,
            condition_code: None,
            year_built: None,
            value: Some(5000.0),
            stamp: ImportStamp::active(batch, at),
        }
    }
}
