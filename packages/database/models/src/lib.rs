#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Row types for the three persisted tables.
//!
//! `properties` holds one row per appraisal account. `building_details`
//! and `extra_features` are child tables keyed by account plus a
//! sub-entity number, linked to their parent through a nullable
//! `property_id`, and carry an [`ImportStamp`] for soft-delete history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// The persisted tables.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TableId {
    Properties,
    BuildingDetails,
    ExtraFeatures,
}

impl TableId {
    /// Child tables reference a property and carry soft-delete state.
    #[must_use]
    pub const fn is_child(self) -> bool {
        !matches!(self, Self::Properties)
    }

    #[must_use]
    pub const fn children() -> [Self; 2] {
        [Self::BuildingDetails, Self::ExtraFeatures]
    }
}

/// Unique identity of a row within its table.
///
/// Properties use only `account_number`; buildings add `number`; extra
/// features add `number` and `code`. Unused parts are zero or empty so
/// keys from one table always compare consistently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub account_number: String,
    pub number: i64,
    pub code: String,
}

impl NaturalKey {
    #[must_use]
    pub fn property(account_number: impl Into<String>) -> Self {
        Self {
            account_number: account_number.into(),
            number: 0,
            code: String::new(),
        }
    }

    #[must_use]
    pub fn building(account_number: impl Into<String>, building_number: i64) -> Self {
        Self {
            account_number: account_number.into(),
            number: building_number,
            code: String::new(),
        }
    }

    #[must_use]
    pub fn feature(
        account_number: impl Into<String>,
        feature_number: i64,
        feature_code: impl Into<String>,
    ) -> Self {
        Self {
            account_number: account_number.into(),
            number: feature_number,
            code: feature_code.into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RowState {
    #[default]
    Active,
    /// Replaced by a newer import; kept for history.
    Superseded,
}

/// Which import wrote a row, and whether it is still current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStamp {
    pub state: RowState,
    pub import_date: DateTime<Utc>,
    pub batch_id: String,
}

impl ImportStamp {
    #[must_use]
    pub fn active(batch_id: impl Into<String>, import_date: DateTime<Utc>) -> Self {
        Self {
            state: RowState::Active,
            import_date,
            batch_id: batch_id.into(),
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, RowState::Active)
    }
}

/// A row of `properties`. The surrogate id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRow {
    pub account_number: String,
    pub owner_name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zipcode: Option<String>,
    pub value: Option<f64>,
    pub assessed_value: Option<f64>,
    pub building_area: Option<f64>,
    pub land_area: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub stamp: ImportStamp,
}

impl PropertyRow {
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::property(&self.account_number)
    }
}

/// A row of `building_details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRow {
    /// `None` until the parent property exists.
    pub property_id: Option<i64>,
    pub account_number: String,
    pub building_number: i64,
    pub building_type: Option<String>,
    pub building_style: Option<String>,
    pub building_class: Option<String>,
    pub quality_code: Option<String>,
    pub condition_code: Option<String>,
    pub year_built: Option<i64>,
    pub year_remodeled: Option<i64>,
    pub effective_year: Option<i64>,
    pub heat_area: Option<f64>,
    pub base_area: Option<f64>,
    pub gross_area: Option<f64>,
    pub stories: Option<f64>,
    pub foundation_type: Option<String>,
    pub exterior_wall: Option<String>,
    pub roof_cover: Option<String>,
    pub roof_type: Option<String>,
    pub bedrooms: Option<i64>,
    /// Full baths plus half a bath per half bath.
    pub bathrooms: Option<f64>,
    pub half_baths: Option<i64>,
    pub fireplaces: Option<i64>,
    pub stamp: ImportStamp,
}

impl BuildingRow {
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::building(&self.account_number, self.building_number)
    }
}

/// A row of `extra_features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub property_id: Option<i64>,
    pub account_number: String,
    pub feature_number: i64,
    pub feature_code: String,
    pub feature_description: Option<String>,
    pub quantity: Option<f64>,
    pub area: Option<f64>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub quality_code: Option<String>,
    pub condition_code: Option<String>,
    pub year_built: Option<i64>,
    pub value: Option<f64>,
    pub stamp: ImportStamp,
}

impl FeatureRow {
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::feature(
            &self.account_number,
            self.feature_number,
            &self.feature_code,
        )
    }
}

/// Rows for a single table, written in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum RowBatch {
    Properties(Vec<PropertyRow>),
    Buildings(Vec<BuildingRow>),
    Features(Vec<FeatureRow>),
}

impl RowBatch {
    /// An empty batch for `table`.
    #[must_use]
    pub const fn empty(table: TableId) -> Self {
        match table {
            TableId::Properties => Self::Properties(Vec::new()),
            TableId::BuildingDetails => Self::Buildings(Vec::new()),
            TableId::ExtraFeatures => Self::Features(Vec::new()),
        }
    }

    #[must_use]
    pub const fn table(&self) -> TableId {
        match self {
            Self::Properties(_) => TableId::Properties,
            Self::Buildings(_) => TableId::BuildingDetails,
            Self::Features(_) => TableId::ExtraFeatures,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Properties(rows) => rows.len(),
            Self::Buildings(rows) => rows.len(),
            Self::Features(rows) => rows.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Natural keys in batch order.
    #[must_use]
    pub fn keys(&self) -> Vec<NaturalKey> {
        match self {
            Self::Properties(rows) => rows.iter().map(PropertyRow::natural_key).collect(),
            Self::Buildings(rows) => rows.iter().map(BuildingRow::natural_key).collect(),
            Self::Features(rows) => rows.iter().map(FeatureRow::natural_key).collect(),
        }
    }

    /// Removes and returns the buffered rows, leaving the batch empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        let table = self.table();
        std::mem::replace(self, Self::empty(table))
    }
}

/// How to treat a row whose natural key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the stored row.
    Skip,
    /// Overwrite the stored row, keeping its surrogate id and parent link.
    Upsert,
}

/// A centroid to store on a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateUpdate {
    pub account_number: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Row counts for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub table: TableId,
    pub total: u64,
    pub active: u64,
}
