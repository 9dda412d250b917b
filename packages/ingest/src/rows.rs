//! Mapping of transformed records onto table rows.

use taxroll_database_models::{
    BuildingRow, FeatureRow, ImportStamp, NaturalKey, PropertyRow, RowBatch, TableId,
};
use taxroll_transform::fixtures::FixturesAggregator;
use taxroll_transform::{Record, SchemaId};

/// Zip codes are stored as the five-digit prefix.
pub const ZIPCODE_LENGTH: usize = 5;

/// Target table for records of `schema`.
#[must_use]
pub const fn table_for_schema(schema: SchemaId) -> TableId {
    match schema {
        SchemaId::RealAcct => TableId::Properties,
        SchemaId::BuildingRes => TableId::BuildingDetails,
        SchemaId::ExtraFeatures => TableId::ExtraFeatures,
    }
}

/// One row bound for any of the three tables.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRow {
    Property(PropertyRow),
    Building(BuildingRow),
    Feature(FeatureRow),
}

impl TableRow {
    #[must_use]
    pub const fn table(&self) -> TableId {
        match self {
            Self::Property(_) => TableId::Properties,
            Self::Building(_) => TableId::BuildingDetails,
            Self::Feature(_) => TableId::ExtraFeatures,
        }
    }

    #[must_use]
    pub fn account_number(&self) -> &str {
        match self {
            Self::Property(row) => &row.account_number,
            Self::Building(row) => &row.account_number,
            Self::Feature(row) => &row.account_number,
        }
    }

    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            Self::Property(row) => row.natural_key(),
            Self::Building(row) => row.natural_key(),
            Self::Feature(row) => row.natural_key(),
        }
    }

    /// Links a child row to its property. No-op for properties.
    pub const fn set_property_id(&mut self, id: Option<i64>) {
        match self {
            Self::Property(_) => {}
            Self::Building(row) => row.property_id = id,
            Self::Feature(row) => row.property_id = id,
        }
    }

    /// Appends the row to a batch of the same table. Rows for another
    /// table are handed back.
    ///
    /// # Errors
    ///
    /// * If `batch` belongs to a different table, returning the row
    pub fn push_into(self, batch: &mut RowBatch) -> Result<(), Box<Self>> {
        match (self, batch) {
            (Self::Property(row), RowBatch::Properties(rows)) => rows.push(row),
            (Self::Building(row), RowBatch::Buildings(rows)) => rows.push(row),
            (Self::Feature(row), RowBatch::Features(rows)) => rows.push(row),
            (row, _) => return Err(Box::new(row)),
        }
        Ok(())
    }
}

/// Maps a record to its table row. Returns `None` when the record's
/// natural key is incomplete: no account number, or for child tables no
/// sub-entity number (and for features no code).
///
/// Building rows take room counts from `fixtures` when it has a nonzero
/// value for the building, and from the record otherwise.
#[must_use]
pub fn map_record(
    record: &Record,
    fixtures: Option<&FixturesAggregator>,
    stamp: &ImportStamp,
) -> Option<TableRow> {
    let account_number = record.str("account_number")?.trim();
    if account_number.is_empty() {
        return None;
    }
    match record.schema() {
        SchemaId::RealAcct => Some(TableRow::Property(property_row(
            record,
            account_number,
            stamp,
        ))),
        SchemaId::BuildingRes => {
            building_row(record, account_number, fixtures, stamp).map(TableRow::Building)
        }
        SchemaId::ExtraFeatures => feature_row(record, account_number, stamp).map(TableRow::Feature),
    }
}

fn owned(record: &Record, field: &str) -> Option<String> {
    record.str(field).map(str::to_string)
}

/// `site_addr_1` if present, otherwise `street_number street_name`.
fn address(record: &Record) -> Option<String> {
    if let Some(site) = record.str("site_addr_1") {
        return Some(site.to_string());
    }
    let joined = [record.str("street_number"), record.str("street_name")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn zipcode(record: &Record) -> Option<String> {
    record
        .str("zipcode")
        .map(|zip| zip.chars().take(ZIPCODE_LENGTH).collect())
}

fn property_row(record: &Record, account_number: &str, stamp: &ImportStamp) -> PropertyRow {
    PropertyRow {
        account_number: account_number.to_string(),
        owner_name: owned(record, "owner_name"),
        address: address(record),
        city: owned(record, "city"),
        zipcode: zipcode(record),
        value: record.float("value"),
        assessed_value: record.float("assessed_value"),
        building_area: record.float("building_area"),
        land_area: record.float("land_area"),
        latitude: None,
        longitude: None,
        stamp: stamp.clone(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn building_row(
    record: &Record,
    account_number: &str,
    fixtures: Option<&FixturesAggregator>,
    stamp: &ImportStamp,
) -> Option<BuildingRow> {
    let building_number = record.int("building_number")?;
    let rooms = fixtures
        .map(|f| f.fixtures(account_number, building_number))
        .unwrap_or_default();

    // Fractional fixture units below one count as absent.
    let bedrooms = Some(rooms.bedrooms as i64)
        .filter(|count| *count > 0)
        .or_else(|| record.int("bedrooms"));
    let half_baths = Some(rooms.half_baths as i64)
        .filter(|count| *count > 0)
        .or_else(|| record.int("half_baths"));
    let bathrooms = if rooms.has_bathrooms() {
        Some(rooms.bathrooms())
    } else {
        let full = record.float("full_baths").unwrap_or(0.0);
        let half = record.float("half_baths").unwrap_or(0.0);
        let total = half.mul_add(0.5, full);
        (total > 0.0).then_some(total)
    };

    Some(BuildingRow {
        property_id: None,
        account_number: account_number.to_string(),
        building_number,
        building_type: owned(record, "building_type"),
        building_style: owned(record, "building_style"),
        building_class: owned(record, "building_class"),
        quality_code: owned(record, "quality_code"),
        condition_code: owned(record, "condition_code"),
        year_built: record.int("year_built"),
        year_remodeled: record.int("year_remodeled"),
        effective_year: record.int("effective_year"),
        heat_area: record.float("heat_area"),
        base_area: record.float("base_area"),
        gross_area: record.float("gross_area"),
        stories: record.float("stories"),
        foundation_type: owned(record, "foundation_type"),
        exterior_wall: owned(record, "exterior_wall"),
        roof_cover: owned(record, "roof_cover"),
        roof_type: owned(record, "roof_type"),
        bedrooms,
        bathrooms,
        half_baths,
        fireplaces: record.int("fireplaces"),
        stamp: stamp.clone(),
    })
}

fn feature_row(record: &Record, account_number: &str, stamp: &ImportStamp) -> Option<FeatureRow> {
    Some(FeatureRow {
        property_id: None,
        account_number: account_number.to_string(),
        feature_number: record.int("feature_number")?,
        feature_code: record.str("feature_code")?.to_string(),
        feature_description: owned(record, "feature_description"),
        quantity: record.float("quantity"),
        area: record.float("area"),
        length: record.float("length"),
        width: record.float("width"),
        quality_code: owned(record, "quality_code"),
        condition_code: owned(record, "condition_code"),
        year_built: record.int("year_built"),
        value: record.float("value"),
        stamp: stamp.clone(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use taxroll_transform::Value;

    use super::*;

    fn stamp() -> ImportStamp {
        ImportStamp::active("batch", Utc::now())
    }

    fn text(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    #[test]
    fn property_address_falls_back_to_street_parts() {
        let record = Record::empty(SchemaId::RealAcct)
            .with("account_number", text("0011"))
            .with("street_number", text("123"))
            .with("street_name", text("MAIN ST"))
            .with("zipcode", text("77002-1234"));
        let Some(TableRow::Property(row)) = map_record(&record, None, &stamp()) else {
            panic!("expected a property row");
        };
        assert_eq!(row.address.as_deref(), Some("123 MAIN ST"));
        assert_eq!(row.zipcode.as_deref(), Some("77002"));

        let record = record.with("site_addr_1", text("1 SHELL PLZ"));
        let Some(TableRow::Property(row)) = map_record(&record, None, &stamp()) else {
            panic!("expected a property row");
        };
        assert_eq!(row.address.as_deref(), Some("1 SHELL PLZ"));
    }

    #[test]
    fn incomplete_keys_map_to_nothing() {
        let record = Record::empty(SchemaId::RealAcct);
        assert_eq!(map_record(&record, None, &stamp()), None);

        let record = Record::empty(SchemaId::BuildingRes).with("account_number", text("1"));
        assert_eq!(map_record(&record, None, &stamp()), None);

        let record = Record::empty(SchemaId::ExtraFeatures)
            .with("account_number", text("1"))
            .with("feature_number", Value::Int(1));
        assert_eq!(map_record(&record, None, &stamp()), None);
    }

    #[test]
    fn fixtures_override_row_room_counts() {
        let mut fixtures = FixturesAggregator::new();
        fixtures.load_from_reader(
            "acct\tbld_num\ttype\ttype_dscr\tunits\n\
             100\t1\tRMB\tBedroom\t4\n\
             100\t1\tRMF\tFull Bath\t2\n\
             100\t1\tRMH\tHalf Bath\t1\n"
                .as_bytes(),
        );
        let record = Record::empty(SchemaId::BuildingRes)
            .with("account_number", text("100"))
            .with("building_number", Value::Int(1))
            .with("bedrooms", Value::Int(2))
            .with("full_baths", Value::Int(1));

        let Some(TableRow::Building(row)) = map_record(&record, Some(&fixtures), &stamp()) else {
            panic!("expected a building row");
        };
        assert_eq!(row.bedrooms, Some(4));
        assert_eq!(row.bathrooms, Some(2.5));
        assert_eq!(row.half_baths, Some(1));
    }

    #[test]
    fn fractional_fixture_counts_fall_back_to_the_row() {
        let mut fixtures = FixturesAggregator::new();
        fixtures.load_from_reader(
            "acct\tbld_num\ttype\ttype_dscr\tunits\n\
             100\t1\tRMB\tBedroom\t0.5\n\
             100\t1\tRMH\tHalf Bath\t0.5\n"
                .as_bytes(),
        );
        let record = Record::empty(SchemaId::BuildingRes)
            .with("account_number", text("100"))
            .with("building_number", Value::Int(1))
            .with("bedrooms", Value::Int(3))
            .with("half_baths", Value::Int(1));

        let Some(TableRow::Building(row)) = map_record(&record, Some(&fixtures), &stamp()) else {
            panic!("expected a building row");
        };
        assert_eq!(row.bedrooms, Some(3));
        assert_eq!(row.half_baths, Some(1));
    }

    #[test]
    fn row_room_counts_used_without_fixtures() {
        let record = Record::empty(SchemaId::BuildingRes)
            .with("account_number", text("100"))
            .with("building_number", Value::Int(1))
            .with("bedrooms", Value::Int(3))
            .with("full_baths", Value::Int(2))
            .with("half_baths", Value::Int(1));

        let Some(TableRow::Building(row)) = map_record(&record, None, &stamp()) else {
            panic!("expected a building row");
        };
        assert_eq!(row.bedrooms, Some(3));
        assert_eq!(row.bathrooms, Some(2.5));
        assert_eq!(row.half_baths, Some(1));

        let bare = Record::empty(SchemaId::BuildingRes)
            .with("account_number", text("100"))
            .with("building_number", Value::Int(2));
        let Some(TableRow::Building(row)) = map_record(&bare, None, &stamp()) else {
            panic!("expected a building row");
        };
        assert_eq!(row.bathrooms, None);
    }

    #[test]
    fn push_into_rejects_other_tables() {
        let record = Record::empty(SchemaId::RealAcct).with("account_number", text("1"));
        let row = map_record(&record, None, &stamp()).unwrap();
        let mut batch = RowBatch::empty(TableId::BuildingDetails);
        assert!(row.clone().push_into(&mut batch).is_err());

        let mut batch = RowBatch::empty(TableId::Properties);
        row.push_into(&mut batch).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
