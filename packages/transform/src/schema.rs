//! Static table schemas for the appraisal roll exports.
//!
//! The set of schemas is closed: [`SchemaId`] enumerates them and
//! [`SchemaId::schema`] maps each to its definition. Column names differ
//! between export years, so each field lists every known alias.

use std::collections::BTreeSet;
use std::path::Path;

use strum_macros::{AsRefStr, Display, EnumIter};

use crate::TransformError;
use crate::record::Value;

/// Primitive type a field is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    /// Currency-style number; `$` and `,` are stripped.
    Decimal,
    Bool,
}

/// Value substituted for empty or unparseable input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Str(&'static str),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Maps one logical field onto candidate source columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSchema {
    pub name: &'static str,
    /// Lowercase column aliases, most preferred first.
    pub sources: &'static [&'static str],
    pub kind: FieldType,
    /// Maximum length in characters, for [`FieldType::Str`].
    pub max_length: Option<usize>,
    pub required: bool,
    pub default: Option<DefaultValue>,
}

impl FieldSchema {
    #[must_use]
    pub const fn new(
        name: &'static str,
        sources: &'static [&'static str],
        kind: FieldType,
    ) -> Self {
        Self {
            name,
            sources,
            kind,
            max_length: None,
            required: false,
            default: None,
        }
    }

    #[must_use]
    pub const fn max_len(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub const fn require(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub const fn or_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn default_value(&self) -> Value {
        match self.default {
            None => Value::Null,
            Some(DefaultValue::Str(s)) => Value::Str(s.to_string()),
            Some(DefaultValue::Int(i)) => Value::Int(i),
            Some(DefaultValue::Float(f)) => Value::Float(f),
            Some(DefaultValue::Bool(b)) => Value::Bool(b),
        }
    }

    /// Index of the first alias present in `headers`, which must already
    /// be trimmed and lowercased.
    #[must_use]
    pub fn resolve(&self, headers: &[String]) -> Option<usize> {
        self.sources
            .iter()
            .find_map(|alias| headers.iter().position(|h| h == alias))
    }
}

/// Ordered fields plus the natural key.
#[derive(Debug, PartialEq)]
pub struct TableSchema {
    pub id: SchemaId,
    pub fields: &'static [FieldSchema],
    pub key_fields: &'static [&'static str],
}

impl TableSchema {
    #[must_use]
    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == field)
    }

    #[must_use]
    pub fn field(&self, field: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == field)
    }

    fn validate(&self) -> Result<(), TransformError> {
        let fail = |message: String| TransformError::Schema {
            schema: self.id.to_string(),
            message,
        };
        let mut seen = BTreeSet::new();
        for field in self.fields {
            if !seen.insert(field.name) {
                return Err(fail(format!("duplicate field '{}'", field.name)));
            }
            if field.sources.is_empty() {
                return Err(fail(format!("field '{}' has no source columns", field.name)));
            }
            if let Some(alias) = field.sources.iter().find(|a| a.to_lowercase() != **a) {
                return Err(fail(format!(
                    "field '{}' alias '{alias}' is not lowercase",
                    field.name
                )));
            }
        }
        if self.key_fields.is_empty() {
            return Err(fail("no key fields".to_string()));
        }
        for key in self.key_fields {
            if !seen.contains(key) {
                return Err(fail(format!("key field '{key}' is not a field")));
            }
        }
        Ok(())
    }
}

/// The closed set of table schemas, named after export file stems.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum SchemaId {
    RealAcct,
    BuildingRes,
    ExtraFeatures,
}

impl SchemaId {
    #[must_use]
    pub fn schema(self) -> &'static TableSchema {
        match self {
            Self::RealAcct => &REAL_ACCT,
            Self::BuildingRes => &BUILDING_RES,
            Self::ExtraFeatures => &EXTRA_FEATURES,
        }
    }

    /// Schema for an export file stem, ignoring ASCII case.
    #[must_use]
    pub fn from_stem(stem: &str) -> Option<Self> {
        <Self as strum::IntoEnumIterator>::iter().find(|id| id.as_ref().eq_ignore_ascii_case(stem))
    }

    /// Schema for an export file. Code-description tables (`desc_*`) and
    /// unknown files have none.
    #[must_use]
    pub fn for_file(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        if stem.to_ascii_lowercase().starts_with("desc_") {
            return None;
        }
        Self::from_stem(stem)
    }
}

/// Checks every schema once at startup.
///
/// # Errors
///
/// Returns [`TransformError::Schema`] for the first inconsistent schema.
pub fn validate_registry() -> Result<(), TransformError> {
    for id in <SchemaId as strum::IntoEnumIterator>::iter() {
        let schema = id.schema();
        if schema.id != id {
            return Err(TransformError::Schema {
                schema: id.to_string(),
                message: format!("registered under {}", schema.id),
            });
        }
        schema.validate()?;
    }
    Ok(())
}

use FieldType::{Decimal, Int, Str};

static REAL_ACCT: TableSchema = TableSchema {
    id: SchemaId::RealAcct,
    fields: &[
        FieldSchema::new("account_number", &["acct", "account", "account_number"], Str)
            .max_len(20)
            .require(),
        FieldSchema::new("owner_name", &["mailto", "owner_name", "owner"], Str).max_len(255),
        FieldSchema::new("street_number", &["str_num", "site_addr_num"], Str).max_len(16),
        FieldSchema::new("street_name", &["str", "site_addr_street"], Str).max_len(128),
        FieldSchema::new("site_addr_1", &["site_addr_1", "site_addr"], Str).max_len(255),
        FieldSchema::new("city", &["site_addr_2", "situs_city", "city"], Str).max_len(100),
        FieldSchema::new("zipcode", &["site_addr_3", "zip", "zip_code"], Str).max_len(10),
        FieldSchema::new("value", &["tot_appr_val", "mkt_val"], Decimal),
        FieldSchema::new("assessed_value", &["assessed_val"], Decimal),
        FieldSchema::new("building_area", &["bld_ar", "bldg_ar"], Decimal),
        FieldSchema::new("land_area", &["land_ar"], Decimal),
    ],
    key_fields: &["account_number"],
};

static BUILDING_RES: TableSchema = TableSchema {
    id: SchemaId::BuildingRes,
    fields: &[
        FieldSchema::new("account_number", &["acct"], Str)
            .max_len(20)
            .require(),
        FieldSchema::new("building_number", &["bld_num"], Int),
        FieldSchema::new("building_type", &["imprv_type"], Str).max_len(10),
        FieldSchema::new("building_style", &["building_style_code"], Str).max_len(10),
        FieldSchema::new("building_class", &["bldg_class"], Str).max_len(10),
        FieldSchema::new("quality_code", &["qa_cd"], Str).max_len(10),
        FieldSchema::new("condition_code", &["cndtn_cd"], Str).max_len(10),
        FieldSchema::new("year_built", &["date_erected"], Int),
        FieldSchema::new("year_remodeled", &["yr_remodel"], Int),
        FieldSchema::new("effective_year", &["eff_yr"], Int),
        FieldSchema::new("heat_area", &["heat_ar"], Decimal),
        FieldSchema::new("base_area", &["base_ar"], Decimal),
        FieldSchema::new("gross_area", &["gross_ar"], Decimal),
        FieldSchema::new("stories", &["sty"], Decimal),
        FieldSchema::new("foundation_type", &["foundation"], Str).max_len(10),
        FieldSchema::new("exterior_wall", &["exterior_wall"], Str).max_len(10),
        FieldSchema::new("roof_cover", &["roof_cover"], Str).max_len(10),
        FieldSchema::new("roof_type", &["roof_typ"], Str).max_len(10),
        FieldSchema::new("bedrooms", &["bed_rm"], Int),
        FieldSchema::new("full_baths", &["full_bath"], Int),
        FieldSchema::new("half_baths", &["half_bath"], Int),
        FieldSchema::new("fireplaces", &["fireplace"], Int),
    ],
    key_fields: &["account_number", "building_number"],
};

static EXTRA_FEATURES: TableSchema = TableSchema {
    id: SchemaId::ExtraFeatures,
    fields: &[
        FieldSchema::new("account_number", &["acct"], Str)
            .max_len(20)
            .require(),
        FieldSchema::new("feature_number", &["bld_num"], Int),
        FieldSchema::new("feature_code", &["code", "cd"], Str).max_len(10),
        FieldSchema::new("feature_description", &["dscr"], Str).max_len(255),
        FieldSchema::new("quantity", &["units"], Decimal),
        FieldSchema::new("area", &["area"], Decimal),
        FieldSchema::new("length", &["length"], Decimal),
        FieldSchema::new("width", &["width"], Decimal),
        FieldSchema::new("quality_code", &["grade_cd", "grade"], Str).max_len(10),
        FieldSchema::new("condition_code", &["cond_cd"], Str).max_len(10),
        FieldSchema::new("year_built", &["yr_built"], Int),
        FieldSchema::new("value", &["value", "val"], Decimal),
    ],
    key_fields: &["account_number", "feature_number", "feature_code"],
};

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn registry_is_consistent() {
        validate_registry().unwrap();
    }

    #[test]
    fn maps_file_names_to_schemas() {
        assert_eq!(
            SchemaId::for_file(&PathBuf::from("x/real_acct.txt")),
            Some(SchemaId::RealAcct)
        );
        assert_eq!(
            SchemaId::for_file(&PathBuf::from("Building_Res.TXT")),
            Some(SchemaId::BuildingRes)
        );
        assert_eq!(SchemaId::for_file(&PathBuf::from("desc_real_acct.txt")), None);
        assert_eq!(SchemaId::for_file(&PathBuf::from("owners.txt")), None);
    }

    #[test]
    fn resolves_first_matching_alias() {
        let field = REAL_ACCT.field("owner_name").unwrap();
        let headers: Vec<String> = ["acct", "owner", "mailto"]
            .iter()
            .map(|h| (*h).to_string())
            .collect();
        assert_eq!(field.resolve(&headers), Some(2));

        let headers = vec!["acct".to_string()];
        assert_eq!(field.resolve(&headers), None);
    }

    #[test]
    fn detects_bad_schemas() {
        static BROKEN: TableSchema = TableSchema {
            id: SchemaId::RealAcct,
            fields: &[FieldSchema::new("a", &["a"], Str)],
            key_fields: &["b"],
        };
        assert!(BROKEN.validate().is_err());

        static UPPER: TableSchema = TableSchema {
            id: SchemaId::RealAcct,
            fields: &[FieldSchema::new("a", &["ACCT"], Str)],
            key_fields: &["a"],
        };
        assert!(UPPER.validate().is_err());
    }
}
