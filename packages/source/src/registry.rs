//! Source registry. Loads the appraisal-district catalog from embedded TOML.
//!
//! Each `.toml` file in `packages/source/sources/` is baked into the binary
//! at compile time via [`include_str!`]. Adding a new archive is a matter of
//! creating a new TOML file and listing it below.

use taxroll_source_models::DataSource;
use taxroll_source_models::config::EtlConfig;

use crate::SourceError;

/// TOML configs embedded at compile time.
const SOURCE_TOMLS: &[(&str, &str)] = &[
    // ── Appraisal roll (CAMA) ────────────────────────────────────────
    (
        "code_description_real",
        include_str!("../sources/code_description_real.toml"),
    ),
    (
        "code_description_pp",
        include_str!("../sources/code_description_pp.toml"),
    ),
    (
        "real_acct_owner",
        include_str!("../sources/real_acct_owner.toml"),
    ),
    (
        "real_building_land",
        include_str!("../sources/real_building_land.toml"),
    ),
    (
        "real_jur_exempt",
        include_str!("../sources/real_jur_exempt.toml"),
    ),
    ("pp_files", include_str!("../sources/pp_files.toml")),
    (
        "real_acct_ownership_history",
        include_str!("../sources/real_acct_ownership_history.toml"),
    ),
    ("hearing_files", include_str!("../sources/hearing_files.toml")),
    // ── GIS ──────────────────────────────────────────────────────────
    ("gis_parcels", include_str!("../sources/gis_parcels.toml")),
];

#[cfg(test)]
const EXPECTED_SOURCE_COUNT: usize = 9;

/// Parses a single source definition and checks its invariants.
///
/// # Errors
///
/// Returns [`SourceError::Registry`] if the TOML is malformed or the
/// definition fails validation.
pub fn parse_source_toml(key: &str, toml_str: &str) -> Result<DataSource, SourceError> {
    let source: DataSource = toml::de::from_str(toml_str).map_err(|e| SourceError::Registry {
        message: format!("{key}.toml: {e}"),
    })?;
    source.validate().map_err(|e| SourceError::Registry {
        message: format!("{key}.toml: {e}"),
    })?;
    Ok(source)
}

/// Returns every configured source, sorted by ascending priority.
///
/// # Errors
///
/// Returns [`SourceError::Registry`] if any embedded definition is invalid.
pub fn all_sources() -> Result<Vec<DataSource>, SourceError> {
    let mut sources = SOURCE_TOMLS
        .iter()
        .map(|(key, toml)| parse_source_toml(key, toml))
        .collect::<Result<Vec<_>, _>>()?;
    sources.sort_by_key(|s| s.priority);
    Ok(sources)
}

/// Returns only the sources whose failure fails the run.
///
/// # Errors
///
/// Returns [`SourceError::Registry`] if any embedded definition is invalid.
pub fn required_sources() -> Result<Vec<DataSource>, SourceError> {
    Ok(all_sources()?.into_iter().filter(|s| s.required).collect())
}

/// Looks a source up by name, ignoring ASCII case.
#[must_use]
pub fn source_by_name<'a>(sources: &'a [DataSource], name: &str) -> Option<&'a DataSource> {
    sources.iter().find(|s| s.name.eq_ignore_ascii_case(name))
}

/// Applies the run configuration to the catalog.
///
/// An explicit name filter wins over the required/optional split, so
/// naming an optional source selects it. Unknown names are an error.
///
/// # Errors
///
/// Returns [`SourceError::Registry`] if a filtered name matches no source.
pub fn select_sources(
    sources: &[DataSource],
    config: &EtlConfig,
) -> Result<Vec<DataSource>, SourceError> {
    if !config.source_filter.is_empty() {
        return config
            .source_filter
            .iter()
            .map(|name| {
                source_by_name(sources, name)
                    .cloned()
                    .ok_or_else(|| SourceError::Registry {
                        message: format!("unknown source '{name}'"),
                    })
            })
            .collect();
    }

    Ok(sources
        .iter()
        .filter(|s| s.required || config.include_optional)
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_all_sources() {
        let sources = all_sources().unwrap();
        assert_eq!(sources.len(), EXPECTED_SOURCE_COUNT);
    }

    #[test]
    fn source_names_are_unique() {
        let sources = all_sources().unwrap();
        let mut names: Vec<String> = sources.iter().map(|s| s.name.to_lowercase()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EXPECTED_SOURCE_COUNT);
    }

    #[test]
    fn all_sources_have_required_fields() {
        for source in &all_sources().unwrap() {
            assert!(!source.name.is_empty(), "source name is empty");
            assert!(!source.filename.is_empty(), "{}: no filename", source.name);
            assert!(
                source.url_template.starts_with("https://"),
                "{}: URL is not https",
                source.name
            );
            assert!(
                source.url_has_year() || source.is_gis(),
                "{}: URL has no year placeholder",
                source.name
            );
        }
    }

    #[test]
    fn sorted_by_priority() {
        let sources = all_sources().unwrap();
        assert!(sources.windows(2).all(|w| w[0].priority <= w[1].priority));
        assert_eq!(sources[0].name, "Code Description Real");
    }

    #[test]
    fn required_set_matches_catalog() {
        let names: Vec<String> = required_sources()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(
            names,
            [
                "Code Description Real",
                "Real Account Owner",
                "Real Building Land",
                "GIS Parcels",
            ]
        );
    }

    #[test]
    fn finds_by_name_case_insensitively() {
        let sources = all_sources().unwrap();
        let found = source_by_name(&sources, "real building LAND").unwrap();
        assert_eq!(found.filename, "Real_building_land.zip");
        assert!(source_by_name(&sources, "nope").is_none());
    }

    #[test]
    fn filter_selects_optional_sources_and_rejects_unknown() {
        let sources = all_sources().unwrap();
        let mut config = EtlConfig {
            source_filter: vec!["hearing files".to_string()],
            ..EtlConfig::default()
        };
        let selected = select_sources(&sources, &config).unwrap();
        assert_eq!(selected.len(), 1);
        assert!(!selected[0].required);

        config.source_filter = vec!["Nonexistent".to_string()];
        assert!(select_sources(&sources, &config).is_err());
    }

    #[test]
    fn include_optional_selects_everything() {
        let sources = all_sources().unwrap();
        let config = EtlConfig {
            include_optional: true,
            ..EtlConfig::default()
        };
        assert_eq!(
            select_sources(&sources, &config).unwrap().len(),
            EXPECTED_SOURCE_COUNT
        );
    }
}
