#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Data source descriptors.
//!
//! A [`DataSource`] describes one remote archive published by the appraisal
//! district: where to fetch it, what it is called on disk, how it is packed,
//! and which members of it matter. Descriptors are built once at startup from
//! the embedded registry and are never mutated afterwards.

pub mod config;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Placeholder substituted with the tax year in URL templates.
pub const YEAR_PLACEHOLDER: &str = "{year}";

/// What kind of data a source carries.
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
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceType {
    /// Appraisal roll tables (accounts, buildings, features).
    PropertyData,
    /// Parcel shapefiles.
    GisData,
    /// Lookup tables for the codes used in the appraisal roll.
    CodeDescriptions,
    /// Appraisal review board hearing exports.
    HearingData,
}

/// Container format of a downloaded archive.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Infers the format from a file name, if its extension is recognized.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Reasons a [`DataSource`] definition is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSource {
    #[error("source name must not be empty")]
    EmptyName,
    #[error("source '{name}' has an empty URL template")]
    EmptyUrlTemplate { name: String },
    #[error("source '{name}' has an empty filename")]
    EmptyFilename { name: String },
}

const fn default_required() -> bool {
    true
}

const fn default_priority() -> u32 {
    100
}

/// One downloadable archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Human-readable unique name (e.g., "Real Account Owner").
    pub name: String,
    /// Download URL; may contain [`YEAR_PLACEHOLDER`].
    pub url_template: String,
    /// File name the archive is saved under.
    pub filename: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub archive_format: ArchiveFormat,
    /// Whether a failure of this source fails the run rather than degrading it.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Expected hex-encoded SHA-256 of the archive.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Glob patterns matched against member base names. Empty means all.
    #[serde(default)]
    pub extract_patterns: Vec<String>,
    /// Lower values are processed first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl DataSource {
    /// Returns the download URL for the given tax year.
    #[must_use]
    pub fn url_for_year(&self, year: i32) -> String {
        self.url_template
            .replace(YEAR_PLACEHOLDER, &year.to_string())
    }

    /// Whether the URL template is year-dependent.
    #[must_use]
    pub fn url_has_year(&self) -> bool {
        self.url_template.contains(YEAR_PLACEHOLDER)
    }

    #[must_use]
    pub fn is_gis(&self) -> bool {
        self.source_type == SourceType::GisData
    }

    /// Checks the structural invariants of the descriptor.
    ///
    /// A non-GIS template without a year placeholder is suspicious but
    /// legal, so it only produces a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the name, URL template, or filename is blank.
    pub fn validate(&self) -> Result<(), InvalidSource> {
        if self.name.trim().is_empty() {
            return Err(InvalidSource::EmptyName);
        }
        if self.url_template.trim().is_empty() {
            return Err(InvalidSource::EmptyUrlTemplate {
                name: self.name.clone(),
            });
        }
        if self.filename.trim().is_empty() {
            return Err(InvalidSource::EmptyFilename {
                name: self.name.clone(),
            });
        }
        if !self.url_has_year() && !self.is_gis() {
            log::warn!(
                "Source '{}' URL has no {YEAR_PLACEHOLDER} placeholder: {}",
                self.name,
                self.url_template
            );
        }
        Ok(())
    }

    /// Directory name the archive extracts into: the filename with its
    /// archive extension removed.
    #[must_use]
    pub fn extract_stem(&self) -> &str {
        archive_stem(&self.filename)
    }
}

/// Strips a recognized archive extension from a file name.
#[must_use]
pub fn archive_stem(filename: &str) -> &str {
    let lower = filename.to_ascii_lowercase();
    for ext in [".tar.gz", ".tgz", ".zip", ".tar", ".gz"] {
        if lower.ends_with(ext) {
            return &filename[..filename.len() - ext.len()];
        }
    }
    filename
}
