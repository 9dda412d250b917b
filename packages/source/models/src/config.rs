//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Values are layered: defaults, then an optional TOML file,
//! then `ETL_*` environment variables, then whatever the caller overrides
//! (typically CLI flags).

use std::path::{Path, PathBuf};

use chrono::Datelike;
use serde::{Deserialize, Serialize};

/// Batch size ceiling applied when low-memory mode is on.
pub const LOW_MEMORY_BATCH_SIZE: usize = 1000;

/// Errors raised while assembling an [`EtlConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("invalid config: {message}")]
    Invalid { message: String },
}

/// Text encodings the transform stage knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextEncoding {
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "iso-8859-1", alias = "latin1")]
    Latin1,
    #[serde(rename = "cp1252", alias = "windows-1252")]
    Windows1252,
}

/// What to do with a child row whose parent account does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Drop the row and count it as invalid.
    #[default]
    Reject,
    /// Write the row unlinked so a later orphan-linking pass can attach it.
    Keep,
}

/// Exponential backoff settings for downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Connect and read timeout per request.
    pub timeout_secs: u64,
    /// Buffer size used when writing and hashing archives.
    pub chunk_size: usize,
    pub max_parallel: usize,
    pub verify_tls: bool,
    /// Bytes per second, per download.
    pub bandwidth_limit: Option<u64>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            chunk_size: 8192,
            max_parallel: 3,
            verify_tls: true,
            bandwidth_limit: None,
            user_agent: concat!("taxroll/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub validate_archives: bool,
    pub overwrite_existing: bool,
    /// Members larger than this many bytes are skipped.
    pub max_file_size: Option<u64>,
    /// Lowercase extensions without the leading dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            validate_archives: true,
            overwrite_existing: true,
            max_file_size: None,
            allowed_extensions: ["txt", "csv", "shp", "dbf", "shx", "prj", "pdf"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Tried in order; the first that decodes the sample wins.
    pub encodings: Vec<TextEncoding>,
    pub skip_invalid_records: bool,
    pub max_errors_before_abort: u64,
    pub normalize_whitespace: bool,
    pub strip_fields: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            encodings: vec![
                TextEncoding::Utf8,
                TextEncoding::Latin1,
                TextEncoding::Windows1252,
            ],
            skip_invalid_records: true,
            max_errors_before_abort: 1000,
            normalize_whitespace: true,
            strip_fields: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub batch_size: usize,
    pub truncate_before_load: bool,
    pub checkpoint_interval: u64,
    pub max_retries_per_batch: u32,
    pub low_memory: bool,
    pub orphan_policy: OrphanPolicy,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            truncate_before_load: true,
            checkpoint_interval: 10_000,
            max_retries_per_batch: 2,
            low_memory: false,
            orphan_policy: OrphanPolicy::Reject,
        }
    }
}

impl LoadConfig {
    /// Batch size after the low-memory cap.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        if self.low_memory {
            self.batch_size.min(LOW_MEMORY_BATCH_SIZE)
        } else {
            self.batch_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GisConfig {
    /// Substring identifying the preferred shapefile inside the archive.
    pub preferred_shapefile: String,
    /// DBF columns tried in order for the parcel's account number.
    pub key_fields: Vec<String>,
    /// Fraction of properties expected to receive coordinates. Zero disables
    /// the check.
    pub min_coverage: f64,
}

impl Default for GisConfig {
    fn default() -> Self {
        Self {
            preferred_shapefile: "ParcelsCity".to_string(),
            key_fields: ["HCAD_NUM", "ACCOUNT", "ACCT"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            min_coverage: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub remove_downloads: bool,
    pub remove_extracts: bool,
}

impl CleanupConfig {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        self.remove_downloads || self.remove_extracts
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub download_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub database_path: PathBuf,
    /// Tax year substituted into URL templates.
    pub data_year: i32,
    /// Transform and count without writing to the store.
    pub dry_run: bool,
    pub skip_download: bool,
    pub skip_extract: bool,
    pub skip_transform: bool,
    pub skip_load: bool,
    pub continue_on_error: bool,
    /// Run optional sources as well as required ones.
    pub include_optional: bool,
    /// Case-insensitive source names. Empty means no filter.
    pub source_filter: Vec<String>,
    /// Auxiliary file holding per-building room counts.
    pub fixtures_file: String,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub extract: ExtractConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
    pub gis: GisConfig,
    pub cleanup: CleanupConfig,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("data/downloads"),
            extract_dir: PathBuf::from("data/extracted"),
            database_path: PathBuf::from("data/taxroll.duckdb"),
            data_year: chrono::Utc::now().year(),
            dry_run: false,
            skip_download: false,
            skip_extract: false,
            skip_transform: false,
            skip_load: false,
            continue_on_error: true,
            include_optional: false,
            source_filter: Vec::new(),
            fixtures_file: "fixtures.txt".to_string(),
            retry: RetryConfig::default(),
            download: DownloadConfig::default(),
            extract: ExtractConfig::default(),
            transform: TransformConfig::default(),
            load: LoadConfig::default(),
            gis: GisConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl EtlConfig {
    /// Parses a TOML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] if the document is malformed.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::de::from_str(toml_str).map_err(|source| ConfigError::Toml {
            path: "<inline>".to_string(),
            source,
        })
    }

    /// Reads a TOML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::de::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })
    }

    /// Applies `ETL_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a variable is set to a value
    /// that does not parse.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies `ETL_*` overrides using `lookup` to read variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a variable is set to a value
    /// that does not parse.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ETL_DATA_YEAR") {
            self.data_year = parse_env("ETL_DATA_YEAR", &v)?;
        }
        if let Some(v) = lookup("ETL_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_EXTRACT_DIR") {
            self.extract_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_DRY_RUN") {
            self.dry_run = parse_env_bool("ETL_DRY_RUN", &v)?;
        }
        if let Some(v) = lookup("ETL_BATCH_SIZE") {
            self.load.batch_size = parse_env("ETL_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("ETL_LOW_MEMORY") {
            self.load.low_memory = parse_env_bool("ETL_LOW_MEMORY", &v)?;
        }
        if let Some(v) = lookup("ETL_SOURCES") {
            self.source_filter = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Checks values that would make the pipeline misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.load.batch_size == 0 {
            return invalid("load.batch_size must be positive");
        }
        if self.download.max_parallel == 0 {
            return invalid("download.max_parallel must be positive");
        }
        if self.download.chunk_size == 0 {
            return invalid("download.chunk_size must be positive");
        }
        if self.retry.exponential_base < 1.0 {
            return invalid("retry.exponential_base must be at least 1.0");
        }
        if self.transform.encodings.is_empty() {
            return invalid("transform.encodings must not be empty");
        }
        if !(0.0..=1.0).contains(&self.gis.min_coverage) {
            return invalid("gis.min_coverage must be between 0 and 1");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_env_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
