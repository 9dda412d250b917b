#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Load, stage, and pipeline result types.
//!
//! Everything here is plain data that serializes to JSON, so a run's
//! [`PipelineResult`] can be printed by the CLI or handed to a scheduler
//! as a task payload.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter};
use taxroll_database_models::TableId;

/// Maximum number of error messages kept on a [`LoadResult`] or
/// [`StageResult`].
pub const MAX_STORED_ERRORS: usize = 100;

/// Pipeline stages, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStage {
    Download,
    Extract,
    /// Transform and load, combined per file.
    TransformLoad,
    /// Parcel centroids from the GIS shapefile.
    Gis,
    Cleanup,
}

/// Overall state of a run. Every run starts `Running` and ends in one of
/// the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Running,
    Completed,
    /// Only optional sources failed.
    Partial,
    Failed,
}

impl PipelineStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Process exit code for a finished run.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::Partial => 2,
            Self::Running | Self::Failed => 1,
        }
    }
}

/// How a table is prepared before loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Empty the table first. Resets the id sequence.
    #[default]
    Truncate,
    /// Keep existing rows and skip or update duplicates by natural key.
    Append,
}

/// Counters for loading one file into one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub table: TableId,
    /// New rows written.
    pub loaded: u64,
    /// Existing rows re-stamped with this batch.
    pub updated: u64,
    /// Rows in batches that could not be written.
    pub failed: u64,
    /// Rows rejected before writing, e.g. for a missing parent.
    pub invalid: u64,
    /// Duplicates and rows without a natural key.
    pub skipped: u64,
    /// Older rows marked superseded after this load.
    pub superseded: u64,
    pub batch_id: String,
    pub duration: Duration,
    /// At most [`MAX_STORED_ERRORS`].
    pub errors: Vec<String>,
}

impl LoadResult {
    #[must_use]
    pub fn new(table: TableId, batch_id: impl Into<String>) -> Self {
        Self {
            table,
            loaded: 0,
            updated: 0,
            failed: 0,
            invalid: 0,
            skipped: 0,
            superseded: 0,
            batch_id: batch_id.into(),
            duration: Duration::ZERO,
            errors: Vec::new(),
        }
    }

    /// Records an error message, dropping it once the list is full.
    pub fn push_error(&mut self, message: impl Into<String>) {
        if self.errors.len() < MAX_STORED_ERRORS {
            self.errors.push(message.into());
        }
    }

    /// Every record that reached the load manager.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.loaded + self.updated + self.failed + self.invalid + self.skipped
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Resume marker for a long-running table load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub import_id: String,
    pub table: TableId,
    pub records_processed: u64,
    /// Natural key of the last record written, as `account[/number[/code]]`.
    pub last_key: Option<String>,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: PipelineStage,
    pub success: bool,
    /// The stage was disabled or made unnecessary by an earlier failure.
    pub skipped: bool,
    /// First fatal error, if the stage failed.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub metrics: BTreeMap<String, u64>,
    /// At most [`MAX_STORED_ERRORS`].
    pub errors: Vec<String>,
}

impl StageResult {
    #[must_use]
    pub fn start(stage: PipelineStage) -> Self {
        Self {
            stage,
            success: true,
            skipped: false,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration: Duration::ZERO,
            metrics: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// A stage that never ran.
    #[must_use]
    pub fn skipped(stage: PipelineStage, reason: impl Into<String>) -> Self {
        let mut result = Self::start(stage);
        result.skipped = true;
        result.push_error(reason);
        result.completed_at = Some(result.started_at);
        result
    }

    /// Adds `value` to the named counter.
    pub fn add_metric(&mut self, name: &str, value: u64) {
        *self.metrics.entry(name.to_string()).or_insert(0) += value;
    }

    #[must_use]
    pub fn metric(&self, name: &str) -> u64 {
        self.metrics.get(name).copied().unwrap_or(0)
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        if self.errors.len() < MAX_STORED_ERRORS {
            self.errors.push(message.into());
        }
    }

    /// Marks the stage failed. The first error is kept as the stage error.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.success = false;
        if self.error.is_none() {
            self.error = Some(message.clone());
        }
        self.push_error(message);
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration = (now - self.started_at).to_std().unwrap_or_default();
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Batch id stamped on every row this run wrote.
    pub batch_id: String,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub stages: Vec<StageResult>,
    /// Stage errors prefixed with the stage name, at most
    /// [`MAX_STORED_ERRORS`].
    pub errors: Vec<String>,
}

impl PipelineResult {
    #[must_use]
    pub fn start(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration: Duration::ZERO,
            stages: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn stage(&self, stage: PipelineStage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Sum of the named counter across stages.
    #[must_use]
    pub fn metric(&self, name: &str) -> u64 {
        self.stages.iter().map(|s| s.metric(name)).sum()
    }

    pub fn push_stage(&mut self, stage: StageResult) {
        for error in &stage.errors {
            if self.errors.len() >= MAX_STORED_ERRORS {
                break;
            }
            if !stage.skipped {
                self.errors.push(format!("{}: {error}", stage.stage));
            }
        }
        self.stages.push(stage);
    }

    pub fn finish(&mut self, status: PipelineStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration = (now - self.started_at).to_std().unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_result_bounds_errors() {
        let mut result = LoadResult::new(TableId::Properties, "b");
        for i in 0..250 {
            result.push_error(format!("error {i}"));
        }
        assert_eq!(result.errors.len(), MAX_STORED_ERRORS);
        assert_eq!(result.errors[0], "error 0");
    }

    #[test]
    fn stage_keeps_first_error() {
        let mut stage = StageResult::start(PipelineStage::Download);
        stage.fail("first");
        stage.fail("second");
        stage.finish();
        assert!(!stage.success);
        assert_eq!(stage.error.as_deref(), Some("first"));
        assert_eq!(stage.errors.len(), 2);
        assert!(stage.completed_at.is_some());
    }

    #[test]
    fn metrics_accumulate_across_stages() {
        let mut download = StageResult::start(PipelineStage::Download);
        download.add_metric("bytes", 10);
        download.add_metric("bytes", 5);
        let mut load = StageResult::start(PipelineStage::TransformLoad);
        load.add_metric("records_loaded", 3);

        let mut result = PipelineResult::start("b");
        result.push_stage(download);
        result.push_stage(load);
        assert_eq!(result.metric("bytes"), 15);
        assert_eq!(result.metric("records_loaded"), 3);
        assert_eq!(result.metric("missing"), 0);
    }

    #[test]
    fn status_serializes_screaming() {
        let mut result = PipelineResult::start("20240101_000000_deadbeef");
        result.finish(PipelineStatus::Partial);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "PARTIAL");
        assert_eq!(PipelineStatus::Partial.exit_code(), 2);
        assert_eq!(PipelineStage::TransformLoad.to_string(), "transform_load");
    }

    #[test]
    fn skipped_stage_errors_stay_out_of_run_errors() {
        let mut result = PipelineResult::start("b");
        result.push_stage(StageResult::skipped(PipelineStage::Cleanup, "disabled"));
        assert!(result.errors.is_empty());
        assert!(result.stage(PipelineStage::Cleanup).unwrap().skipped);
    }
}
