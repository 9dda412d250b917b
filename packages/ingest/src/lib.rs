#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Property-tax roll ETL pipeline.
//!
//! [`pipeline::Orchestrator`] drives the stages in order: download the
//! source archives, extract them, stream every export file through the
//! transform engine straight into the [`load::LoadManager`], attach parcel
//! coordinates from the GIS layer, and optionally clean up. Each stage
//! reports a [`StageResult`]; the run as a whole ends `COMPLETED`,
//! `PARTIAL`, or `FAILED`.
//!
//! [`StageResult`]: taxroll_ingest_models::StageResult

pub mod load;
pub mod pipeline;
pub mod rows;

pub use load::{LoadManager, LoadOptions, ParentIndex, generate_batch_id};
pub use pipeline::Orchestrator;

/// Errors that prevent the pipeline from starting.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] taxroll_source_models::config::ConfigError),

    #[error(transparent)]
    Source(#[from] taxroll_source::SourceError),

    #[error("invalid source: {0}")]
    InvalidSource(#[from] taxroll_source_models::InvalidSource),

    #[error(transparent)]
    Transform(#[from] taxroll_transform::TransformError),

    #[error(transparent)]
    Database(#[from] taxroll_database::DbError),
}
