//! Pipeline orchestration.
//!
//! Stages run in a fixed order and each produces a [`StageResult`]. A
//! stage fails only when a required source fails; failures confined to
//! optional sources are recorded as stage errors and make the run
//! `PARTIAL`. With `continue_on_error` off, the first failed stage ends
//! the run as `FAILED` and the remaining stages are reported as skipped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use taxroll_archive::{ExtractManager, ExtractResult};
use taxroll_database::{DbError, Store};
use taxroll_database_models::{TableCounts, TableId};
use taxroll_ingest_models::{LoadMode, PipelineResult, PipelineStage, PipelineStatus, StageResult};
use taxroll_source::download::{DownloadManager, DownloadResult};
use taxroll_source::progress::{ProgressCallback, null_progress};
use taxroll_source::registry;
use taxroll_source_models::DataSource;
use taxroll_source_models::config::EtlConfig;
use taxroll_transform::fixtures::FixturesAggregator;
use taxroll_transform::{RowOutcome, SchemaId, Transformer};

use crate::IngestError;
use crate::load::{LoadManager, LoadOptions, generate_batch_id};
use crate::rows::table_for_schema;

/// Observer notified when a stage finishes.
pub type StageCallback = Box<dyn Fn(&StageResult) + Send + Sync>;

/// Observer notified when a run finishes.
pub type CompletionCallback = Box<dyn Fn(&PipelineResult) + Send + Sync>;

/// One export file queued for transform and load.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DataFile {
    schema: SchemaId,
    path: PathBuf,
    source: String,
    required: bool,
}

/// Identity of the run in progress.
struct RunContext {
    batch_id: String,
    started_at: DateTime<Utc>,
}

/// Records a source-level failure: required sources fail the stage,
/// optional ones only degrade it.
fn source_failure(stage: &mut StageResult, required: bool, message: String) {
    if required {
        log::error!("{message}");
        stage.fail(message);
    } else {
        log::warn!("{message} (optional source)");
        stage.push_error(message);
    }
}

/// Drives one pipeline run over a set of sources.
pub struct Orchestrator<S> {
    config: EtlConfig,
    sources: Vec<DataSource>,
    downloads: DownloadManager,
    extracts: ExtractManager,
    transformer: Transformer,
    loader: LoadManager<S>,
    fixtures: FixturesAggregator,
    progress: Arc<dyn ProgressCallback>,
    record_progress: Arc<dyn ProgressCallback>,
    status: Option<PipelineStatus>,
    current_stage: Option<PipelineStage>,
    stage_callbacks: Vec<(PipelineStage, StageCallback)>,
    completion_callbacks: Vec<CompletionCallback>,
}

impl<S: Store> Orchestrator<S> {
    /// Builds an orchestrator over the catalog sources selected by
    /// `config`.
    ///
    /// # Errors
    ///
    /// * If the configuration, the source catalog, or the schema registry
    ///   is invalid
    pub fn new(config: EtlConfig, store: S) -> Result<Self, IngestError> {
        let catalog = registry::all_sources()?;
        let sources = registry::select_sources(&catalog, &config)?;
        Self::with_sources(config, store, sources)
    }

    /// Builds an orchestrator over an explicit source list. Sources are
    /// processed in priority order.
    ///
    /// # Errors
    ///
    /// * If the configuration, a source, or the schema registry is invalid
    pub fn with_sources(
        config: EtlConfig,
        store: S,
        mut sources: Vec<DataSource>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        taxroll_transform::validate_registry()?;
        for source in &sources {
            source.validate()?;
        }
        sources.sort_by_key(|s| s.priority);

        Ok(Self {
            downloads: DownloadManager::new(&config)?,
            extracts: ExtractManager::new(&config),
            transformer: Transformer::new(&config.transform),
            loader: LoadManager::new(store, &config.load),
            fixtures: FixturesAggregator::new(),
            progress: null_progress(),
            record_progress: null_progress(),
            status: None,
            current_stage: None,
            stage_callbacks: Vec::new(),
            completion_callbacks: Vec::new(),
            sources,
            config,
        })
    }

    /// Reports download progress to `progress`, one unit per source.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Reports each record read during transform and load to `progress`,
    /// with the export file being read as the message.
    #[must_use]
    pub fn with_record_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.record_progress = progress;
        self
    }

    pub fn on_stage(&mut self, stage: PipelineStage, callback: StageCallback) {
        self.stage_callbacks.push((stage, callback));
    }

    pub fn on_complete(&mut self, callback: CompletionCallback) {
        self.completion_callbacks.push(callback);
    }

    #[must_use]
    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    #[must_use]
    pub const fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Status of the current or last run; `None` before the first run.
    #[must_use]
    pub const fn status(&self) -> Option<PipelineStatus> {
        self.status
    }

    /// Stage being executed, while a run is in progress.
    #[must_use]
    pub const fn current_stage(&self) -> Option<PipelineStage> {
        self.current_stage
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        self.loader.store()
    }

    #[must_use]
    pub const fn loader(&self) -> &LoadManager<S> {
        &self.loader
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.loader.into_store()
    }

    /// Downloads every source without running any other stage.
    pub async fn execute_download_only(&self) -> Vec<DownloadResult> {
        self.downloads
            .download_batch(
                &self.sources,
                self.config.download.max_parallel,
                Arc::clone(&self.progress),
            )
            .await
    }

    /// Extracts every already-downloaded source.
    #[must_use]
    pub fn execute_extract_only(&self) -> Vec<ExtractResult> {
        self.extracts.extract_batch(&self.sources)
    }

    /// Links orphaned child rows in both child tables.
    ///
    /// # Errors
    ///
    /// * If the store update fails
    pub fn link_orphans(&mut self) -> Result<u64, DbError> {
        let mut linked = 0;
        for table in TableId::children() {
            linked += self.loader.link_orphans(table)?;
        }
        Ok(linked)
    }

    /// Deletes superseded rows from both child tables.
    ///
    /// # Errors
    ///
    /// * If a delete fails; tables already purged stay purged
    pub fn purge_superseded(&mut self) -> Result<u64, DbError> {
        let mut deleted = 0;
        for table in TableId::children() {
            deleted += self.loader.delete_inactive(table)?;
        }
        Ok(deleted)
    }

    /// # Errors
    ///
    /// * If the store cannot count
    pub fn record_counts(&self) -> Result<Vec<TableCounts>, DbError> {
        self.loader.record_counts()
    }

    /// Runs every stage and returns the run's result.
    pub async fn execute(&mut self) -> PipelineResult {
        let mut run = PipelineResult::start(generate_batch_id());
        let ctx = RunContext {
            batch_id: run.batch_id.clone(),
            started_at: run.started_at,
        };
        self.status = Some(PipelineStatus::Running);
        log::info!(
            "Starting ETL pipeline for {} source(s) (year={}, batch={})",
            self.sources.len(),
            self.config.data_year,
            ctx.batch_id
        );

        let mut aborted = false;
        for stage in [
            PipelineStage::Download,
            PipelineStage::Extract,
            PipelineStage::TransformLoad,
            PipelineStage::Gis,
            PipelineStage::Cleanup,
        ] {
            if aborted {
                run.push_stage(StageResult::skipped(stage, "skipped after earlier failure"));
                continue;
            }
            if let Some(reason) = self.skip_reason(stage) {
                log::info!("Skipping {stage} stage: {reason}");
                run.push_stage(StageResult::skipped(stage, reason));
                continue;
            }

            self.current_stage = Some(stage);
            log::info!("Starting {stage} stage");
            let mut result = match stage {
                PipelineStage::Download => self.run_download().await,
                PipelineStage::Extract => self.run_extract(),
                PipelineStage::TransformLoad => self.run_transform_load(&ctx),
                PipelineStage::Gis => self.run_gis(),
                PipelineStage::Cleanup => self.run_cleanup(),
            };
            result.finish();
            log::info!(
                "{stage} stage {} in {:.1}s: {:?}",
                if result.success { "finished" } else { "failed" },
                result.duration.as_secs_f64(),
                result.metrics
            );

            for (wanted, callback) in &self.stage_callbacks {
                if *wanted == stage {
                    callback(&result);
                }
            }
            if !result.success && !self.config.continue_on_error {
                log::error!("{stage} stage failed and continue_on_error is off; aborting");
                aborted = true;
            }
            run.push_stage(result);
        }
        self.current_stage = None;

        let status = if aborted {
            PipelineStatus::Failed
        } else if run
            .stages
            .iter()
            .all(|s| s.skipped || (s.success && s.errors.is_empty()))
        {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Partial
        };
        run.finish(status);
        self.status = Some(status);

        for callback in &self.completion_callbacks {
            callback(&run);
        }
        log::info!(
            "Pipeline {status}: {:.1}s total, {} error(s)",
            run.duration.as_secs_f64(),
            run.errors.len()
        );
        run
    }

    fn writes_store(&self) -> bool {
        !(self.config.dry_run || self.config.skip_load)
    }

    fn skip_reason(&self, stage: PipelineStage) -> Option<&'static str> {
        match stage {
            PipelineStage::Download if self.config.skip_download => Some("skip_download is set"),
            PipelineStage::Extract if self.config.skip_extract => Some("skip_extract is set"),
            PipelineStage::TransformLoad if self.config.skip_transform => {
                Some("skip_transform is set")
            }
            PipelineStage::Gis if self.config.skip_transform => Some("skip_transform is set"),
            PipelineStage::Gis if !self.writes_store() => Some("store writes are disabled"),
            PipelineStage::Gis if !self.sources.iter().any(DataSource::is_gis) => {
                Some("no GIS sources selected")
            }
            PipelineStage::Cleanup if !self.config.cleanup.is_enabled() => {
                Some("cleanup is disabled")
            }
            _ => None,
        }
    }

    async fn run_download(&self) -> StageResult {
        let mut stage = StageResult::start(PipelineStage::Download);
        let results = self.execute_download_only().await;

        stage.add_metric("sources", results.len() as u64);
        for result in &results {
            if result.success {
                stage.add_metric("succeeded", 1);
                stage.add_metric("bytes", result.bytes);
            } else {
                stage.add_metric("failed", 1);
                let error = result.error.as_deref().unwrap_or("unknown error");
                source_failure(
                    &mut stage,
                    result.required,
                    format!("{}: download failed: {error}", result.source),
                );
            }
        }
        stage
    }

    fn run_extract(&self) -> StageResult {
        let mut stage = StageResult::start(PipelineStage::Extract);
        let results = self.execute_extract_only();

        stage.add_metric("archives", results.len() as u64);
        for result in &results {
            if result.success {
                stage.add_metric("files", result.files_extracted.len() as u64);
                stage.add_metric("files_skipped", result.files_skipped as u64);
                stage.add_metric("bytes", result.bytes_extracted);
            } else {
                let error = result.error.as_deref().unwrap_or("unknown error");
                source_failure(
                    &mut stage,
                    result.required,
                    format!("{}: extraction failed: {error}", result.source),
                );
            }
        }
        stage
    }

    /// Reloads the fixtures lookup from the first extracted file named
    /// like `fixtures_file`.
    fn preload_fixtures(&mut self) {
        let wanted = self.config.fixtures_file.to_ascii_lowercase();
        let found = self
            .sources
            .iter()
            .filter(|s| !s.is_gis())
            .filter_map(|s| self.extracts.list_extracted_files(s).ok())
            .flatten()
            .find(|path| {
                path.file_name()
                    .is_some_and(|n| n.to_string_lossy().to_ascii_lowercase() == wanted)
            });

        self.fixtures.clear();
        let Some(path) = found else {
            log::warn!(
                "Fixtures file {} not found; room counts come from building rows",
                self.config.fixtures_file
            );
            return;
        };
        self.fixtures.load_fixtures_file(&path);
        let stats = self.fixtures.stats();
        log::info!(
            "Fixtures loaded: {} buildings, {} with bedrooms, {} with bathrooms",
            stats.total_buildings,
            stats.with_bedrooms,
            stats.with_bathrooms
        );
    }

    /// Export files of every non-GIS source, in schema order so parents
    /// load before their children.
    fn data_files(&self, stage: &mut StageResult) -> Vec<DataFile> {
        let mut files = Vec::new();
        for source in self.sources.iter().filter(|s| !s.is_gis()) {
            let dir = self.extracts.extract_path(source);
            if !dir.is_dir() {
                source_failure(
                    stage,
                    source.required,
                    format!("{}: extract directory {} not found", source.name, dir.display()),
                );
                continue;
            }
            match self.extracts.list_extracted_files(source) {
                Ok(paths) => {
                    for path in paths {
                        if !is_text_file(&path) {
                            continue;
                        }
                        match SchemaId::for_file(&path) {
                            Some(schema) => files.push(DataFile {
                                schema,
                                path,
                                source: source.name.clone(),
                                required: source.required,
                            }),
                            None => log::debug!("No schema for {}, skipping", path.display()),
                        }
                    }
                }
                Err(e) => source_failure(stage, source.required, format!("{}: {e}", source.name)),
            }
        }
        files.sort();
        files
    }

    fn run_transform_load(&mut self, ctx: &RunContext) -> StageResult {
        let mut stage = StageResult::start(PipelineStage::TransformLoad);
        self.preload_fixtures();
        self.loader.reset_parents();

        let files = self.data_files(&mut stage);
        stage.add_metric("files", files.len() as u64);
        let mut truncated: HashSet<TableId> = HashSet::new();

        for file in &files {
            self.process_file(file, ctx, &mut truncated, &mut stage);
        }

        if self.writes_store() {
            for table in TableId::children() {
                match self.loader.link_orphans(table) {
                    Ok(linked) => stage.add_metric("orphans_linked", linked),
                    Err(e) => stage.push_error(format!("linking {table} orphans: {e}")),
                }
            }
        }
        let elapsed = (Utc::now() - stage.started_at).to_std().unwrap_or_default();
        add_rate_metrics(&mut stage, elapsed);
        self.record_progress.finish(format!(
            "{} records from {} file(s)",
            stage.metric("records_processed"),
            files.len()
        ));
        stage
    }

    fn process_file(
        &mut self,
        file: &DataFile,
        ctx: &RunContext,
        truncated: &mut HashSet<TableId>,
        stage: &mut StageResult,
    ) {
        log::info!("Processing {} as {}", file.path.display(), file.schema);
        let mut records = match self.transformer.iter_records(&file.path, file.schema, None) {
            Ok(records) => records,
            Err(e) => {
                source_failure(
                    stage,
                    file.required,
                    format!("{}: {}: {e}", file.source, file.path.display()),
                );
                return;
            }
        };

        let table = table_for_schema(file.schema);
        let progress = Arc::clone(&self.record_progress);
        progress.set_message(file.path.file_name().map_or_else(
            || file.path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        ));
        if self.writes_store() {
            let mode = if self.config.load.truncate_before_load && truncated.insert(table) {
                LoadMode::Truncate
            } else {
                LoadMode::Append
            };
            let options = LoadOptions::new(mode, ctx.batch_id.clone());
            let fixtures = (file.schema == SchemaId::BuildingRes).then_some(&self.fixtures);
            let valid = records.by_ref().filter_map(|outcome| {
                progress.inc(1);
                match outcome {
                    RowOutcome::Valid(record) => Some(record),
                    RowOutcome::Invalid { .. } => None,
                }
            });
            let load = self.loader.load_records(table, valid, fixtures, &options);

            stage.add_metric("records_loaded", load.loaded);
            stage.add_metric("records_updated", load.updated);
            stage.add_metric("records_failed", load.failed);
            stage.add_metric("records_invalid", load.invalid);
            stage.add_metric("records_skipped", load.skipped);
            for error in &load.errors {
                stage.push_error(format!("{}: {error}", file.path.display()));
            }

            if table.is_child() && mode == LoadMode::Append && load.success() {
                match self
                    .loader
                    .mark_inactive(table, ctx.started_at, &ctx.batch_id)
                {
                    Ok(superseded) => stage.add_metric("records_superseded", superseded),
                    Err(e) => stage.push_error(format!("superseding {table}: {e}")),
                }
            }
        } else {
            let valid = records
                .by_ref()
                .inspect(|_| progress.inc(1))
                .filter(RowOutcome::is_valid)
                .count();
            stage.add_metric("records_transformed", valid as u64);
        }

        let transform = records.into_result();
        stage.add_metric("records_processed", transform.records_processed);
        stage.add_metric("records_invalid", transform.records_invalid);
        stage.add_metric("records_skipped", transform.records_skipped);
        for warning in &transform.warnings {
            log::warn!("{}: {warning}", file.path.display());
        }
        if !transform.success {
            let reason = transform
                .warnings
                .last()
                .cloned()
                .unwrap_or_else(|| "transform stopped early".to_string());
            source_failure(
                stage,
                file.required,
                format!("{}: {}: {reason}", file.source, file.path.display()),
            );
        }
    }

    fn run_gis(&mut self) -> StageResult {
        let mut stage = StageResult::start(PipelineStage::Gis);
        let gis_sources: Vec<DataSource> =
            self.sources.iter().filter(|s| s.is_gis()).cloned().collect();

        for source in &gis_sources {
            let dir = self.extracts.extract_path(source);
            let parcels = taxroll_geography::find_shapefile(&dir, &self.config.gis.preferred_shapefile)
                .and_then(|shp| {
                    log::info!("{}: reading parcels from {}", source.name, shp.display());
                    taxroll_geography::read_parcel_coordinates(&shp, &self.config.gis)
                });
            let parcels = match parcels {
                Ok(parcels) => parcels,
                Err(e) => {
                    source_failure(&mut stage, source.required, format!("{}: {e}", source.name));
                    continue;
                }
            };

            stage.add_metric("shapes", parcels.shapes);
            stage.add_metric("coordinates_failed", parcels.failed);
            match self.loader.update_coordinates(&parcels.updates) {
                Ok(updated) => {
                    log::info!(
                        "{}: updated {updated} properties with coordinates",
                        source.name
                    );
                    stage.add_metric("coordinates_updated", updated);
                    stage.add_metric(
                        "coordinates_unmatched",
                        (parcels.updates.len() as u64).saturating_sub(updated),
                    );
                }
                Err(e) => source_failure(
                    &mut stage,
                    source.required,
                    format!("{}: coordinate update failed: {e}", source.name),
                ),
            }
        }

        self.check_coverage(&mut stage);
        stage
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn check_coverage(&self, stage: &mut StageResult) {
        let properties = match self.store().count(TableId::Properties, false) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Cannot count properties for GIS coverage: {e}");
                return;
            }
        };
        if properties == 0 {
            return;
        }
        let coverage = stage.metric("coordinates_updated") as f64 / properties as f64;
        stage.add_metric("coverage_percent", (coverage * 100.0).round() as u64);

        let minimum = self.config.gis.min_coverage;
        if minimum > 0.0 && coverage < minimum {
            log::warn!(
                "GIS coverage {:.1}% is below the configured minimum of {:.1}%",
                coverage * 100.0,
                minimum * 100.0
            );
            stage.add_metric("coverage_below_minimum", 1);
        }
    }

    fn run_cleanup(&self) -> StageResult {
        let mut stage = StageResult::start(PipelineStage::Cleanup);
        if self.config.cleanup.remove_downloads {
            match self.downloads.cleanup(&self.sources) {
                Ok(removed) => stage.add_metric("downloads_removed", removed as u64),
                Err(e) => stage.push_error(format!("removing downloads: {e}")),
            }
        }
        if self.config.cleanup.remove_extracts {
            for source in &self.sources {
                match self.extracts.cleanup(Some(source)) {
                    Ok(()) => stage.add_metric("extracts_removed", 1),
                    Err(e) => stage.push_error(format!("{}: removing extract: {e}", source.name)),
                }
            }
        }
        stage
    }
}

/// Throughput and success rate over the records the stage processed,
/// both rounded to whole numbers. Zero when nothing was processed or no
/// time elapsed.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn add_rate_metrics(stage: &mut StageResult, elapsed: std::time::Duration) {
    let processed = stage.metric("records_processed");
    let succeeded = stage.metric("records_loaded")
        + stage.metric("records_updated")
        + stage.metric("records_transformed");
    let seconds = elapsed.as_secs_f64();

    let per_second = if seconds > 0.0 {
        (processed as f64 / seconds).round() as u64
    } else {
        0
    };
    let success_rate = if processed > 0 {
        (succeeded.min(processed) as f64 / processed as f64 * 100.0).round() as u64
    } else {
        0
    };
    stage.add_metric("records_per_second", per_second);
    stage.add_metric("success_rate_percent", success_rate);
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
}
