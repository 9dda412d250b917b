#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the taxroll toolchain.
//!
//! Pipeline progress for the terminal: a sources bar for the download
//! stage and a records counter for transform and load, both behind
//! [`ProgressCallback`]. [`init_logger`] routes log output through the same
//! [`MultiProgress`] so lines never tear a bar.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use taxroll_source::progress::ProgressCallback;

pub use indicatif::MultiProgress;

/// Environment variable consulted when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "ETL_LOG_LEVEL";

const DEFAULT_FILTER: &str = "info";

const SOURCES_TEMPLATE: &str =
    "{prefix:>10.bold} {wide_bar:.green/dim} {pos}/{len} sources [{elapsed_precise}] {msg}";
const RECORDS_TEMPLATE: &str = "{prefix:>10.bold} {spinner:.cyan} {human_pos} records ({per_sec}) {msg}";
const SIZED_RECORDS_TEMPLATE: &str =
    "{prefix:>10.bold} {wide_bar:.cyan/dim} {human_pos}/{human_len} records {percent}% [{eta}] {msg}";

fn style(template: &str, fallback: fn() -> ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| fallback())
}

/// Stage progress drawn on an `indicatif` bar. The prefix names the
/// stage and the message names the source or export file being worked on.
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Applied when [`ProgressCallback::set_total()`] reports a length.
    sized: ProgressStyle,
}

impl IndicatifProgress {
    fn attach(
        multi: &MultiProgress,
        bar: ProgressBar,
        stage: &str,
        sized: ProgressStyle,
    ) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(bar);
        bar.set_prefix(stage.to_string());
        Arc::new(Self { bar, sized })
    }

    /// Sources handled by a stage, e.g. `Download  3/9 sources`.
    #[must_use]
    pub fn sources_bar(multi: &MultiProgress, stage: &str) -> Arc<dyn ProgressCallback> {
        let sized = style(SOURCES_TEMPLATE, ProgressStyle::default_bar);
        let bar = ProgressBar::new(0).with_style(sized.clone());
        Self::attach(multi, bar, stage, sized)
    }

    /// Records read from export files during transform and load. Export
    /// files carry no row count, so this counts up with a rate until a total
    /// is set.
    #[must_use]
    pub fn records_spinner(multi: &MultiProgress, stage: &str) -> Arc<dyn ProgressCallback> {
        let bar = ProgressBar::new_spinner()
            .with_style(style(RECORDS_TEMPLATE, ProgressStyle::default_spinner));
        bar.enable_steady_tick(Duration::from_millis(120));
        let sized = style(SIZED_RECORDS_TEMPLATE, ProgressStyle::default_bar);
        Self::attach(multi, bar, stage, sized)
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.sized.clone());
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Log filter from `RUST_LOG`, then [`LOG_LEVEL_ENV`], then `info`.
fn log_filter<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["RUST_LOG", LOG_LEVEL_ENV]
        .into_iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_ascii_lowercase())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Installs `pretty_env_logger` behind `indicatif-log-bridge` and returns
/// the [`MultiProgress`] every stage bar is drawn on.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let filter = log_filter(|name| std::env::var(name).ok());
    let logger = pretty_env_logger::formatted_builder()
        .parse_filters(&filter)
        .build();
    let level = logger.filter();

    // Already set in tests.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
