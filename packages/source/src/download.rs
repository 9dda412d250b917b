//! Archive download manager.
//!
//! Streams each source's archive to the download directory with retry and
//! exponential backoff, optional SHA-256 verification, and optional
//! bandwidth throttling. Every failure is captured in the returned
//! [`DownloadResult`]; nothing is raised past [`DownloadManager::download_batch`].

use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use reqwest::StatusCode;
use sha2::{Digest as _, Sha256};
use taxroll_source_models::DataSource;
use taxroll_source_models::config::{DownloadConfig, EtlConfig, RetryConfig};
use tokio::io::AsyncWriteExt as _;

use crate::SourceError;
use crate::progress::ProgressCallback;
use crate::retry::{self, AttemptError};

/// Outcome of downloading one source.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub source: String,
    pub required: bool,
    pub success: bool,
    /// URL actually fetched, after year fallback.
    pub resolved_url: String,
    pub local_path: Option<PathBuf>,
    pub bytes: u64,
    pub duration: Duration,
    pub attempts: u32,
    pub checksum_verified: bool,
    pub error: Option<String>,
}

/// Downloads source archives into a single directory.
pub struct DownloadManager {
    client: reqwest::Client,
    download_dir: PathBuf,
    data_year: i32,
    retry: RetryConfig,
    config: DownloadConfig,
}

impl DownloadManager {
    /// Builds a manager with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &EtlConfig) -> Result<Self, SourceError> {
        let timeout = Duration::from_secs(config.download.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(config.download.user_agent.clone())
            .danger_accept_invalid_certs(!config.download.verify_tls)
            .build()?;

        Ok(Self {
            client,
            download_dir: config.download_dir.clone(),
            data_year: config.data_year,
            retry: config.retry.clone(),
            config: config.download.clone(),
        })
    }

    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Where the source's archive is (or will be) stored.
    #[must_use]
    pub fn local_path(&self, source: &DataSource) -> PathBuf {
        self.download_dir.join(&source.filename)
    }

    #[must_use]
    pub fn is_downloaded(&self, source: &DataSource) -> bool {
        self.local_path(source).is_file()
    }

    /// Resolves the source URL for the configured year.
    ///
    /// Year-dependent URLs are checked with a HEAD request first; a 404 means the
    /// district has not published that year yet, so the previous year is
    /// used instead. Other HEAD failures keep the current year and
    /// let the download's own retry loop deal with them.
    pub async fn resolve_url(&self, source: &DataSource) -> String {
        let url = source.url_for_year(self.data_year);
        if !source.url_has_year() {
            return url;
        }

        match self.client.head(&url).send().await {
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                let fallback = source.url_for_year(self.data_year - 1);
                log::warn!(
                    "{}: {} not found, falling back to {} data",
                    source.name,
                    self.data_year,
                    self.data_year - 1
                );
                fallback
            }
            Ok(_) => url,
            Err(e) => {
                log::debug!("{}: HEAD request failed: {e}", source.name);
                url
            }
        }
    }

    /// Downloads a single source, retrying transient failures.
    pub async fn download_one(&self, source: &DataSource) -> DownloadResult {
        let start = Instant::now();
        let path = self.local_path(source);
        let url = self.resolve_url(source).await;

        let mut result = DownloadResult {
            source: source.name.clone(),
            required: source.required,
            success: false,
            resolved_url: url.clone(),
            local_path: None,
            bytes: 0,
            duration: Duration::ZERO,
            attempts: 0,
            checksum_verified: false,
            error: None,
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
            result.error = Some(SourceError::io(&self.download_dir, e).to_string());
            result.duration = start.elapsed();
            return result;
        }

        log::info!("Downloading {} from {url}", source.name);

        let mut last_error = None;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = retry::retry_delay(&self.retry, attempt - 1);
                log::warn!(
                    "  {}: retry {attempt}/{} in {delay:?}...",
                    source.name,
                    self.retry.max_retries
                );
                tokio::time::sleep(delay).await;
            }
            result.attempts += 1;

            match self.fetch_to_file(&url, &path).await {
                Ok(bytes) => {
                    result.bytes = bytes;
                    last_error = None;
                    break;
                }
                Err(AttemptError::Transient(e)) => {
                    log::warn!("  {}: transient error: {e}", source.name);
                    last_error = Some(e);
                }
                Err(AttemptError::Permanent(e)) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = last_error {
            log::error!("{}: download failed: {e}", source.name);
            remove_partial(&path).await;
            result.error = Some(e.to_string());
            result.duration = start.elapsed();
            return result;
        }

        if let Some(expected) = &source.checksum {
            match verify_checksum(&path, expected, self.config.chunk_size).await {
                Ok(()) => result.checksum_verified = true,
                Err(e) => {
                    log::error!("{}: {e}", source.name);
                    remove_partial(&path).await;
                    result.error = Some(e.to_string());
                    result.duration = start.elapsed();
                    return result;
                }
            }
        }

        result.success = true;
        result.local_path = Some(path);
        result.duration = start.elapsed();
        #[allow(clippy::cast_precision_loss)]
        let mb = result.bytes as f64 / 1_048_576.0;
        log::info!(
            "{}: downloaded {mb:.1} MB in {:.1}s ({} attempt(s))",
            source.name,
            result.duration.as_secs_f64(),
            result.attempts
        );
        result
    }

    /// Downloads every source, one result per source in input order.
    ///
    /// `max_parallel <= 1` downloads sequentially; otherwise at most
    /// `max_parallel` downloads are in flight at once.
    pub async fn download_batch(
        &self,
        sources: &[DataSource],
        max_parallel: usize,
        progress: Arc<dyn ProgressCallback>,
    ) -> Vec<DownloadResult> {
        progress.set_total(sources.len() as u64);

        let results = if max_parallel <= 1 {
            let mut results = Vec::with_capacity(sources.len());
            for source in sources {
                progress.set_message(source.name.clone());
                results.push(self.download_one(source).await);
                progress.inc(1);
            }
            results
        } else {
            let mut indexed: Vec<(usize, DownloadResult)> =
                futures::stream::iter(sources.iter().enumerate().map(|(i, source)| {
                    let progress = Arc::clone(&progress);
                    async move {
                        let result = self.download_one(source).await;
                        progress.inc(1);
                        (i, result)
                    }
                }))
                .buffer_unordered(max_parallel)
                .collect()
                .await;
            indexed.sort_by_key(|(i, _)| *i);
            indexed.into_iter().map(|(_, r)| r).collect()
        };

        let failed = results.iter().filter(|r| !r.success).count();
        progress.finish(format!(
            "{} downloaded, {failed} failed",
            results.len() - failed
        ));
        results
    }

    /// Removes downloaded archives. Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Io`] if the directory cannot be read or a file
    /// cannot be removed.
    pub fn cleanup(&self, sources: &[DataSource]) -> Result<usize, SourceError> {
        let mut removed = 0;
        for source in sources {
            let path = self.local_path(source);
            if path.is_file() {
                std::fs::remove_file(&path).map_err(|e| SourceError::io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// One GET, streamed to `path`. Returns the number of bytes written.
    async fn fetch_to_file(&self, url: &str, path: &Path) -> Result<u64, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(retry::classify_error)?;

        if let Some(e) = retry::classify_status(url, response.status()) {
            return Err(e);
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| AttemptError::Transient(SourceError::io(path, e)))?;
        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(retry::classify_error)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Transient(SourceError::io(path, e)))?;
            written += chunk.len() as u64;
            self.throttle(written, started).await;
        }

        file.flush()
            .await
            .map_err(|e| AttemptError::Transient(SourceError::io(path, e)))?;
        Ok(written)
    }

    /// Sleeps until `written` bytes would have taken at least
    /// `written / bandwidth_limit` seconds.
    async fn throttle(&self, written: u64, started: Instant) {
        if let Some(limit) = self.config.bandwidth_limit
            && limit > 0
        {
            #[allow(clippy::cast_precision_loss)]
            let target = Duration::from_secs_f64(written as f64 / limit as f64);
            let elapsed = started.elapsed();
            if target > elapsed {
                tokio::time::sleep(target - elapsed).await;
            }
        }
    }
}

/// Computes the SHA-256 of a file on a blocking thread.
///
/// # Errors
///
/// Returns [`SourceError::Io`] if the file cannot be read.
pub async fn sha256_file(path: &Path, chunk_size: usize) -> Result<String, SourceError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path).map_err(|e| SourceError::io(&path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = file.read(&mut buf).map_err(|e| SourceError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
}

/// Verifies a file against an expected hex SHA-256 (case-insensitive).
///
/// # Errors
///
/// Returns [`SourceError::ChecksumMismatch`] on mismatch, or
/// [`SourceError::Io`] if the file cannot be read.
pub async fn verify_checksum(
    path: &Path,
    expected: &str,
    chunk_size: usize,
) -> Result<(), SourceError> {
    let actual = sha256_file(path, chunk_size).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(SourceError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
    }
}
