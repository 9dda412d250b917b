#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Archive validation and extraction.
//!
//! Each source archive (ZIP, TAR, or TAR.GZ) is checked for integrity and
//! then unpacked into `<extract_root>/<archive stem>/`. Extraction is
//! all-or-nothing per source: on any error the partially written
//! destination directory is removed.

pub mod filter;
pub mod stream;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use taxroll_source_models::config::{EtlConfig, ExtractConfig};
use taxroll_source_models::{ArchiveFormat, DataSource};

use crate::filter::{MemberDecision, MemberFilter, sanitize_member_path};

/// Errors from archive operations.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Integrity check failed before extraction.
    #[error("corrupt archive {path}: {message}")]
    Corrupt { path: String, message: String },

    /// Member name would escape the destination directory.
    #[error("unsafe member path in archive: {name}")]
    UnsafePath { name: String },

    #[error("invalid extract pattern: {0}")]
    Pattern(#[from] globset::Error),
}

impl ExtractError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Outcome of extracting one source.
#[derive(Debug, Clone)]
pub struct ExtractResult {
    pub source: String,
    pub required: bool,
    pub success: bool,
    pub archive_path: PathBuf,
    pub extract_dir: Option<PathBuf>,
    /// Member paths relative to `extract_dir`, in archive order.
    pub files_extracted: Vec<String>,
    pub files_skipped: usize,
    pub bytes_extracted: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Extracted {
    files: Vec<String>,
    skipped: usize,
    bytes: u64,
}

/// Extracts downloaded archives into per-source directories.
pub struct ExtractManager {
    download_dir: PathBuf,
    extract_root: PathBuf,
    config: ExtractConfig,
}

impl ExtractManager {
    #[must_use]
    pub fn new(config: &EtlConfig) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            extract_root: config.extract_dir.clone(),
            config: config.extract.clone(),
        }
    }

    #[must_use]
    pub fn archive_path(&self, source: &DataSource) -> PathBuf {
        self.download_dir.join(&source.filename)
    }

    /// Destination directory for a source: the archive stem under the
    /// extract root.
    #[must_use]
    pub fn extract_path(&self, source: &DataSource) -> PathBuf {
        self.extract_root.join(source.extract_stem())
    }

    /// Whether the source has a non-empty extract directory.
    #[must_use]
    pub fn is_extracted(&self, source: &DataSource) -> bool {
        std::fs::read_dir(self.extract_path(source))
            .is_ok_and(|mut entries| entries.next().is_some())
    }

    /// Every regular file under the source's extract directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Io`] if a directory cannot be read.
    pub fn list_extracted_files(&self, source: &DataSource) -> Result<Vec<PathBuf>, ExtractError> {
        let root = self.extract_path(source);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        collect_files(&root, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// Extracts the source's downloaded archive.
    pub fn extract_one(&self, source: &DataSource) -> ExtractResult {
        self.extract_archive(source, &self.archive_path(source))
    }

    /// Extracts `archive_path` as if it were the source's archive.
    pub fn extract_archive(&self, source: &DataSource, archive_path: &Path) -> ExtractResult {
        let start = Instant::now();
        let dest = self.extract_path(source);
        let mut result = ExtractResult {
            source: source.name.clone(),
            required: source.required,
            success: false,
            archive_path: archive_path.to_path_buf(),
            extract_dir: None,
            files_extracted: Vec::new(),
            files_skipped: 0,
            bytes_extracted: 0,
            duration: Duration::ZERO,
            error: None,
        };

        match self.try_extract(source, archive_path, &dest) {
            Ok(extracted) => {
                log::info!(
                    "{}: extracted {} file(s), {} bytes ({} skipped)",
                    source.name,
                    extracted.files.len(),
                    extracted.bytes,
                    extracted.skipped
                );
                result.success = true;
                result.extract_dir = Some(dest);
                result.files_extracted = extracted.files;
                result.files_skipped = extracted.skipped;
                result.bytes_extracted = extracted.bytes;
            }
            Err(e) => {
                log::error!("{}: extraction failed: {e}", source.name);
                result.error = Some(e.to_string());
            }
        }
        result.duration = start.elapsed();
        result
    }

    /// Extracts every source sequentially, one result per source.
    pub fn extract_batch(&self, sources: &[DataSource]) -> Vec<ExtractResult> {
        sources.iter().map(|s| self.extract_one(s)).collect()
    }

    /// Removes one source's extract directory, or the whole extract root.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Io`] if removal fails.
    pub fn cleanup(&self, source: Option<&DataSource>) -> Result<(), ExtractError> {
        let target = source.map_or_else(|| self.extract_root.clone(), |s| self.extract_path(s));
        match std::fs::remove_dir_all(&target) {
            Ok(()) => {
                log::info!("Removed {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExtractError::io(&target, e)),
        }
    }

    fn try_extract(
        &self,
        source: &DataSource,
        archive_path: &Path,
        dest: &Path,
    ) -> Result<Extracted, ExtractError> {
        if !archive_path.is_file() {
            return Err(ExtractError::ArchiveNotFound(
                archive_path.display().to_string(),
            ));
        }

        let format = detect_format(archive_path, source.archive_format);
        let filter = MemberFilter::new(&self.config, &source.extract_patterns)?;

        if self.config.validate_archives {
            validate_archive(archive_path, format)?;
        }

        if dest.exists() && self.config.overwrite_existing {
            std::fs::remove_dir_all(dest).map_err(|e| ExtractError::io(dest, e))?;
        }
        std::fs::create_dir_all(dest).map_err(|e| ExtractError::io(dest, e))?;

        log::info!(
            "Extracting {} -> {}",
            archive_path.display(),
            dest.display()
        );

        let outcome = match format {
            ArchiveFormat::Zip => extract_zip(archive_path, dest, &filter),
            ArchiveFormat::Tar => open(archive_path).and_then(|f| extract_tar(f, dest, &filter)),
            ArchiveFormat::TarGz => {
                open(archive_path).and_then(|f| extract_tar(GzDecoder::new(f), dest, &filter))
            }
        };

        if outcome.is_err()
            && let Err(e) = std::fs::remove_dir_all(dest)
        {
            log::warn!("Failed to remove partial extract {}: {e}", dest.display());
        }
        outcome
    }
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const EMPTY_ZIP_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = b"\x1f\x8b";
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Picks the format from the archive's leading bytes, then its file name,
/// then the declared format.
#[must_use]
pub fn detect_format(path: &Path, declared: ArchiveFormat) -> ArchiveFormat {
    sniff_format(path)
        .or_else(|| {
            path.file_name()
                .and_then(|n| ArchiveFormat::from_file_name(&n.to_string_lossy()))
        })
        .unwrap_or(declared)
}

/// Format named by the magic bytes at the start of the file. Unreadable
/// files and unknown signatures yield `None`.
fn sniff_format(path: &Path) -> Option<ArchiveFormat> {
    let mut head = Vec::with_capacity(USTAR_OFFSET + USTAR_MAGIC.len());
    File::open(path)
        .ok()?
        .take((USTAR_OFFSET + USTAR_MAGIC.len()) as u64)
        .read_to_end(&mut head)
        .ok()?;

    if head.starts_with(ZIP_MAGIC) || head.starts_with(EMPTY_ZIP_MAGIC) {
        Some(ArchiveFormat::Zip)
    } else if head.starts_with(GZIP_MAGIC) {
        Some(ArchiveFormat::TarGz)
    } else if head.get(USTAR_OFFSET..).is_some_and(|m| m.starts_with(USTAR_MAGIC)) {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

/// Checks archive integrity without writing anything.
///
/// ZIP members are read to the end so every CRC is checked; TAR members
/// are enumerated so the member list (and any gzip layer) is fully read.
///
/// # Errors
///
/// Returns [`ExtractError::Corrupt`] if the archive is damaged.
pub fn validate_archive(path: &Path, format: ArchiveFormat) -> Result<(), ExtractError> {
    let corrupt = |message: String| ExtractError::Corrupt {
        path: path.display().to_string(),
        message,
    };
    match format {
        ArchiveFormat::Zip => {
            let mut archive =
                zip::ZipArchive::new(open(path)?).map_err(|e| corrupt(e.to_string()))?;
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i).map_err(|e| corrupt(e.to_string()))?;
                let name = entry.name().to_string();
                std::io::copy(&mut entry, &mut std::io::sink())
                    .map_err(|e| corrupt(format!("{name}: {e}")))?;
            }
            Ok(())
        }
        ArchiveFormat::Tar => validate_tar(open(path)?).map_err(|e| corrupt(e.to_string())),
        ArchiveFormat::TarGz => {
            validate_tar(GzDecoder::new(open(path)?)).map_err(|e| corrupt(e.to_string()))
        }
    }
}

fn validate_tar<R: Read>(reader: R) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        entry?.path()?;
    }
    Ok(())
}

fn open(path: &Path) -> Result<File, ExtractError> {
    File::open(path).map_err(|e| ExtractError::io(path, e))
}

fn skip(name: &str, decision: MemberDecision, size: u64) {
    match decision {
        MemberDecision::SkipTooLarge => {
            log::warn!("  skipping {name}: {size} bytes exceeds the size limit");
        }
        _ => log::debug!("  skipping {name}: {decision:?}"),
    }
}

fn write_member<R: Read>(
    reader: &mut R,
    dest: &Path,
    relative: &Path,
) -> Result<u64, ExtractError> {
    let target = dest.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ExtractError::io(parent, e))?;
    }
    let mut out = File::create(&target).map_err(|e| ExtractError::io(&target, e))?;
    std::io::copy(reader, &mut out).map_err(|e| ExtractError::io(&target, e))
}

fn extract_zip(path: &Path, dest: &Path, filter: &MemberFilter) -> Result<Extracted, ExtractError> {
    let mut archive = zip::ZipArchive::new(open(path)?)?;
    let mut extracted = Extracted::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let relative = sanitize_member_path(&name)?;
        let decision = filter.decide(&relative, entry.size());
        if decision != MemberDecision::Extract {
            skip(&name, decision, entry.size());
            extracted.skipped += 1;
            continue;
        }
        extracted.bytes += write_member(&mut entry, dest, &relative)?;
        extracted.files.push(relative.to_string_lossy().into_owned());
    }
    Ok(extracted)
}

fn extract_tar<R: Read>(
    reader: R,
    dest: &Path,
    filter: &MemberFilter,
) -> Result<Extracted, ExtractError> {
    let mut archive = tar::Archive::new(reader);
    let mut extracted = Extracted::default();
    let io = |e| ExtractError::io(dest, e);

    for entry in archive.entries().map_err(io)? {
        let mut entry = entry.map_err(io)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(io)?.to_string_lossy().into_owned();
        let relative = sanitize_member_path(&name)?;
        let size = entry.size();
        let decision = filter.decide(&relative, size);
        if decision != MemberDecision::Extract {
            skip(&name, decision, size);
            extracted.skipped += 1;
            continue;
        }
        extracted.bytes += write_member(&mut entry, dest, &relative)?;
        extracted.files.push(relative.to_string_lossy().into_owned());
    }
    Ok(extracted)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ExtractError> {
    for entry in std::fs::read_dir(dir).map_err(|e| ExtractError::io(dir, e))? {
        let path = entry.map_err(|e| ExtractError::io(dir, e))?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_archives {
    use std::io::Write as _;
    use std::path::Path;

    pub fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in members {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    /// Writes a tar archive without path validation so tests can include
    /// hostile member names.
    pub fn write_tar<W: std::io::Write>(writer: W, members: &[(&str, &[u8])]) -> W {
        let mut builder = tar::Builder::new(writer);
        for (name, data) in members {
            let mut header = tar::Header::new_old();
            let bytes = name.as_bytes();
            header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub fn write_tar_gz(path: &Path, members: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        write_tar(encoder, members).finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use taxroll_source_models::SourceType;

    use super::test_archives::{write_tar, write_tar_gz, write_zip};
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        manager: ExtractManager,
        config: EtlConfig,
    }

    fn fixture(tweak: impl FnOnce(&mut EtlConfig)) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = EtlConfig {
            download_dir: tmp.path().join("downloads"),
            extract_dir: tmp.path().join("extracted"),
            ..EtlConfig::default()
        };
        tweak(&mut config);
        std::fs::create_dir_all(&config.download_dir).unwrap();
        Fixture {
            manager: ExtractManager::new(&config),
            config,
            _tmp: tmp,
        }
    }

    fn source(filename: &str, patterns: &[&str]) -> DataSource {
        DataSource {
            name: filename.to_string(),
            url_template: "https://example.test/{year}/x.zip".to_string(),
            filename: filename.to_string(),
            source_type: SourceType::PropertyData,
            archive_format: ArchiveFormat::Zip,
            required: true,
            checksum: None,
            extract_patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            priority: 10,
        }
    }

    #[test]
    fn extracts_zip_with_filters() {
        let fx = fixture(|_| {});
        let s = source("Real_building_land.zip", &["building_res.txt", "fixtures.txt"]);
        write_zip(
            &fx.manager.archive_path(&s),
            &[
                ("building_res.txt", b"acct\tbld_num\n1\t1\n"),
                ("fixtures.txt", b"acct\tbld_num\ttype\ttype_dscr\tunits\n"),
                ("land.txt", b"ignored by pattern"),
                ("notes.exe", b"ignored by extension"),
            ],
        );

        let result = fx.manager.extract_one(&s);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.files_extracted, ["building_res.txt", "fixtures.txt"]);
        assert_eq!(result.files_skipped, 2);
        let dir = result.extract_dir.unwrap();
        assert_eq!(dir, fx.config.extract_dir.join("Real_building_land"));
        assert!(dir.join("building_res.txt").is_file());
        assert!(!dir.join("land.txt").exists());
        assert!(fx.manager.is_extracted(&s));
        assert_eq!(fx.manager.list_extracted_files(&s).unwrap().len(), 2);
    }

    #[test]
    fn skips_oversized_members() {
        let fx = fixture(|c| c.extract.max_file_size = Some(8));
        let s = source("a.zip", &[]);
        write_zip(
            &fx.manager.archive_path(&s),
            &[("small.txt", b"tiny"), ("big.txt", b"much too large")],
        );
        let result = fx.manager.extract_one(&s);
        assert!(result.success);
        assert_eq!(result.files_extracted, ["small.txt"]);
        assert_eq!(result.bytes_extracted, 4);
    }

    #[test]
    fn overwrite_replaces_stale_files() {
        let fx = fixture(|_| {});
        let s = source("a.zip", &[]);
        let stale = fx.manager.extract_path(&s).join("stale.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();
        write_zip(&fx.manager.archive_path(&s), &[("fresh.txt", b"new")]);

        assert!(fx.manager.extract_one(&s).success);
        assert!(!stale.exists());
    }

    #[test]
    fn missing_archive_fails() {
        let fx = fixture(|_| {});
        let result = fx.manager.extract_one(&source("absent.zip", &[]));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("archive not found"));
    }

    #[test]
    fn corrupt_zip_fails_validation() {
        let fx = fixture(|_| {});
        let s = source("bad.zip", &[]);
        std::fs::write(fx.manager.archive_path(&s), b"this is not a zip file").unwrap();
        let result = fx.manager.extract_one(&s);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("corrupt archive"));
        assert!(!fx.manager.extract_path(&s).exists());
    }

    #[test]
    fn extracts_tar_gz_preserving_directories() {
        let fx = fixture(|_| {});
        let s = source("dump.tar.gz", &[]);
        write_tar_gz(
            &fx.manager.archive_path(&s),
            &[("tables/real_acct.txt", b"acct\n1\n"), ("owners.txt", b"x")],
        );
        let result = fx.manager.extract_one(&s);
        assert!(result.success, "{:?}", result.error);
        let dir = result.extract_dir.unwrap();
        assert_eq!(dir, fx.config.extract_dir.join("dump"));
        assert!(dir.join("tables/real_acct.txt").is_file());
    }

    #[test]
    fn leading_bytes_decide_the_format() {
        let dir = tempfile::tempdir().unwrap();
        let zip_named_gz = dir.path().join("roll.tar.gz");
        write_zip(&zip_named_gz, &[("a.txt", b"a")]);
        assert_eq!(detect_format(&zip_named_gz, ArchiveFormat::Tar), ArchiveFormat::Zip);

        let gz_named_zip = dir.path().join("dump.zip");
        write_tar_gz(&gz_named_zip, &[("a.txt", b"a")]);
        assert_eq!(detect_format(&gz_named_zip, ArchiveFormat::Zip), ArchiveFormat::TarGz);

        let unknown = dir.path().join("payload.bin");
        std::fs::write(&unknown, b"plain text").unwrap();
        assert_eq!(detect_format(&unknown, ArchiveFormat::Tar), ArchiveFormat::Tar);
        let named = dir.path().join("payload.zip");
        std::fs::write(&named, b"plain text").unwrap();
        assert_eq!(detect_format(&named, ArchiveFormat::Tar), ArchiveFormat::Zip);
        assert_eq!(
            detect_format(&dir.path().join("absent.dat"), ArchiveFormat::TarGz),
            ArchiveFormat::TarGz
        );
    }

    #[test]
    fn extracts_zip_saved_under_a_tar_name() {
        let fx = fixture(|_| {});
        let s = source("mislabeled.tar.gz", &[]);
        write_zip(&fx.manager.archive_path(&s), &[("real_acct.txt", b"acct\n1\n")]);
        let result = fx.manager.extract_one(&s);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.files_extracted, ["real_acct.txt"]);
    }

    #[test]
    fn unsafe_member_aborts_and_removes_destination() {
        let fx = fixture(|c| c.extract.validate_archives = false);
        let s = source("evil.tar", &[]);
        let file = std::fs::File::create(fx.manager.archive_path(&s)).unwrap();
        write_tar(file, &[("good.txt", b"fine"), ("../evil.txt", b"nope")]);

        let result = fx.manager.extract_one(&s);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unsafe member path"));
        assert!(!fx.manager.extract_path(&s).exists());
        assert!(!fx.config.extract_dir.join("evil.txt").exists());
    }

    #[test]
    fn batch_reports_each_source() {
        let fx = fixture(|_| {});
        let present = source("present.zip", &[]);
        write_zip(&fx.manager.archive_path(&present), &[("a.txt", b"a")]);
        let results = fx
            .manager
            .extract_batch(&[present.clone(), source("absent.zip", &[])]);
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);

        fx.manager.cleanup(Some(&present)).unwrap();
        assert!(!fx.manager.is_extracted(&present));
    }
}
