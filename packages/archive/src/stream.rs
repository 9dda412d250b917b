//! Pull-based iteration over archive members without touching disk.
//!
//! A producer thread walks the archive and hands members over a
//! zero-capacity channel, so at most one member beyond the one the
//! consumer holds is ever in memory. Dropping the [`MemberStream`] makes the
//! producer's next send fail, which ends the thread.

use std::io::Read;
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use flate2::read::GzDecoder;
use globset::GlobSet;
use taxroll_source_models::ArchiveFormat;

use crate::ExtractError;
use crate::filter::build_globset;

/// One member read fully into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Member path as stored in the archive.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Lazy sequence of archive members. See [`stream_extract`].
pub struct MemberStream {
    rx: Receiver<Result<ArchiveMember, ExtractError>>,
}

impl Iterator for MemberStream {
    type Item = Result<ArchiveMember, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Streams the file members of an archive whose full member name matches
/// `pattern` (all members when `None`).
///
/// The format is inferred from the file name, defaulting to ZIP. Read
/// errors are yielded as the final item.
///
/// # Errors
///
/// Returns an error up front if the archive does not exist or the pattern
/// is not a valid glob.
pub fn stream_extract(
    archive_path: &Path,
    pattern: Option<&str>,
) -> Result<MemberStream, ExtractError> {
    if !archive_path.is_file() {
        return Err(ExtractError::ArchiveNotFound(
            archive_path.display().to_string(),
        ));
    }
    let patterns: Vec<String> = pattern.map(str::to_string).into_iter().collect();
    let globs = build_globset(&patterns)?;
    let format = crate::detect_format(archive_path, ArchiveFormat::Zip);
    let path = archive_path.to_path_buf();

    let (tx, rx) = sync_channel(0);
    std::thread::spawn(move || {
        let outcome = produce(&path, format, globs.as_ref(), &tx);
        if let Err(e) = outcome {
            let _ = tx.send(Err(e));
        }
    });

    Ok(MemberStream { rx })
}

type Sender = SyncSender<Result<ArchiveMember, ExtractError>>;

fn wanted(globs: Option<&GlobSet>, name: &str) -> bool {
    globs.is_none_or(|g| g.is_match(name))
}

/// Walks the archive, stopping quietly once the consumer goes away.
fn produce(
    path: &Path,
    format: ArchiveFormat,
    globs: Option<&GlobSet>,
    tx: &Sender,
) -> Result<(), ExtractError> {
    let file = std::fs::File::open(path).map_err(|e| ExtractError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    match format {
        ArchiveFormat::Zip => {
            let mut archive = zip::ZipArchive::new(file)?;
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i)?;
                if entry.is_dir() || !wanted(globs, entry.name()) {
                    continue;
                }
                let name = entry.name().to_string();
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).map_err(|e| ExtractError::Io {
                    path: name.clone(),
                    source: e,
                })?;
                if tx.send(Ok(ArchiveMember { name, bytes })).is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
        ArchiveFormat::Tar => produce_tar(file, path, globs, tx),
        ArchiveFormat::TarGz => produce_tar(GzDecoder::new(file), path, globs, tx),
    }
}

fn produce_tar<R: Read>(
    reader: R,
    path: &Path,
    globs: Option<&GlobSet>,
    tx: &Sender,
) -> Result<(), ExtractError> {
    let io = |e| ExtractError::Io {
        path: path.display().to_string(),
        source: e,
    };
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(io)? {
        let mut entry = entry.map_err(io)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(io)?.to_string_lossy().into_owned();
        if !wanted(globs, &name) {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(io)?;
        if tx.send(Ok(ArchiveMember { name, bytes })).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_archives::{write_tar_gz, write_zip};

    #[test]
    fn streams_matching_zip_members() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("a.zip");
        write_zip(
            &archive,
            &[
                ("real_acct.txt", b"acct\n1\n"),
                ("owners.txt", b"owner"),
                ("real_neighborhood_code.txt", b"nbhd"),
            ],
        );

        let members: Vec<ArchiveMember> = stream_extract(&archive, Some("real_*.txt"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["real_acct.txt", "real_neighborhood_code.txt"]);
        assert_eq!(members[0].bytes, b"acct\n1\n");
    }

    #[test]
    fn streams_tar_gz_and_stops_early() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("a.tar.gz");
        write_tar_gz(
            &archive,
            &[("one.txt", b"1"), ("two.txt", b"2"), ("three.txt", b"3")],
        );

        let mut stream = stream_extract(&archive, None).unwrap();
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.name, "one.txt");
        drop(stream);

        let all = stream_extract(&archive, None).unwrap().count();
        assert_eq!(all, 3);
    }

    #[test]
    fn missing_archive_is_an_error() {
        assert!(matches!(
            stream_extract(Path::new("/nonexistent/a.zip"), None),
            Err(ExtractError::ArchiveNotFound(_))
        ));
    }

    #[test]
    fn corrupt_archive_yields_error_item() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bad.zip");
        std::fs::write(&archive, b"garbage").unwrap();
        let items: Vec<_> = stream_extract(&archive, None).unwrap().collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
