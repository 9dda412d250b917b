//! Filesystem helpers for database files.

use std::path::Path;

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Creates the parent directory of a database file.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_nested_parents() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("a/b/taxroll.duckdb");
        ensure_parent(&db).unwrap();
        assert!(dir.path().join("a/b").is_dir());
        ensure_parent(Path::new("taxroll.duckdb")).unwrap();
    }
}
