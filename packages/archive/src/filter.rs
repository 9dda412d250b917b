//! Per-member extraction filters.

use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use taxroll_source_models::config::ExtractConfig;

use crate::ExtractError;

/// Why a member is or is not extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberDecision {
    Extract,
    SkipExtension,
    SkipPattern,
    SkipTooLarge,
}

/// Allow-list of extensions, optional base-name globs, and a size ceiling.
#[derive(Debug)]
pub struct MemberFilter {
    allowed_extensions: Vec<String>,
    patterns: Option<GlobSet>,
    max_file_size: Option<u64>,
}

impl MemberFilter {
    /// Builds a filter from the extract settings and a source's patterns.
    ///
    /// Patterns match case-insensitively against the member's base name.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Pattern`] if a pattern is not a valid glob.
    pub fn new(config: &ExtractConfig, patterns: &[String]) -> Result<Self, ExtractError> {
        Ok(Self {
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            patterns: build_globset(patterns)?,
            max_file_size: config.max_file_size,
        })
    }

    #[must_use]
    pub fn decide(&self, member: &Path, size: u64) -> MemberDecision {
        if !self.allowed_extensions.is_empty() {
            let ext = member
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase());
            if !ext.is_some_and(|e| self.allowed_extensions.contains(&e)) {
                return MemberDecision::SkipExtension;
            }
        }
        if let Some(patterns) = &self.patterns {
            let matched = member
                .file_name()
                .is_some_and(|base| patterns.is_match(Path::new(base)));
            if !matched {
                return MemberDecision::SkipPattern;
            }
        }
        if self.max_file_size.is_some_and(|max| size > max) {
            return MemberDecision::SkipTooLarge;
        }
        MemberDecision::Extract
    }
}

/// Compiles case-insensitive globs. `None` when there are no patterns.
pub(crate) fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, ExtractError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(Some(builder.build()?))
}

/// Turns an archive member name into a relative path that cannot escape
/// the destination directory.
///
/// # Errors
///
/// Returns [`ExtractError::UnsafePath`] for absolute paths, `..`
/// components, or names that reduce to nothing.
pub fn sanitize_member_path(name: &str) -> Result<PathBuf, ExtractError> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath {
                    name: name.to_string(),
                });
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ExtractError::UnsafePath {
            name: name.to_string(),
        });
    }
    Ok(clean)
}
