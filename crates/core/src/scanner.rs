//! Directory scanning with include/ignore globs.

use crate::config::DirectoryConfig;
use crate::error::IndexError;
use crate::models::ScanSelection;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRoot {
    pub path: PathBuf,
    pub include: Vec<String>,
    pub ignore: Vec<String>,
}

impl From<&DirectoryConfig> for ScanRoot {
    fn from(value: &DirectoryConfig) -> Self {
        Self {
            path: value.path.clone(),
            include: value.include.clone(),
            ignore: value.ignore.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub path: Option<PathBuf>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub files: Vec<PathBuf>,
    pub warnings: Vec<ScanWarning>,
}

/// Result of scanning every configured root.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub per_root: Vec<Vec<PathBuf>>,
    pub selection: ScanSelection,
    pub warnings: Vec<ScanWarning>,
}

impl ScanReport {
    /// Union of all roots, deduplicated and in path order.
    pub fn files(&self) -> Vec<PathBuf> {
        self.selection.iter().map(PathBuf::from).collect()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, IndexError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn relative_path_string(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Lists regular files under `base` that match at least one include pattern
/// and no ignore pattern. Includes are matched against the path relative to
/// `base`; ignores against both the relative and the full path.
///
/// Unreadable entries are reported as warnings and left out.
pub fn scan_directory(
    base: &Path,
    include: &[String],
    ignore: &[String],
) -> Result<ScanOutcome, IndexError> {
    let include_set = build_globset(include)?;
    let ignore_set = build_globset(ignore)?;

    let mut outcome = ScanOutcome::default();
    if !base.exists() {
        tracing::warn!(root = %base.display(), "scan root does not exist");
        outcome.warnings.push(ScanWarning {
            path: Some(base.to_path_buf()),
            message: "scan root does not exist".to_string(),
        });
        return Ok(outcome);
    }

    let mut matched = BTreeSet::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                let path = error.path().map(Path::to_path_buf);
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "skipping unreadable entry during scan"
                );
                outcome.warnings.push(ScanWarning {
                    path,
                    message: error.to_string(),
                });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = relative_path_string(base, entry.path());
        if !include_set.is_match(&relative) {
            continue;
        }
        let full = entry.path().to_string_lossy();
        if ignore_set.is_match(&relative) || ignore_set.is_match(full.as_ref()) {
            continue;
        }

        matched.insert(entry.path().to_path_buf());
    }

    outcome.files = matched.into_iter().collect();
    Ok(outcome)
}

/// Scans every root and unions the results into one [`ScanSelection`].
pub fn scan_roots(roots: &[ScanRoot]) -> Result<ScanReport, IndexError> {
    let mut report = ScanReport::default();

    for root in roots {
        let outcome = scan_directory(&root.path, &root.include, &root.ignore)?;
        tracing::info!(
            root = %root.path.display(),
            files = outcome.files.len(),
            "scanned directory"
        );

        report.selection.extend(
            outcome
                .files
                .iter()
                .map(|path| path.to_string_lossy().to_string()),
        );
        report.per_root.push(outcome.files);
        report.warnings.extend(outcome.warnings);
    }

    Ok(report)
}
