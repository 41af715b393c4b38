//! Archive rotation.
//!
//! The policy itself is [`select_for_removal`], a pure function over a
//! listing. [`prune_archives`] applies it to a directory and tolerates
//! other finalizers pruning the same directory at the same time.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::Pattern;
use serde::Serialize;

use crate::storage::{ARCHIVE_PREFIX, ARCHIVE_SUFFIX};

/// One archive file as seen in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    /// Deletions that failed for a reason other than the file being gone.
    pub failed: Vec<PathBuf>,
}

/// Returns the entries to delete so that only the `keep` most recently
/// modified remain. Ties on modification time are broken by path so the
/// result does not depend on listing order.
pub fn select_for_removal(mut entries: Vec<ArchiveEntry>, keep: usize) -> Vec<ArchiveEntry> {
    entries.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.path.cmp(&a.path))
    });
    if entries.len() <= keep {
        return Vec::new();
    }
    entries.split_off(keep)
}

fn archive_pattern() -> Pattern {
    // Prefix and suffix are plain literals; escaping keeps that true.
    let pattern = format!(
        "{}*{}",
        Pattern::escape(ARCHIVE_PREFIX),
        Pattern::escape(ARCHIVE_SUFFIX)
    );
    Pattern::new(&pattern).unwrap_or_default()
}

/// Lists the batch archives in `dir`. A missing directory has none.
pub fn list_archives(dir: &Path) -> std::io::Result<Vec<ArchiveEntry>> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let pattern = archive_pattern();
    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name();
        if !pattern.matches(&name.to_string_lossy()) {
            continue;
        }
        // Another pruner may delete the file between listing and stat.
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            continue;
        }
        entries.push(ArchiveEntry {
            path: entry.path(),
            modified: metadata.modified()?,
        });
    }
    Ok(entries)
}

/// Deletes every archive in `dir` beyond the `keep` most recent.
///
/// Never fails the caller: listing and deletion problems are logged as
/// warnings, and a file already deleted by a concurrent pruner counts as
/// removed.
pub fn prune_archives(dir: &Path, keep: usize) -> PruneReport {
    let entries = match list_archives(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Could not list archives in {}: {}", dir.display(), e);
            return PruneReport::default();
        }
    };

    let doomed = select_for_removal(entries.clone(), keep);
    let mut report = PruneReport {
        kept: entries
            .into_iter()
            .filter(|e| !doomed.contains(e))
            .map(|e| e.path)
            .collect(),
        ..PruneReport::default()
    };

    for entry in doomed {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                log::info!("Pruned archive {}", entry.path.display());
                report.removed.push(entry.path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Archive {} already pruned", entry.path.display());
                report.removed.push(entry.path);
            }
            Err(e) => {
                log::warn!("Failed to prune archive {}: {}", entry.path.display(), e);
                report.failed.push(entry.path);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(name: &str, age_secs: u64) -> ArchiveEntry {
        ArchiveEntry {
            path: PathBuf::from(name),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    #[test]
    fn test_nothing_removed_at_or_below_limit() {
        assert!(select_for_removal(vec![], 2).is_empty());
        assert!(select_for_removal(vec![entry("a", 1)], 2).is_empty());
        assert!(select_for_removal(vec![entry("a", 1), entry("b", 2)], 2).is_empty());
    }

    #[test]
    fn test_oldest_removed_regardless_of_listing_order() {
        let listing = vec![
            entry("c", 30),
            entry("a", 10),
            entry("e", 50),
            entry("b", 20),
            entry("d", 40),
        ];
        let removed: Vec<_> = select_for_removal(listing, 2)
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            removed,
            vec![PathBuf::from("c"), PathBuf::from("d"), PathBuf::from("e")]
        );
    }

    #[test]
    fn test_pattern_matches_only_batch_archives() {
        let pattern = archive_pattern();
        assert!(pattern.matches("carnets_abc123.zip"));
        assert!(!pattern.matches("carnets_abc123.zip.part"));
        assert!(!pattern.matches("report.zip"));
    }

    #[test]
    fn test_prune_missing_directory_is_noop() {
        let temp = TempDir::new().unwrap();
        let report = prune_archives(&temp.path().join("absent"), 2);
        assert_eq!(report, PruneReport::default());
    }

    #[test]
    fn test_prune_ignores_foreign_files() {
        let temp = TempDir::new().unwrap();
        for name in ["carnets_1.zip", "carnets_2.zip", "carnets_3.zip", "notes.txt"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }
        let report = prune_archives(temp.path(), 2);
        assert_eq!(report.kept.len(), 2);
        assert_eq!(report.removed.len(), 1);
        assert!(temp.path().join("notes.txt").exists());

        let again = prune_archives(temp.path(), 2);
        assert!(again.removed.is_empty());
    }
}
