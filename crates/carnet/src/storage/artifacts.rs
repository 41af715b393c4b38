use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// File name prefix shared by every batch archive.
pub const ARCHIVE_PREFIX: &str = "carnets_";
pub const ARCHIVE_SUFFIX: &str = ".zip";

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Removes a directory tree, treating "already gone" as success.
fn remove_tree(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => log::debug!("Removed work directory {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove work directory {}: {}", path.display(), e),
    }
}

/// Directory layout for everything the pipeline writes.
///
/// - `work/<session>/<driver>/`: scratch space for one unit, never shared.
/// - `cards/<driver>/`: permanent per-driver cards.
/// - `archives/`: one zip per completed batch, rotated by the pruner.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    work_root: PathBuf,
    cards_root: PathBuf,
    archive_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(
        work_root: impl Into<PathBuf>,
        cards_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            work_root: work_root.into(),
            cards_root: cards_root.into(),
            archive_root: archive_root.into(),
        }
    }

    /// Store rooted at `data_directory` with the default sub-directories.
    pub fn under(data_directory: &Path) -> Self {
        Self::new(
            data_directory.join("work"),
            data_directory.join("cards"),
            data_directory.join("archives"),
        )
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn cards_root(&self) -> &Path {
        &self.cards_root
    }

    /// Creates a fresh scratch directory for one unit. The directory is
    /// removed when the returned guard is dropped, whichever way the unit
    /// ends. Leftovers of an earlier attempt are cleared first.
    pub fn work_dir(&self, session_id: &str, driver_id: i64) -> Result<WorkDir, StorageError> {
        let path = self
            .work_root
            .join(session_id)
            .join(driver_id.to_string());
        remove_tree(&path);
        ensure_directory(&path)?;
        Ok(WorkDir { path })
    }

    /// Removes the batch-level work directory once no unit needs it.
    pub fn clear_session_work(&self, session_id: &str) {
        remove_tree(&self.work_root.join(session_id));
    }

    /// Moves a rendered card into permanent storage with a single rename
    /// and checks it arrived.
    pub fn persist(
        &self,
        artifact: &Path,
        session_id: &str,
        driver_id: i64,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.cards_root.join(driver_id.to_string());
        ensure_directory(&dir)?;

        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("carnet_{}.pdf", driver_id));
        let destination = dir.join(format!("{}_{}", session_id, file_name));

        std::fs::rename(artifact, &destination).map_err(|e| StorageError::MoveFile {
            from: artifact.to_path_buf(),
            to: destination.clone(),
            source: e,
        })?;

        if !destination.is_file() {
            return Err(StorageError::MissingAfterMove(destination));
        }
        Ok(destination)
    }

    /// Deterministic archive location for a batch.
    pub fn archive_path(&self, session_id: &str) -> PathBuf {
        self.archive_root
            .join(format!("{}{}{}", ARCHIVE_PREFIX, session_id, ARCHIVE_SUFFIX))
    }

    pub fn ensure_archive_root(&self) -> Result<(), StorageError> {
        ensure_directory(&self.archive_root)
    }
}

/// Scratch directory owned by one unit of work.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        remove_tree(&self.path);
    }
}
