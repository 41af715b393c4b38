pub mod artifacts;

pub use artifacts::{ArtifactStore, WorkDir, ARCHIVE_PREFIX, ARCHIVE_SUFFIX};
