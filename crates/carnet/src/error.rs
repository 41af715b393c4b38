use std::path::PathBuf;
use thiserror::Error;

pub use crate::db::DatabaseError;
pub use crate::generation::GenerationError;
pub use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum CarnetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Logging initialisation failed: {0}")]
    Telemetry(String),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Failed to serialize output: {0}")]
    Output(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File missing after move: {0}")]
    MissingAfterMove(PathBuf),

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive '{path}': {source}")]
    WriteArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive format error for '{path}': {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Malformed card template '{template}': {reason}")]
    MalformedTemplate { template: String, reason: String },

    #[error("Driver {driver_id} is missing asset '{asset}'")]
    MissingAsset { driver_id: i64, asset: String },

    #[error("Failed to build PDF: {0}")]
    Pdf(String),

    #[error("Failed to write card '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CarnetError>;
