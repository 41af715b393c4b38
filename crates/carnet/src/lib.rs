pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod queue;
pub mod registry;
pub mod render;
pub mod sanitize;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use app::{Carnet, SweepReport};
pub use config::{load_config, CarnetConfig};
pub use error::{CarnetError, ConfigError, RenderError, Result, StorageError};
pub use generation::{
    DriverSelection, GenerationError, GenerationRequest, GenerationState, GenerationStatus,
};
