pub mod executor;
pub mod pool;

pub use executor::{TaskExecutor, TaskReport};
pub use pool::{PoolSettings, Reaper, WorkerPool};
