//! Shared plumbing for the inkwell crates: error types, configuration,
//! durable key-value storage and tracing setup.

pub mod config;
pub mod error;
pub mod store;
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use config::{Config, ConfigFile, Loader, Saver, WorkerSettings};
pub use error::{ConfigError, StoreError};
pub use store::{FileStore, KvStore, MemoryStore};
