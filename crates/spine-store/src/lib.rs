//! Filesystem and SQLite side of the spine: event-log loading, TOML config,
//! the producer emission shim and persisted UWSM profiles.

pub mod config;
pub mod emit;
pub mod error;
pub mod eventlog;
pub mod profile;
pub mod schema;

pub use config::{load_config, resolve_config};
pub use emit::{EmissionConfig, EmitSink, Emitter};
pub use error::{Result, StoreError};
pub use eventlog::{LoadedFile, load_all, load_file, resolve_inputs};
pub use profile::{ProfileStore, StoredProfile, default_base_dir, default_db_path};
