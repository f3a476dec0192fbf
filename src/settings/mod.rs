//! Settings for the sync tool
//!
//! The configuration snapshot a run is started with, the API key wrapper, and the store
//! contracts used to persist them.

mod config;
mod repositories;
mod service;

pub use config::{ApiKey, ConfigError, SyncConfig};
pub use repositories::{
    ConfigRepository, CredentialChain, CredentialStore, EnvCredentialStore, FileConfigRepository,
    FileCredentialStore, MemoryCredentialStore, SettingsError,
};
pub use service::SettingsService;
