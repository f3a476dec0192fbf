//! Settings service for the sync tool.
//!
//! This module provides the `SettingsService`, which resolves the configuration snapshot and the
//! API key a run needs. A session key set for this process wins; otherwise the credential store
//! is asked, which for the default setup checks the environment and then the configuration file.

use crate::settings::config::{ApiKey, SyncConfig};
use crate::settings::repositories::{
    ConfigRepository, CredentialChain, CredentialStore, EnvCredentialStore, FileConfigRepository,
    FileCredentialStore, MemoryCredentialStore, SettingsError,
};

use std::path::PathBuf;
use tracing::info;

/// Service for loading and storing settings.
pub struct SettingsService {
    config_repo: Box<dyn ConfigRepository>,
    session: MemoryCredentialStore,
    /// Persistent credentials, consulted after the session key.
    credentials: Box<dyn CredentialStore>,
}

impl SettingsService {
    pub fn new(config_repo: Box<dyn ConfigRepository>, credentials: Box<dyn CredentialStore>) -> Self {
        Self {
            config_repo,
            session: MemoryCredentialStore::default(),
            credentials,
        }
    }

    /// Settings stored in `config_file`, with the API key resolved as
    /// session > environment > configuration file.
    pub fn for_file(config_file: FileConfigRepository) -> Self {
        let credentials = CredentialChain::new(vec![
            Box::new(EnvCredentialStore::default()),
            Box::new(FileCredentialStore::new(config_file.path())),
        ]);

        Self::new(Box::new(config_file), Box::new(credentials))
    }

    /// `for_file` at `config_path`, or at the default `~/.klaviyo_sync` location.
    pub fn with_defaults(config_path: Option<PathBuf>) -> Result<Self, SettingsError> {
        let config_file = match config_path {
            Some(path) => FileConfigRepository::new(path),
            None => FileConfigRepository::default_location()?,
        };
        Ok(Self::for_file(config_file))
    }

    /// Load the stored configuration, falling back to defaults.
    pub async fn load_config(&self) -> Result<SyncConfig, SettingsError> {
        Ok(self.config_repo.load().await?.unwrap_or_default())
    }

    /// Validate and persist a configuration.
    pub async fn save_config(&self, config: &SyncConfig) -> Result<(), SettingsError> {
        config.validate()?;
        self.config_repo.save(config).await
    }

    pub async fn reset_config(&self) -> Result<(), SettingsError> {
        self.config_repo.reset().await?;
        info!("Configuration reset to defaults");
        Ok(())
    }

    /// Resolve the API key, failing when no store holds one.
    ///
    /// A key that is present but malformed is reported as such rather than as missing.
    pub async fn api_key(&self) -> Result<ApiKey, SettingsError> {
        if let Some(key) = self.session.load().await? {
            return Ok(key);
        }

        self.credentials
            .load()
            .await?
            .ok_or(SettingsError::MissingApiKey)
    }

    /// Persist the key so later runs find it.
    pub async fn set_api_key(&self, key: &ApiKey) -> Result<(), SettingsError> {
        self.credentials.store(key).await
    }

    /// Use `key` for this process only.
    pub async fn set_session_api_key(&self, key: &ApiKey) -> Result<(), SettingsError> {
        self.session.store(key).await
    }

    /// Forget the session key and every persisted key.
    pub async fn clear_api_key(&self) -> Result<(), SettingsError> {
        self.session.delete().await?;
        self.credentials.delete().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::config::ConfigError;

    fn service(dir: &tempfile::TempDir) -> SettingsService {
        SettingsService::new(
            Box::new(FileConfigRepository::new(dir.path().join("config.json"))),
            Box::new(MemoryCredentialStore::default()),
        )
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");

        let config = service(&dir).load_config().await.expect("load");

        assert_eq!(config, SyncConfig::default());
    }

    #[tokio::test]
    async fn invalid_config_is_not_saved() {
        let dir = tempfile::tempdir().expect("temp dir");
        let service = service(&dir);

        let result = service.save_config(&SyncConfig::default()).await;

        assert!(matches!(
            result,
            Err(SettingsError::Invalid(ConfigError::MissingSegmentId))
        ));
        assert!(!dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn api_key_lifecycle() {
        let dir = tempfile::tempdir().expect("temp dir");
        let service = service(&dir);

        assert!(matches!(
            service.api_key().await,
            Err(SettingsError::MissingApiKey)
        ));

        let key = ApiKey::new("pk_session_key_123").expect("valid key");
        service.set_api_key(&key).await.expect("store");
        assert_eq!(service.api_key().await.expect("resolved"), key);

        service.clear_api_key().await.expect("delete");
        assert!(service.api_key().await.is_err());
    }

    #[tokio::test]
    async fn persisted_key_survives_a_new_service() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        let key = ApiKey::new("pk_persisted_key_1").expect("valid key");

        SettingsService::with_defaults(Some(path.clone()))
            .expect("service")
            .set_api_key(&key)
            .await
            .expect("store");

        let reopened = SettingsService::new(
            Box::new(FileConfigRepository::new(path.clone())),
            Box::new(FileCredentialStore::new(path.clone())),
        );
        assert_eq!(reopened.api_key().await.expect("resolved"), key);

        let config = SyncConfig {
            segment_id: "SEG".to_string(),
            ..SyncConfig::default()
        };
        reopened.save_config(&config).await.expect("save");
        assert_eq!(reopened.load_config().await.expect("load"), config);
        assert_eq!(reopened.api_key().await.expect("still stored"), key);

        reopened.clear_api_key().await.expect("delete");
        assert!(matches!(
            reopened.api_key().await,
            Err(SettingsError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn session_key_wins_over_persisted_key() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        let service = SettingsService::new(
            Box::new(FileConfigRepository::new(path.clone())),
            Box::new(FileCredentialStore::new(path)),
        );
        let persisted = ApiKey::new("pk_persisted_key_1").expect("valid key");
        let session = ApiKey::new("pk_session_key_12").expect("valid key");

        service.set_api_key(&persisted).await.expect("store");
        service.set_session_api_key(&session).await.expect("session");

        assert_eq!(service.api_key().await.expect("resolved"), session);
    }

    #[tokio::test]
    async fn malformed_stored_key_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "segmentId": "SEG", "apiKey": "pk_short" }"#).expect("write");
        let service = SettingsService::new(
            Box::new(FileConfigRepository::new(path.clone())),
            Box::new(CredentialChain::new(vec![
                Box::new(EnvCredentialStore::new("CHECKOUT_SNAPSHOT_SYNC_TEST_UNSET_KEY")),
                Box::new(FileCredentialStore::new(path)),
            ])),
        );

        assert!(matches!(
            service.api_key().await,
            Err(SettingsError::Invalid(ConfigError::InvalidApiKey))
        ));
    }
}
