use crate::settings::config::{ApiKey, ConfigError, SyncConfig};

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Errors raised by the configuration and credential stores
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Config parse error: {0}")]
	ParseError(#[from] serde_json::Error),

	#[error("Invalid configuration: {0}")]
	Invalid(#[from] ConfigError),

	#[error("Credential store {0} is read-only")]
	ReadOnly(&'static str),

	#[error("No API key configured")]
	MissingApiKey,

	#[error("No home directory available")]
	NoHomeDir,
}

/// Repository for the persisted configuration
#[async_trait::async_trait]
pub trait ConfigRepository: Send + Sync {
	/// Load the stored configuration, `None` when nothing has been saved yet.
	async fn load(&self) -> Result<Option<SyncConfig>, SettingsError>;
	async fn save(&self, config: &SyncConfig) -> Result<(), SettingsError>;
	/// Remove the stored configuration so defaults apply again.
	async fn reset(&self) -> Result<(), SettingsError>;
}

/// Repository for the API key
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
	async fn load(&self) -> Result<Option<ApiKey>, SettingsError>;
	async fn store(&self, key: &ApiKey) -> Result<(), SettingsError>;
	async fn delete(&self) -> Result<(), SettingsError>;

	/// Get the name of this store for logging.
	fn name(&self) -> &'static str;
}

/// JSON file implementation of ConfigRepository
pub struct FileConfigRepository {
	path: PathBuf,
}

impl FileConfigRepository {
	pub const DIR_NAME: &'static str = ".klaviyo_sync";
	pub const FILE_NAME: &'static str = "klaviyo_sync_config.json";

	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}

	/// `~/.klaviyo_sync/klaviyo_sync_config.json`
	pub fn default_location() -> Result<Self, SettingsError> {
		let home = dirs::home_dir().ok_or(SettingsError::NoHomeDir)?;
		Ok(Self::new(home.join(Self::DIR_NAME).join(Self::FILE_NAME)))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

/// Field of the configuration file holding a persisted API key.
const API_KEY_FIELD: &str = "apiKey";

/// Read the configuration file as a JSON object, `None` when it does not exist.
async fn read_document(path: &Path) -> Result<Option<Map<String, Value>>, SettingsError> {
	if !tokio::fs::try_exists(path).await? {
		return Ok(None);
	}

	let content = tokio::fs::read_to_string(path).await?;
	Ok(Some(serde_json::from_str(&content)?))
}

async fn write_document(path: &Path, document: &Map<String, Value>) -> Result<(), SettingsError> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}

	tokio::fs::write(path, serde_json::to_string_pretty(document)?).await?;
	Ok(())
}

#[async_trait::async_trait]
impl ConfigRepository for FileConfigRepository {
	async fn load(&self) -> Result<Option<SyncConfig>, SettingsError> {
		if !tokio::fs::try_exists(&self.path).await? {
			info!("No configuration at {:?}, using defaults", self.path);
			return Ok(None);
		}

		let content = tokio::fs::read_to_string(&self.path).await?;
		let config: SyncConfig = serde_json::from_str(&content)?;

		info!("Loaded configuration from {:?}", self.path);
		Ok(Some(config))
	}

	/// Overwrite the settings, keeping a persisted API key.
	async fn save(&self, config: &SyncConfig) -> Result<(), SettingsError> {
		let mut document = match serde_json::to_value(config)? {
			Value::Object(document) => document,
			_ => Map::new(),
		};
		let stored_key = read_document(&self.path)
			.await?
			.and_then(|mut existing| existing.remove(API_KEY_FIELD));
		if let Some(key) = stored_key {
			document.insert(API_KEY_FIELD.to_string(), key);
		}

		write_document(&self.path, &document).await?;

		info!("Saved configuration to {:?}", self.path);
		Ok(())
	}

	/// Remove the file, persisted API key included.
	async fn reset(&self) -> Result<(), SettingsError> {
		match tokio::fs::remove_file(&self.path).await {
			Ok(()) => {
				info!("Removed configuration at {:?}", self.path);
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// Read-only store backed by an environment variable
pub struct EnvCredentialStore {
	var: String,
}

impl EnvCredentialStore {
	pub const DEFAULT_VAR: &'static str = "KLAVIYO_API_KEY";

	pub fn new(var: impl Into<String>) -> Self {
		Self { var: var.into() }
	}
}

impl Default for EnvCredentialStore {
	fn default() -> Self {
		Self::new(Self::DEFAULT_VAR)
	}
}

#[async_trait::async_trait]
impl CredentialStore for EnvCredentialStore {
	async fn load(&self) -> Result<Option<ApiKey>, SettingsError> {
		match std::env::var(&self.var) {
			Ok(raw) if !raw.trim().is_empty() => Ok(Some(ApiKey::new(&raw)?)),
			_ => Ok(None),
		}
	}

	async fn store(&self, _key: &ApiKey) -> Result<(), SettingsError> {
		Err(SettingsError::ReadOnly(self.name()))
	}

	async fn delete(&self) -> Result<(), SettingsError> {
		Err(SettingsError::ReadOnly(self.name()))
	}

	fn name(&self) -> &'static str {
		"environment"
	}
}

/// Persistent store keeping the key in the configuration file
pub struct FileCredentialStore {
	path: PathBuf,
}

impl FileCredentialStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
	async fn load(&self) -> Result<Option<ApiKey>, SettingsError> {
		let Some(document) = read_document(&self.path).await? else {
			return Ok(None);
		};

		match document.get(API_KEY_FIELD).and_then(Value::as_str) {
			Some(raw) if !raw.trim().is_empty() => Ok(Some(ApiKey::new(raw)?)),
			_ => Ok(None),
		}
	}

	async fn store(&self, key: &ApiKey) -> Result<(), SettingsError> {
		let mut document = read_document(&self.path).await?.unwrap_or_default();
		document.insert(
			API_KEY_FIELD.to_string(),
			Value::String(key.expose().to_string()),
		);
		write_document(&self.path, &document).await?;

		info!("API key {} saved to {:?}", key, self.path);
		Ok(())
	}

	async fn delete(&self) -> Result<(), SettingsError> {
		let Some(mut document) = read_document(&self.path).await? else {
			return Ok(());
		};

		if document.remove(API_KEY_FIELD).is_some() {
			write_document(&self.path, &document).await?;
			info!("API key removed from {:?}", self.path);
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"file"
	}
}

/// Session-only store; the key is gone when the process exits
#[derive(Default)]
pub struct MemoryCredentialStore {
	key: RwLock<Option<ApiKey>>,
}

impl MemoryCredentialStore {
	pub fn with_key(key: ApiKey) -> Self {
		Self {
			key: RwLock::new(Some(key)),
		}
	}
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
	async fn load(&self) -> Result<Option<ApiKey>, SettingsError> {
		Ok(self.key.read().await.clone())
	}

	async fn store(&self, key: &ApiKey) -> Result<(), SettingsError> {
		*self.key.write().await = Some(key.clone());
		info!("API key set for this session only");
		Ok(())
	}

	async fn delete(&self) -> Result<(), SettingsError> {
		*self.key.write().await = None;
		Ok(())
	}

	fn name(&self) -> &'static str {
		"session"
	}
}

/// Ordered list of stores; the first one holding a key wins
///
/// When no store holds a key, the first store failure is returned instead of `None`.
pub struct CredentialChain {
	stores: Vec<Box<dyn CredentialStore>>,
}

impl CredentialChain {
	pub fn new(stores: Vec<Box<dyn CredentialStore>>) -> Self {
		Self { stores }
	}
}

#[async_trait::async_trait]
impl CredentialStore for CredentialChain {
	async fn load(&self) -> Result<Option<ApiKey>, SettingsError> {
		let mut failure = None;

		for store in &self.stores {
			match store.load().await {
				Ok(Some(key)) => {
					info!("Using API key {} from {} store", key, store.name());
					return Ok(Some(key));
				}
				Ok(None) => {}
				Err(e) => {
					warn!("Credential store {} failed, trying next: {}", store.name(), e);
					if failure.is_none() {
						failure = Some(e);
					}
				}
			}
		}

		match failure {
			Some(e) => Err(e),
			None => Ok(None),
		}
	}

	/// Store in the first writable store.
	async fn store(&self, key: &ApiKey) -> Result<(), SettingsError> {
		for store in &self.stores {
			match store.store(key).await {
				Ok(()) => return Ok(()),
				Err(SettingsError::ReadOnly(_)) => continue,
				Err(e) => return Err(e),
			}
		}
		Err(SettingsError::ReadOnly(self.name()))
	}

	/// Delete from every writable store.
	async fn delete(&self) -> Result<(), SettingsError> {
		for store in &self.stores {
			match store.delete().await {
				Ok(()) | Err(SettingsError::ReadOnly(_)) => {}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"chain"
	}
}
