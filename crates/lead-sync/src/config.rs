//! Session configuration

use crate::{
	mutation_log::{DEFAULT_CAPACITY, DEFAULT_STORAGE_KEY},
	Error,
};

use lf_utils::error::IoResultExt;

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Forced refresh tick, replays recent mutation log entries into the cache
	pub refresh_interval_ms: u64,

	/// Full resync tick against the store
	pub resync_interval_ms: u64,

	/// Mutation log capacity, oldest entries are evicted first
	pub bus_capacity: usize,

	/// Max age of mutation log entries still worth applying
	pub bus_window_ms: u64,

	/// Key of the mutation log inside the storage medium
	pub storage_key: String,

	/// Prefixes stripped from lead ids before they reach the cache
	pub transport_prefixes: Vec<String>,

	/// Capacity of the async event stream
	pub broadcast_capacity: usize,

	pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
	pub base_url: String,
	pub timeout_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			base_url: "http://localhost:3000/api".to_string(),
			timeout_ms: 10_000,
			token: None,
		}
	}
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			refresh_interval_ms: 5_000,
			resync_interval_ms: 30_000,
			bus_capacity: DEFAULT_CAPACITY,
			bus_window_ms: 60_000,
			storage_key: DEFAULT_STORAGE_KEY.to_string(),
			transport_prefixes: vec!["lead_".to_string(), "lead:".to_string()],
			broadcast_capacity: 256,
			store: StoreConfig::default(),
		}
	}
}

impl SyncConfig {
	/// Loads `path`, or writes the defaults there when it doesn't exist yet.
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();

		if path.exists() {
			info!("Loading sync config from {}", path.display());
			let json = fs::read_to_string(path).at_path("reading sync config", path)?;
			let config: Self = serde_json::from_str(&json)?;
			config.validate()?;
			Ok(config)
		} else {
			warn!("No sync config found, creating default at {}", path.display());
			let config = Self::default();
			config.save(path)?;
			Ok(config)
		}
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
		let path = path.as_ref();

		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).at_path("creating config directory", parent)?;
		}

		fs::write(path, serde_json::to_string_pretty(self)?).at_path("writing sync config", path)?;

		Ok(())
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.refresh_interval_ms == 0 || self.resync_interval_ms == 0 {
			return Err(Error::Config("poll intervals must be greater than zero".to_string()));
		}

		if self.bus_capacity == 0 {
			return Err(Error::Config("bus capacity must be greater than zero".to_string()));
		}

		if self.storage_key.trim().is_empty() {
			return Err(Error::Config("storage key must not be empty".to_string()));
		}

		Ok(())
	}

	#[must_use]
	pub const fn refresh_interval(&self) -> Duration {
		Duration::from_millis(self.refresh_interval_ms)
	}

	#[must_use]
	pub const fn resync_interval(&self) -> Duration {
		Duration::from_millis(self.resync_interval_ms)
	}

	#[must_use]
	pub const fn bus_window(&self) -> Duration {
		Duration::from_millis(self.bus_window_ms)
	}
}
