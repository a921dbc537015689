use super::{LogStorage, StorageChange};
use crate::StorageError;

use std::{
	collections::HashMap,
	sync::{Mutex, PoisonError},
};

use tokio::sync::broadcast;
use uuid::Uuid;

/// In process medium. Share one `Arc<MemoryStorage>` between sessions and each of them gets
/// the change notifications of the others.
#[derive(Debug)]
pub struct MemoryStorage {
	values: Mutex<HashMap<String, String>>,
	changes: broadcast::Sender<StorageChange>,
}

impl MemoryStorage {
	#[must_use]
	pub fn new(notification_capacity: usize) -> Self {
		let (changes, _) = broadcast::channel(notification_capacity.max(1));
		Self {
			values: Mutex::default(),
			changes,
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new(64)
	}
}

impl LogStorage for MemoryStorage {
	fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
		Ok(self
			.values
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(key)
			.cloned())
	}

	fn write(&self, key: &str, value: &str, origin: Uuid) -> Result<(), StorageError> {
		let changed = self
			.values
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key.to_string(), value.to_string())
			.map_or(true, |previous| previous != value);

		if changed {
			// Ignore send errors (no watchers)
			let _ = self.changes.send(StorageChange {
				key: key.to_string(),
				origin: Some(origin),
			});
		}

		Ok(())
	}

	fn watch(&self) -> Option<broadcast::Receiver<StorageChange>> {
		Some(self.changes.subscribe())
	}
}
