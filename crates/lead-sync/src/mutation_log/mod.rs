//! Bounded log of recent stage changes kept in a storage medium shared between sessions.
//!
//! Other sessions learn about a change either from the medium's change notifications or by
//! polling [`MutationLog::recent`]. Reading prunes: whatever is older than the requested age
//! is dropped from the medium, so a slow reader can miss entries a faster one already pruned.
//! Nothing here is allowed to fail a caller, a broken medium only delays propagation.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::{StageId, StorageError};

use lf_utils::time::{age_millis, now_millis};

use std::{
	fmt,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 50;
pub const DEFAULT_STORAGE_KEY: &str = "lead_stage_updates";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationLogEntry {
	pub lead_id: String,
	pub new_stage: StageId,
	/// Milliseconds since the unix epoch.
	pub timestamp: i64,
}

/// Notification that the value under `key` changed. `origin` is the writing
/// [`MutationLog`] when the medium knows it, mediums that can't tell report `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
	pub key: String,
	pub origin: Option<Uuid>,
}

/// A key/value medium shared by every session that should see each other's changes.
pub trait LogStorage: Send + Sync + fmt::Debug {
	fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

	fn write(&self, key: &str, value: &str, origin: Uuid) -> Result<(), StorageError>;

	/// Change notifications, if the medium has any.
	fn watch(&self) -> Option<broadcast::Receiver<StorageChange>> {
		None
	}
}

pub struct MutationLog {
	storage: Arc<dyn LogStorage>,
	key: String,
	capacity: usize,
	origin: Uuid,
	// serializes read-modify-write cycles issued through this handle
	write_lock: Mutex<()>,
}

impl fmt::Debug for MutationLog {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MutationLog")
			.field("storage", &self.storage)
			.field("key", &self.key)
			.field("capacity", &self.capacity)
			.field("origin", &self.origin)
			.finish_non_exhaustive()
	}
}

impl MutationLog {
	pub fn new(storage: Arc<dyn LogStorage>, key: impl Into<String>, capacity: usize) -> Self {
		Self {
			storage,
			key: key.into(),
			capacity: capacity.max(1),
			origin: Uuid::new_v4(),
			write_lock: Mutex::new(()),
		}
	}

	/// Identifies the writes of this handle in [`StorageChange::origin`].
	#[must_use]
	pub const fn origin(&self) -> Uuid {
		self.origin
	}

	#[must_use]
	pub fn key(&self) -> &str {
		&self.key
	}

	#[must_use]
	pub const fn capacity(&self) -> usize {
		self.capacity
	}

	/// Appends a stage change, logging and swallowing any storage failure.
	pub fn record(&self, lead_id: &str, new_stage: StageId) {
		if let Err(e) = self.try_record(lead_id, new_stage) {
			warn!(%lead_id, %new_stage, ?e, "Failed to record stage change, cross session sync degraded");
		}
	}

	#[instrument(skip(self), fields(key = %self.key), err)]
	pub fn try_record(
		&self,
		lead_id: &str,
		new_stage: StageId,
	) -> Result<MutationLogEntry, StorageError> {
		let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

		let mut entries = self.load()?;
		let entry = MutationLogEntry {
			lead_id: lead_id.to_string(),
			new_stage,
			timestamp: now_millis(),
		};
		entries.push(entry.clone());

		if entries.len() > self.capacity {
			let overflow = entries.len() - self.capacity;
			entries.drain(..overflow);
		}

		self.store(&entries)?;
		debug!(len = entries.len(), "Stage change recorded");

		Ok(entry)
	}

	/// Entries younger than `max_age`, oldest first; older ones are pruned from the medium.
	/// `Duration::MAX` returns everything. Failures degrade to an empty list.
	pub fn recent(&self, max_age: Duration) -> Vec<MutationLogEntry> {
		self.try_recent(max_age).unwrap_or_else(|e| {
			warn!(?e, "Failed to read mutation log, cross session sync degraded");
			Vec::new()
		})
	}

	pub fn try_recent(&self, max_age: Duration) -> Result<Vec<MutationLogEntry>, StorageError> {
		let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

		let entries = self.load()?;
		let total = entries.len();
		let now = now_millis();

		let recent = entries
			.into_iter()
			.filter(|entry| Duration::from_millis(age_millis(entry.timestamp, now)) < max_age)
			.collect::<Vec<_>>();

		// Only write back when something was pruned, so readers don't wake each other up
		if recent.len() != total {
			debug!(pruned = total - recent.len(), "Pruning stale mutation log entries");
			self.store(&recent)?;
		}

		Ok(recent)
	}

	/// Change notifications for this log's key caused by other writers.
	#[must_use]
	pub fn changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
		self.storage.watch()
	}

	/// Whether `change` concerns this log and wasn't written through this handle.
	#[must_use]
	pub fn is_foreign_change(&self, change: &StorageChange) -> bool {
		change.key == self.key && change.origin != Some(self.origin)
	}

	fn load(&self) -> Result<Vec<MutationLogEntry>, StorageError> {
		let Some(raw) = self.storage.read(&self.key)? else {
			return Ok(Vec::new());
		};

		// A corrupted value is replaced on the next write instead of wedging the log forever
		Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
			warn!(key = %self.key, ?e, "Discarding unreadable mutation log");
			Vec::new()
		}))
	}

	fn store(&self, entries: &[MutationLogEntry]) -> Result<(), StorageError> {
		self.storage
			.write(&self.key, &serde_json::to_string(entries)?, self.origin)
	}
}
