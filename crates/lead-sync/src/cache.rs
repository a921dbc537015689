use crate::{observer::Observers, LeadPatch, LeadRecord, Subscription};

use lf_utils::{strip_any_prefix, time::strictly_after};

use std::{
	collections::HashMap,
	fmt,
	sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Entries {
	records: HashMap<String, LeadRecord>,
	/// Ids a caller used for a lead the store knows under another one.
	aliases: HashMap<String, String>,
	/// When a lead was removed; observations made before that are stale.
	tombstones: HashMap<String, DateTime<Utc>>,
}

impl Entries {
	fn key(&self, id: &str) -> String {
		self.aliases
			.get(id)
			.map_or_else(|| id.to_string(), Clone::clone)
	}

	fn write(&mut self, key: String, patch: LeadPatch) -> LeadRecord {
		let existing = self.records.get(&key);
		let at = strictly_after(existing.map(|r| r.updated_at), Utc::now());
		let record = patch.apply(&key, existing, at);

		self.tombstones.remove(&key);
		self.records.insert(key, record.clone());

		record
	}
}

/// What to do with an observed change for a lead the cache doesn't hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Missing {
	Create,
	Skip,
}

/// Session local map from normalized lead id to the last known [`LeadRecord`].
///
/// Every write bumps `updated_at` strictly past the previous value for that id and then
/// notifies subscribers synchronously with the final record. Ids registered with
/// [`EntityCache::alias`] share the record of the id they point to. The cache doesn't enforce
/// a single writer, the transition service and the feeds are just expected to be the only ones.
pub struct EntityCache {
	entries: RwLock<Entries>,
	observers: Observers<LeadRecord>,
	transport_prefixes: Vec<String>,
}

impl fmt::Debug for EntityCache {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EntityCache")
			.field("len", &self.len())
			.field("subscribers", &self.observers.len())
			.finish_non_exhaustive()
	}
}

impl Default for EntityCache {
	fn default() -> Self {
		Self::new(Vec::<String>::new())
	}
}

impl EntityCache {
	pub fn new(transport_prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			entries: RwLock::default(),
			observers: Observers::new("entity cache"),
			transport_prefixes: transport_prefixes.into_iter().map(Into::into).collect(),
		}
	}

	/// Strips whitespace and a known transport prefix.
	#[must_use]
	pub fn normalize<'id>(&self, id: &'id str) -> &'id str {
		strip_any_prefix(id.trim(), &self.transport_prefixes).trim()
	}

	#[must_use]
	pub fn get(&self, id: &str) -> Option<LeadRecord> {
		let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
		entries.records.get(&entries.key(self.normalize(id))).cloned()
	}

	/// Makes `alias_id` read and write the record of `persistent_id` from now on, dropping
	/// whatever was cached under the alias itself.
	pub fn alias(&self, alias_id: &str, persistent_id: &str) {
		let alias_id = self.normalize(alias_id);
		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		let target = entries.key(self.normalize(persistent_id));

		if alias_id.is_empty() || target == alias_id {
			return;
		}

		entries.records.remove(alias_id);
		entries.tombstones.remove(alias_id);
		// Ids aliased to this one follow it to the new target
		for existing in entries.aliases.values_mut() {
			if *existing == alias_id {
				existing.clone_from(&target);
			}
		}
		entries.aliases.insert(alias_id.to_string(), target.clone());

		debug!(alias = alias_id, persistent_id = %target, "Lead id aliased");
	}

	/// Merges `patch` into the record for `id`, creating it when absent, and notifies every
	/// subscriber with the resulting record.
	pub fn update(&self, id: &str, patch: LeadPatch) -> LeadRecord {
		let id = self.normalize(id);

		let record = {
			let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
			let key = entries.key(id);
			entries.write(key, patch)
		};

		trace!(id = %record.id, stage = %record.stage, "Cache record updated");
		self.observers.notify(&record);

		record
	}

	/// Applies a change observed remotely at `observed_at`, creating the record when absent.
	/// Last write wins: it is skipped when the cached record was written after the
	/// observation, when the lead was removed after it, or when it would change nothing.
	pub fn merge_observed(
		&self,
		id: &str,
		patch: LeadPatch,
		observed_at: DateTime<Utc>,
	) -> Option<LeadRecord> {
		self.merge(id, patch, observed_at, Missing::Create)
	}

	/// Like [`EntityCache::merge_observed`] but only for leads already cached, for changes
	/// that carry too little to build a record from.
	pub fn merge_known(
		&self,
		id: &str,
		patch: LeadPatch,
		observed_at: DateTime<Utc>,
	) -> Option<LeadRecord> {
		self.merge(id, patch, observed_at, Missing::Skip)
	}

	fn merge(
		&self,
		id: &str,
		patch: LeadPatch,
		observed_at: DateTime<Utc>,
		missing: Missing,
	) -> Option<LeadRecord> {
		let record = {
			let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
			let key = entries.key(self.normalize(id));

			match entries.records.get(&key) {
				Some(current) if current.updated_at > observed_at => {
					debug!(id = %key, "Skipping observed change older than the cached record");
					return None;
				}
				Some(current) if patch.is_noop_for(current) => return None,
				Some(_) => {}
				None if missing == Missing::Skip => {
					debug!(id = %key, "Skipping observed change for a lead not in the cache");
					return None;
				}
				None => {
					if entries
						.tombstones
						.get(&key)
						.is_some_and(|removed_at| *removed_at >= observed_at)
					{
						debug!(id = %key, "Skipping observed change older than the lead's removal");
						return None;
					}
				}
			}

			entries.write(key, patch)
		};

		trace!(id = %record.id, stage = %record.stage, "Cache record merged");
		self.observers.notify(&record);

		Some(record)
	}

	/// Drops the record, no subscriber is notified; deletions travel as broadcaster events.
	pub fn remove(&self, id: &str) -> Option<LeadRecord> {
		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		let key = entries.key(self.normalize(id));

		let removed = entries.records.remove(&key)?;
		entries.tombstones.insert(key, Utc::now());

		Some(removed)
	}

	#[must_use]
	pub fn snapshot(&self) -> Vec<LeadRecord> {
		let mut records = self
			.entries
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.records
			.values()
			.cloned()
			.collect::<Vec<_>>();
		records.sort_by(|a, b| a.id.cmp(&b.id));
		records
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.records
			.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Registers `callback` for every write, called with the normalized id and full record.
	pub fn subscribe(
		&self,
		callback: impl Fn(&str, &LeadRecord) + Send + Sync + 'static,
	) -> Subscription {
		self.observers
			.subscribe(move |record: &LeadRecord| callback(&record.id, record))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::StageId;

	use std::sync::{Arc, Mutex};

	use tracing_test::traced_test;

	fn cache() -> EntityCache {
		EntityCache::new(["lead_", "lead:"])
	}

	#[test]
	fn lookups_ignore_transport_prefix() {
		let cache = cache();
		cache.update("lead_L1", LeadPatch::stage(StageId::New).with_name("Jane"));

		assert_eq!(cache.get("L1").map(|r| r.name), Some("Jane".to_string()));
		assert_eq!(cache.get("lead:L1").map(|r| r.id), Some("L1".to_string()));
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn updated_at_strictly_increases() {
		let cache = cache();
		let mut last = cache.update("L1", LeadPatch::stage(StageId::New)).updated_at;

		for _ in 0..100 {
			let next = cache
				.update("L1", LeadPatch::stage(StageId::Prospecting))
				.updated_at;
			assert!(next > last);
			last = next;
		}
	}

	#[test]
	#[traced_test]
	fn subscribers_see_the_same_record_and_survive_a_panicking_peer() {
		let cache = cache();
		let seen = Arc::new(Mutex::new(Vec::new()));

		let _a = cache.subscribe({
			let seen = Arc::clone(&seen);
			move |id, record| seen.lock().expect("lock").push((id.to_string(), record.clone()))
		});
		let _b = cache.subscribe(|_, _| panic!("broken surface"));
		let _c = cache.subscribe({
			let seen = Arc::clone(&seen);
			move |id, record| seen.lock().expect("lock").push((id.to_string(), record.clone()))
		});

		let record = cache.update("lead_L9", LeadPatch::stage(StageId::Opportunity));

		let seen = seen.lock().expect("lock");
		assert_eq!(seen.len(), 2);
		assert!(seen.iter().all(|(id, r)| id == "L9" && *r == record));
	}

	#[test]
	fn merge_observed_is_last_write_wins() {
		let cache = cache();
		let before_fetch = Utc::now() - chrono::Duration::milliseconds(1);
		cache.update("L1", LeadPatch::stage(StageId::Confirmed));

		// fetch started before the local write, its view is stale
		assert!(cache
			.merge_observed("L1", LeadPatch::stage(StageId::New), before_fetch)
			.is_none());
		assert_eq!(cache.get("L1").map(|r| r.stage), Some(StageId::Confirmed));

		let merged = cache.merge_observed("L1", LeadPatch::stage(StageId::Closed), Utc::now());
		assert_eq!(merged.map(|r| r.stage), Some(StageId::Closed));

		// identical projection does not touch the record
		assert!(cache
			.merge_observed("L1", LeadPatch::stage(StageId::Closed), Utc::now())
			.is_none());
	}

	#[test]
	fn remove_and_snapshot() {
		let cache = cache();
		cache.update("B", LeadPatch::stage(StageId::New));
		cache.update("A", LeadPatch::stage(StageId::New));

		assert_eq!(
			cache.snapshot().into_iter().map(|r| r.id).collect::<Vec<_>>(),
			vec!["A", "B"]
		);
		assert!(cache.remove("lead_A").is_some());
		assert!(cache.get("A").is_none());
		assert!(!cache.is_empty());
	}

	#[test]
	fn aliases_share_the_persistent_record() {
		let cache = cache();
		cache.update("chat-42", LeadPatch::stage(StageId::New).with_name("Jane"));
		cache.update("P1", LeadPatch::stage(StageId::Confirmed).with_name("Jane Doe"));

		cache.alias("lead_chat-42", "P1");
		assert_eq!(cache.len(), 1);
		assert_eq!(cache.get("chat-42").map(|r| r.id), Some("P1".to_string()));

		// writes through either id land on the same record
		cache.merge_observed("P1", LeadPatch::stage(StageId::Opportunity), Utc::now());
		assert_eq!(cache.get("chat-42").map(|r| r.stage), Some(StageId::Opportunity));
		cache.update("chat-42", LeadPatch::stage(StageId::Closed));
		assert_eq!(cache.get("P1").map(|r| r.stage), Some(StageId::Closed));

		// chained aliases collapse onto the final id
		cache.alias("P1", "P2");
		cache.update("P2", LeadPatch::stage(StageId::New));
		assert_eq!(cache.get("chat-42").map(|r| r.id), Some("P2".to_string()));

		assert!(cache.remove("chat-42").is_some());
		assert!(cache.get("P2").is_none());
	}

	#[test]
	fn removed_leads_ignore_older_observations() {
		let cache = cache();
		let fetch_started = Utc::now();
		cache.update("L1", LeadPatch::stage(StageId::Confirmed));
		assert!(cache.remove("L1").is_some());

		assert!(cache
			.merge_observed("L1", LeadPatch::stage(StageId::Confirmed), fetch_started)
			.is_none());
		assert!(cache.get("L1").is_none());

		// reopened after the removal
		let reopened = cache.merge_observed(
			"L1",
			LeadPatch::stage(StageId::New),
			Utc::now() + chrono::Duration::milliseconds(1),
		);
		assert_eq!(reopened.map(|r| r.stage), Some(StageId::New));
	}

	#[test]
	fn merge_known_never_creates() {
		let cache = cache();
		assert!(cache
			.merge_known("L1", LeadPatch::stage(StageId::Closed), Utc::now())
			.is_none());
		assert!(cache.is_empty());

		cache.update("L1", LeadPatch::stage(StageId::New).with_name("Ana"));
		let merged = cache.merge_known(
			"L1",
			LeadPatch::stage(StageId::Prospecting),
			Utc::now() + chrono::Duration::milliseconds(1),
		);
		assert_eq!(
			merged.map(|r| (r.name, r.stage)),
			Some(("Ana".to_string(), StageId::Prospecting))
		);
	}

	#[test]
	fn racing_merges_never_overwrite_newer_writes() {
		let cache = cache();

		for _ in 0..200 {
			cache.update("L1", LeadPatch::stage(StageId::New));
			let observed_at = Utc::now();

			let (local, _) = std::thread::scope(|s| {
				let local = s.spawn(|| cache.update("L1", LeadPatch::stage(StageId::Confirmed)));
				let merged = s.spawn(|| {
					cache.merge_observed("L1", LeadPatch::stage(StageId::Opportunity), observed_at)
				});
				(
					local.join().expect("local write"),
					merged.join().expect("merge"),
				)
			});

			// a write made after the observation must survive it
			if local.updated_at > observed_at {
				assert_eq!(cache.get("L1"), Some(local));
			}
		}
	}
}
