use super::{apply_entry, ChangeFeed, FeedContext};
use crate::{EntityCache, EventBroadcaster, MutationLog, SyncConfig};

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Applies stage changes other sessions write to the shared mutation log, as soon as the
/// storage medium reports them. Mediums without notifications leave this feed idle, the
/// polling feed's refresh tick covers them.
pub struct CrossTabListener {
	cache: Arc<EntityCache>,
	broadcaster: Arc<EventBroadcaster>,
	log: Arc<MutationLog>,
	bus_window: Duration,
}

impl fmt::Debug for CrossTabListener {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CrossTabListener")
			.field("log", &self.log)
			.field("bus_window", &self.bus_window)
			.finish_non_exhaustive()
	}
}

impl CrossTabListener {
	pub fn new(
		cache: Arc<EntityCache>,
		broadcaster: Arc<EventBroadcaster>,
		log: Arc<MutationLog>,
	) -> Self {
		Self {
			cache,
			broadcaster,
			log,
			bus_window: SyncConfig::default().bus_window(),
		}
	}

	#[must_use]
	pub fn with_window(mut self, bus_window: Duration) -> Self {
		self.bus_window = bus_window;
		self
	}

	/// Applies every recent entry newer than what the cache holds, returns how many changed it.
	pub fn catch_up(&self) -> usize {
		self.log
			.recent(self.bus_window)
			.iter()
			.filter(|entry| apply_entry(&self.cache, &self.broadcaster, entry).is_some())
			.count()
	}
}

#[async_trait]
impl ChangeFeed for CrossTabListener {
	fn name(&self) -> &'static str {
		"cross_tab"
	}

	async fn run(&mut self, ctx: FeedContext) {
		let FeedContext { stop, mounted } = ctx;

		let Some(mut changes) = self.log.changes() else {
			debug!("Storage medium has no change notifications, relying on polling");
			stop.wait().await;
			return;
		};

		loop {
			tokio::select! {
				() = stop.wait() => break,
				change = changes.recv() => match change {
					Ok(change) if self.log.is_foreign_change(&change) => {
						if mounted.is_mounted() {
							let applied = self.catch_up();
							debug!(applied, ?change.origin, "Caught up with another session");
						}
					}
					Ok(_) => {}
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "Missed storage notifications, catching up");
						if mounted.is_mounted() {
							self.catch_up();
						}
					}
					Err(RecvError::Closed) => {
						debug!("Storage notifications closed, relying on polling");
						stop.wait().await;
						break;
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		mutation_log::MemoryStorage, FeedHandle, LeadEventKind, LeadPatch, MountedFlag, StageId,
	};

	use tokio::time::timeout;

	#[tokio::test]
	async fn applies_entries_written_by_another_log() {
		let storage = Arc::new(MemoryStorage::default());
		let writer = MutationLog::new(storage.clone(), "updates", 50);

		let cache = Arc::new(EntityCache::default());
		cache.update("L1", LeadPatch::stage(StageId::New).with_name("Ana"));
		let broadcaster = Arc::new(EventBroadcaster::default());
		let mut events = broadcaster.stream();

		let listener = CrossTabListener::new(
			Arc::clone(&cache),
			Arc::clone(&broadcaster),
			Arc::new(MutationLog::new(storage, "updates", 50)),
		);
		let handle = FeedHandle::spawn(Box::new(listener), MountedFlag::new(true));

		// let the listener subscribe before writing
		tokio::task::yield_now().await;
		tokio::time::sleep(Duration::from_millis(20)).await;

		writer.record("L1", StageId::Confirmed);

		let event = timeout(Duration::from_secs(5), events.recv())
			.await
			.expect("event in time")
			.expect("event");
		assert_eq!(event.kind, LeadEventKind::Update);
		assert_eq!(event.lead_id, "L1");
		assert_eq!(cache.get("L1").map(|r| r.stage), Some(StageId::Confirmed));

		handle.stop().await;
	}

	#[test]
	fn catch_up_skips_what_the_cache_already_has() {
		let storage = Arc::new(MemoryStorage::default());
		let log = Arc::new(MutationLog::new(storage, "updates", 50));
		let cache = Arc::new(EntityCache::default());

		log.record("L1", StageId::Prospecting);
		std::thread::sleep(Duration::from_millis(2));
		cache.update("L1", LeadPatch::stage(StageId::Opportunity));

		let listener =
			CrossTabListener::new(Arc::clone(&cache), Arc::default(), Arc::clone(&log));

		assert_eq!(listener.catch_up(), 0);
		assert_eq!(cache.get("L1").map(|r| r.stage), Some(StageId::Opportunity));
	}
}
