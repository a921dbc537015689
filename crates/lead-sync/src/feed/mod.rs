//! Background sources of remote changes.
//!
//! A [`ChangeFeed`] runs as its own tokio task until its [`Stopper`] fires. The session keeps a
//! [`FeedHandle`] per feed; stopping one waits for the task to return and aborts it if it
//! takes too long. A push channel from the store would be just another feed.

mod polling;
mod storage_listener;

pub use polling::{PollingReconciler, ResyncReport};
pub use storage_listener::CrossTabListener;

use crate::{
	EntityCache, EventBroadcaster, EventOrigin, LeadEvent, LeadPatch, LeadRecord, MutationLogEntry,
};

use std::{
	fmt,
	panic::AssertUnwindSafe,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::{sync::Notify, task::JoinHandle, time::timeout};
use tracing::{debug, error, warn};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ChangeFeed: Send + 'static {
	fn name(&self) -> &'static str;

	/// Runs until `ctx.stop` fires. Results arriving after the session unmounted must be
	/// dropped, check `ctx.mounted` before touching shared state.
	async fn run(&mut self, ctx: FeedContext);
}

pub struct FeedContext {
	pub stop: Stopper,
	pub mounted: MountedFlag,
}

pub struct Stopper(chan::Receiver<()>);

impl Stopper {
	/// Resolves once the feed is asked to stop, or its handle is gone.
	pub async fn wait(&self) {
		if self.0.recv().await.is_err() {
			warn!("Stop channel closed, will stop feed");
		}
	}
}

/// Whether the owning session is still mounted, shared by every feed of that session.
#[derive(Debug, Clone, Default)]
pub struct MountedFlag(Arc<AtomicBool>);

impl MountedFlag {
	#[must_use]
	pub fn new(mounted: bool) -> Self {
		Self(Arc::new(AtomicBool::new(mounted)))
	}

	#[must_use]
	pub fn is_mounted(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}

	pub fn set(&self, mounted: bool) {
		self.0.store(mounted, Ordering::Release);
	}
}

/// Fired by the host when the user comes back to the session, the polling feed resyncs
/// right away instead of waiting for its next tick.
#[derive(Debug, Clone, Default)]
pub struct FocusSignal(Arc<Notify>);

impl FocusSignal {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// A focus fired while nobody is waiting is kept until the next wait, several of them
	/// collapse into one.
	pub fn notify(&self) {
		self.0.notify_one();
	}

	pub async fn notified(&self) {
		self.0.notified().await;
	}
}

pub struct FeedHandle {
	name: &'static str,
	stop_tx: chan::Sender<()>,
	handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for FeedHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FeedHandle")
			.field("name", &self.name)
			.field("running", &!self.is_finished())
			.finish()
	}
}

impl FeedHandle {
	#[must_use]
	pub fn spawn(mut feed: Box<dyn ChangeFeed>, mounted: MountedFlag) -> Self {
		let (stop_tx, stop_rx) = chan::bounded(1);
		let name = feed.name();

		let handle = tokio::spawn(async move {
			let ctx = FeedContext {
				stop: Stopper(stop_rx),
				mounted,
			};

			if AssertUnwindSafe(feed.run(ctx)).catch_unwind().await.is_err() {
				error!(feed = name, "Change feed unexpectedly panicked");
			}

			debug!(feed = name, "Change feed finished");
		});

		Self {
			name,
			stop_tx,
			handle: Some(handle),
		}
	}

	#[must_use]
	pub const fn name(&self) -> &'static str {
		self.name
	}

	#[must_use]
	pub fn is_finished(&self) -> bool {
		self.handle.as_ref().map_or(true, JoinHandle::is_finished)
	}

	/// Signals the feed and waits for it, aborting after a grace period.
	pub async fn stop(mut self) {
		if self.stop_tx.send(()).await.is_err() {
			debug!(feed = self.name, "Change feed already gone, checking its task");
		}

		let Some(handle) = self.handle.take() else {
			return;
		};
		let abort_handle = handle.abort_handle();

		match timeout(STOP_GRACE_PERIOD, handle).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => error!(feed = self.name, ?e, "Change feed task failed"),
			Err(_) => {
				error!(
					feed = self.name,
					"Change feed failed to gracefully stop in the allotted time, will force abortion"
				);
				abort_handle.abort();
			}
		}
	}
}

impl Drop for FeedHandle {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
	}
}

/// Merges one mutation log entry into `cache`, publishing an update when it changed a cached
/// lead.
pub(crate) fn apply_entry(
	cache: &EntityCache,
	broadcaster: &EventBroadcaster,
	entry: &MutationLogEntry,
) -> Option<LeadRecord> {
	// Entries only carry whole milliseconds, count each one as written at the end of its own
	let Some(observed_at) = DateTime::<Utc>::from_timestamp_millis(entry.timestamp.saturating_add(1))
	else {
		warn!(lead_id = %entry.lead_id, timestamp = entry.timestamp, "Mutation log entry with invalid timestamp");
		return None;
	};

	// Entries only carry a stage, leads not cached yet (or removed since) wait for a resync
	let record = cache.merge_known(&entry.lead_id, LeadPatch::stage(entry.new_stage), observed_at)?;

	debug!(lead_id = %record.id, stage = %record.stage, "Applied stage change from another session");
	broadcaster.publish(LeadEvent::updated(record.clone(), EventOrigin::CrossSession));

	Some(record)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::StageId;

	use std::sync::atomic::AtomicUsize;

	use lf_utils::time::now_millis;

	struct CountingFeed {
		ticks: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl ChangeFeed for CountingFeed {
		fn name(&self) -> &'static str {
			"counting"
		}

		async fn run(&mut self, ctx: FeedContext) {
			loop {
				tokio::select! {
					() = ctx.stop.wait() => break,
					() = tokio::time::sleep(Duration::from_millis(10)) => {
						self.ticks.fetch_add(1, Ordering::Relaxed);
					}
				}
			}
		}
	}

	struct StubbornFeed;

	#[async_trait]
	impl ChangeFeed for StubbornFeed {
		fn name(&self) -> &'static str {
			"stubborn"
		}

		async fn run(&mut self, _ctx: FeedContext) {
			futures::future::pending::<()>().await;
		}
	}

	#[tokio::test]
	async fn stop_waits_for_the_feed() {
		let ticks = Arc::new(AtomicUsize::new(0));
		let handle = FeedHandle::spawn(
			Box::new(CountingFeed {
				ticks: Arc::clone(&ticks),
			}),
			MountedFlag::new(true),
		);

		tokio::time::sleep(Duration::from_millis(50)).await;
		handle.stop().await;

		let after_stop = ticks.load(Ordering::Relaxed);
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
	}

	#[tokio::test(start_paused = true)]
	async fn stubborn_feeds_are_aborted() {
		let handle = FeedHandle::spawn(Box::new(StubbornFeed), MountedFlag::new(true));
		assert!(!handle.is_finished());

		// paused clock auto advances through the grace period
		handle.stop().await;
	}

	#[tokio::test]
	async fn focus_signals_are_not_lost() {
		let focus = FocusSignal::new();
		focus.notify();
		focus.notify();

		timeout(Duration::from_secs(1), focus.notified())
			.await
			.expect("stored permit");
	}

	#[test]
	fn entries_apply_once() {
		let cache = EntityCache::default();
		cache.update("L1", LeadPatch::stage(StageId::New).with_name("Ana"));
		let broadcaster = EventBroadcaster::default();
		let mut events = broadcaster.stream();

		let entry = MutationLogEntry {
			lead_id: "L1".into(),
			new_stage: StageId::Opportunity,
			timestamp: now_millis(),
		};

		assert!(apply_entry(&cache, &broadcaster, &entry).is_some());
		assert!(apply_entry(&cache, &broadcaster, &entry).is_none());

		let event = events.try_recv().expect("one event");
		assert_eq!(event.origin, EventOrigin::CrossSession);
		assert!(events.try_recv().is_err());
		assert_eq!(
			cache.get("L1").map(|r| (r.name, r.stage)),
			Some(("Ana".to_string(), StageId::Opportunity))
		);
	}

	#[test]
	fn entries_for_uncached_leads_wait_for_a_resync() {
		let cache = EntityCache::default();
		let broadcaster = EventBroadcaster::default();
		let mut events = broadcaster.stream();

		let entry = MutationLogEntry {
			lead_id: "L2".into(),
			new_stage: StageId::Qualification,
			timestamp: now_millis(),
		};

		assert!(apply_entry(&cache, &broadcaster, &entry).is_none());
		assert!(cache.get("L2").is_none());
		assert!(events.try_recv().is_err());
	}
}
