use crate::{
	ChangeFeed, CrossTabListener, EntityCache, Error, EventBroadcaster, FeedHandle, FocusSignal,
	LeadRecord, LeadStore, LogStorage, MountedFlag, MutationLog, PollingReconciler, ResyncReport,
	StageId, StageMigration, StageTransitionService, SyncConfig, TenantId, TransitionFields,
	TransitionOutcome,
};

use std::{fmt, sync::Arc};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Everything one session (a board, a chat panel, an agent process) needs to stay in sync,
/// built once and passed around instead of living in globals.
///
/// Nothing runs in the background until [`mount`](Self::mount); [`shutdown`](Self::shutdown)
/// stops every feed again and makes late results from in flight fetches get dropped.
pub struct LeadSyncSession {
	config: SyncConfig,
	tenant: TenantId,
	store: Arc<dyn LeadStore>,
	cache: Arc<EntityCache>,
	broadcaster: Arc<EventBroadcaster>,
	log: Arc<MutationLog>,
	transitions: StageTransitionService,
	focus: FocusSignal,
	mounted: MountedFlag,
	feeds: Mutex<Vec<FeedHandle>>,
}

impl fmt::Debug for LeadSyncSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LeadSyncSession")
			.field("tenant", &self.tenant)
			.field("mounted", &self.mounted.is_mounted())
			.field("cache", &self.cache)
			.field("log", &self.log)
			.finish_non_exhaustive()
	}
}

impl LeadSyncSession {
	pub fn new(
		config: SyncConfig,
		tenant: TenantId,
		store: Arc<dyn LeadStore>,
		storage: Arc<dyn LogStorage>,
	) -> Result<Self, Error> {
		config.validate()?;

		let cache = Arc::new(EntityCache::new(config.transport_prefixes.iter().cloned()));
		let broadcaster = Arc::new(EventBroadcaster::new(config.broadcast_capacity));
		let log = Arc::new(MutationLog::new(
			storage,
			config.storage_key.clone(),
			config.bus_capacity,
		));

		let transitions = StageTransitionService::new(
			tenant.clone(),
			Arc::clone(&store),
			Arc::clone(&cache),
			Arc::clone(&broadcaster),
			Arc::clone(&log),
		);

		Ok(Self {
			config,
			tenant,
			store,
			cache,
			broadcaster,
			log,
			transitions,
			focus: FocusSignal::new(),
			mounted: MountedFlag::new(false),
			feeds: Mutex::default(),
		})
	}

	#[must_use]
	pub const fn config(&self) -> &SyncConfig {
		&self.config
	}

	#[must_use]
	pub const fn tenant(&self) -> &TenantId {
		&self.tenant
	}

	#[must_use]
	pub const fn cache(&self) -> &Arc<EntityCache> {
		&self.cache
	}

	#[must_use]
	pub const fn broadcaster(&self) -> &Arc<EventBroadcaster> {
		&self.broadcaster
	}

	#[must_use]
	pub const fn log(&self) -> &Arc<MutationLog> {
		&self.log
	}

	#[must_use]
	pub const fn transitions(&self) -> &StageTransitionService {
		&self.transitions
	}

	#[must_use]
	pub fn get(&self, lead_id: &str) -> Option<LeadRecord> {
		self.cache.get(lead_id)
	}

	pub async fn transition(
		&self,
		lead_id: &str,
		new_stage: &str,
		fields: Option<&TransitionFields>,
	) -> Result<TransitionOutcome, Error> {
		self.transitions.transition(lead_id, new_stage, fields).await
	}

	pub async fn transition_to(
		&self,
		lead_id: &str,
		stage: StageId,
		fields: Option<&TransitionFields>,
	) -> Result<TransitionOutcome, Error> {
		self.transitions.transition_to(lead_id, stage, fields).await
	}

	pub async fn apply_stage_hint(
		&self,
		lead_id: &str,
		hint: &str,
		fields: Option<&TransitionFields>,
	) -> Result<Option<TransitionOutcome>, Error> {
		self.transitions.apply_stage_hint(lead_id, hint, fields).await
	}

	#[must_use]
	pub fn is_mounted(&self) -> bool {
		self.mounted.is_mounted()
	}

	/// Starts the polling and cross session feeds. Mounting twice is a no-op.
	#[instrument(skip(self), fields(tenant = %self.tenant))]
	pub async fn mount(&self) {
		let mut feeds = self.feeds.lock().await;

		if self.mounted.is_mounted() {
			warn!("Session already mounted");
			return;
		}
		self.mounted.set(true);

		let polling = self.poller().with_focus(self.focus.clone());
		let cross_tab = CrossTabListener::new(
			Arc::clone(&self.cache),
			Arc::clone(&self.broadcaster),
			Arc::clone(&self.log),
		)
		.with_window(self.config.bus_window());

		feeds.push(FeedHandle::spawn(Box::new(polling), self.mounted.clone()));
		feeds.push(FeedHandle::spawn(Box::new(cross_tab), self.mounted.clone()));

		info!("Session mounted");
	}

	/// Runs an extra feed, a push channel from the store for instance, until shutdown.
	pub async fn attach_feed(&self, feed: Box<dyn ChangeFeed>) {
		debug!(feed = feed.name(), "Attaching change feed");
		self.feeds
			.lock()
			.await
			.push(FeedHandle::spawn(feed, self.mounted.clone()));
	}

	/// The host regained focus, resync right away.
	pub fn notify_focus(&self) {
		self.focus.notify();
	}

	/// One resync outside of the polling schedule.
	pub async fn resync(&self) -> Result<ResyncReport, Error> {
		self.poller().resync(&MountedFlag::new(true)).await
	}

	#[must_use]
	pub fn migration(&self) -> StageMigration {
		StageMigration::new(self.tenant.clone(), Arc::clone(&self.store))
	}

	/// Reads the mutation log once and reports a broken storage medium instead of degrading
	/// silently. Returns how many entries are still inside the bus window.
	pub fn check_log(&self) -> Result<usize, Error> {
		Ok(self.log.try_recent(self.config.bus_window())?.len())
	}

	/// Number of feeds whose task is still alive.
	pub async fn running_feeds(&self) -> usize {
		self.feeds
			.lock()
			.await
			.iter()
			.filter(|feed| !feed.is_finished())
			.count()
	}

	/// Stops every feed and waits for them. Fetches still in flight finish on their own but
	/// their results are dropped.
	#[instrument(skip(self), fields(tenant = %self.tenant))]
	pub async fn shutdown(&self) {
		self.mounted.set(false);

		let feeds = std::mem::take(&mut *self.feeds.lock().await);
		if feeds.is_empty() {
			return;
		}

		join_all(feeds.into_iter().map(FeedHandle::stop)).await;

		info!("Session shut down");
	}

	fn poller(&self) -> PollingReconciler {
		PollingReconciler::new(
			self.tenant.clone(),
			Arc::clone(&self.store),
			Arc::clone(&self.cache),
			Arc::clone(&self.broadcaster),
			Arc::clone(&self.log),
		)
		.with_config(&self.config)
	}
}
