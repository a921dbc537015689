use super::{apply_entry, ChangeFeed, FeedContext, FocusSignal, MountedFlag};
use crate::{
	EntityCache, Error, EventBroadcaster, EventOrigin, FetchMode, LeadEvent, LeadPatch, LeadStore,
	MutationLog, StoreStep, SyncConfig, TenantId,
};

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

/// What one resync against the store did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
	pub fetched: usize,
	pub updated: usize,
	/// Closed leads dropped from the cache.
	pub removed: usize,
	/// Leads whose persisted stage isn't a stage at all.
	pub unknown: usize,
	/// The session unmounted while the fetch was in flight, nothing was applied.
	pub discarded: bool,
}

/// The fallback feed when the store can't push: replays the mutation log every refresh tick
/// and refetches every open lead of the tenant every resync tick or when focus comes back.
pub struct PollingReconciler {
	tenant: TenantId,
	store: Arc<dyn LeadStore>,
	cache: Arc<EntityCache>,
	broadcaster: Arc<EventBroadcaster>,
	log: Arc<MutationLog>,
	focus: FocusSignal,
	refresh_interval: Duration,
	resync_interval: Duration,
	bus_window: Duration,
}

impl fmt::Debug for PollingReconciler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PollingReconciler")
			.field("tenant", &self.tenant)
			.field("refresh_interval", &self.refresh_interval)
			.field("resync_interval", &self.resync_interval)
			.field("bus_window", &self.bus_window)
			.finish_non_exhaustive()
	}
}

impl PollingReconciler {
	pub fn new(
		tenant: TenantId,
		store: Arc<dyn LeadStore>,
		cache: Arc<EntityCache>,
		broadcaster: Arc<EventBroadcaster>,
		log: Arc<MutationLog>,
	) -> Self {
		let defaults = SyncConfig::default();

		Self {
			tenant,
			store,
			cache,
			broadcaster,
			log,
			focus: FocusSignal::default(),
			refresh_interval: defaults.refresh_interval(),
			resync_interval: defaults.resync_interval(),
			bus_window: defaults.bus_window(),
		}
	}

	#[must_use]
	pub fn with_config(mut self, config: &SyncConfig) -> Self {
		self.refresh_interval = config.refresh_interval();
		self.resync_interval = config.resync_interval();
		self.bus_window = config.bus_window();
		self
	}

	#[must_use]
	pub fn with_focus(mut self, focus: FocusSignal) -> Self {
		self.focus = focus;
		self
	}

	/// Refetches the tenant's leads bypassing every cache and merges the open ones into the
	/// entity cache; leads that became closed are removed from it.
	#[instrument(skip_all, fields(tenant = %self.tenant), err)]
	pub async fn resync(&self, mounted: &MountedFlag) -> Result<ResyncReport, Error> {
		let started_at = Utc::now();

		let leads = self
			.store
			.list_leads(&self.tenant, FetchMode::Fresh)
			.await
			.map_err(Error::store(StoreStep::Resync))?;

		let mut report = ResyncReport {
			fetched: leads.len(),
			..ResyncReport::default()
		};

		if !mounted.is_mounted() {
			debug!("Session unmounted while fetching, dropping the response");
			report.discarded = true;
			return Ok(report);
		}

		for lead in leads {
			let Some(parsed) = lead.stage() else {
				warn!(lead_id = %lead.id, stage = %lead.stage, "Skipping lead with an unknown stage");
				report.unknown += 1;
				continue;
			};

			if parsed.stage.is_terminal() {
				if let Some(removed) = self.cache.remove(&lead.id) {
					self.broadcaster
						.publish(LeadEvent::deleted(removed.id, EventOrigin::Poll));
					report.removed += 1;
				}
				continue;
			}

			let mut patch = LeadPatch::stage(parsed.stage);
			if !lead.name.is_empty() {
				patch = patch.with_name(lead.name);
			}

			// The fetch started before any write made while it was in flight, those win
			if let Some(record) = self.cache.merge_observed(&lead.id, patch, started_at) {
				self.broadcaster
					.publish(LeadEvent::updated(record, EventOrigin::Poll));
				report.updated += 1;
			}
		}

		Ok(report)
	}

	/// Replays the still relevant mutation log entries, for writers whose notifications
	/// never reach this session.
	pub fn refresh(&self, mounted: &MountedFlag) -> usize {
		if !mounted.is_mounted() {
			return 0;
		}

		let applied = self
			.log
			.recent(self.bus_window)
			.iter()
			.filter(|entry| apply_entry(&self.cache, &self.broadcaster, entry).is_some())
			.count();

		trace!(applied, "Refresh tick");

		applied
	}

	async fn resync_or_skip(&self, mounted: &MountedFlag) {
		match self.resync(mounted).await {
			Ok(report) => debug!(?report, "Resync finished"),
			Err(e) => warn!(?e, "Resync failed, skipping until the next tick"),
		}
	}
}

#[async_trait]
impl ChangeFeed for PollingReconciler {
	fn name(&self) -> &'static str {
		"polling"
	}

	async fn run(&mut self, ctx: FeedContext) {
		let FeedContext { stop, mounted } = ctx;

		let mut refresh = interval_at(
			Instant::now() + self.refresh_interval,
			self.refresh_interval,
		);
		refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

		// First tick completes right away, that's the initial load
		let mut resync = interval(self.resync_interval);
		resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				() = stop.wait() => break,
				_ = resync.tick() => self.resync_or_skip(&mounted).await,
				_ = refresh.tick() => {
					self.refresh(&mounted);
				}
				() = self.focus.notified() => {
					debug!("Focus regained, resyncing");
					self.resync_or_skip(&mounted).await;
					resync.reset();
				}
			}
		}
	}
}
