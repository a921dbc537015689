use lf_lead_sync::{
	mutation_log::{FileStorage, MemoryStorage},
	store::{FetchMode, LeadStore, MemoryLeadStore, StoreCall, StoreOperation, StoredLead},
	ChangeFeed, EntityCache, EventBroadcaster, EventOrigin, FeedContext, LeadEventKind,
	Error, LeadLookup, LeadProjection, LogStorage, MountedFlag, MutationLog, NewLead,
	PollingReconciler, StageId, StorageError, StoreError, SyncConfig, TenantId,
};

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::Semaphore;
use uuid::Uuid;

mod common;

use common::{next_matching, session, tenant, Fixture};

fn list_calls(store: &MemoryLeadStore) -> usize {
	store
		.calls()
		.iter()
		.filter(|call| **call == StoreCall::List(FetchMode::Fresh))
		.count()
}

#[tokio::test]
async fn transitions_reach_a_sibling_session() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");

	let sibling = fx.sibling();
	let mut sibling_events = sibling.broadcaster().stream();
	sibling.mount().await;

	// initial load first, so the change below can only come through the log
	next_matching(&mut sibling_events, |event| event.origin == EventOrigin::Poll).await;

	fx.session
		.transition("L1", "confirmed", None)
		.await
		.expect("transition");

	let event = next_matching(&mut sibling_events, |event| {
		event.payload.as_ref().map(|record| record.stage) == Some(StageId::Confirmed)
	})
	.await;

	assert_eq!(event.origin, EventOrigin::CrossSession);
	assert_eq!(event.kind, LeadEventKind::Update);
	assert_eq!(
		sibling.get("L1").map(|record| record.stage),
		Some(StageId::Confirmed)
	);

	sibling.shutdown().await;
}

#[tokio::test]
async fn file_backed_sessions_converge() {
	let dir = tempdir().expect("tempdir");
	let store = Arc::new(MemoryLeadStore::new());
	store.insert(&tenant(), StoredLead::new("L1", "Ana", "new"));

	let config = SyncConfig {
		refresh_interval_ms: 50,
		..SyncConfig::default()
	};

	let writer = session(
		config.clone(),
		&store,
		Arc::new(FileStorage::open(dir.path()).expect("open")),
	);
	let reader = session(
		config,
		&store,
		Arc::new(FileStorage::open(dir.path()).expect("open")),
	);

	let mut reader_events = reader.broadcaster().stream();
	reader.mount().await;
	next_matching(&mut reader_events, |event| event.origin == EventOrigin::Poll).await;

	writer
		.transition("L1", "opportunity", None)
		.await
		.expect("transition");

	// through the watcher, or the refresh tick when there is none
	let event = next_matching(&mut reader_events, |event| {
		event.origin == EventOrigin::CrossSession
	})
	.await;

	assert_eq!(event.lead_id, "L1");
	assert_eq!(
		reader.get("L1").map(|record| record.stage),
		Some(StageId::Opportunity)
	);

	reader.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn polling_resyncs_on_every_tick() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");

	fx.session.mount().await;
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(list_calls(&fx.store), 1);
	assert_eq!(
		fx.session.get("L1").map(|record| record.stage),
		Some(StageId::New)
	);

	// someone else moves the lead straight in the store
	fx.store
		.update_stage(&tenant(), "L1", StageId::Qualification)
		.await
		.expect("update");
	fx.store.insert(&tenant(), StoredLead::new("L2", "Bea", "prospectando"));

	tokio::time::sleep(fx.session.config().resync_interval()).await;

	assert_eq!(list_calls(&fx.store), 2);
	assert_eq!(
		fx.session.get("L1").map(|record| record.stage),
		Some(StageId::Qualification)
	);
	assert_eq!(
		fx.session.get("L2").map(|record| record.stage),
		Some(StageId::Prospecting)
	);

	fx.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_ticks_are_skipped_not_fatal() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");
	fx.store.fail(StoreOperation::List);

	fx.session.mount().await;
	tokio::time::sleep(Duration::from_millis(10)).await;
	assert!(fx.session.cache().is_empty());
	assert_eq!(list_calls(&fx.store), 1);

	fx.store.recover(StoreOperation::List);
	tokio::time::sleep(fx.session.config().resync_interval()).await;

	assert_eq!(
		fx.session.get("L1").map(|record| record.stage),
		Some(StageId::New)
	);
	assert_eq!(fx.session.running_feeds().await, 2);

	fx.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn focus_triggers_an_immediate_resync() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");

	fx.session.mount().await;
	tokio::time::sleep(Duration::from_millis(10)).await;
	assert_eq!(list_calls(&fx.store), 1);

	fx.store
		.update_stage(&tenant(), "L1", StageId::Confirmed)
		.await
		.expect("update");

	fx.session.notify_focus();
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(list_calls(&fx.store), 2);
	assert_eq!(
		fx.session.get("L1").map(|record| record.stage),
		Some(StageId::Confirmed)
	);

	fx.session.shutdown().await;
}

struct ExitFlagFeed {
	exited: Arc<AtomicBool>,
}

#[async_trait]
impl ChangeFeed for ExitFlagFeed {
	fn name(&self) -> &'static str {
		"exit_flag"
	}

	async fn run(&mut self, ctx: FeedContext) {
		ctx.stop.wait().await;
		self.exited.store(true, Ordering::Release);
	}
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_nothing_running() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");

	let exited = Arc::new(AtomicBool::new(false));
	fx.session.mount().await;
	fx.session.mount().await;
	fx.session
		.attach_feed(Box::new(ExitFlagFeed {
			exited: Arc::clone(&exited),
		}))
		.await;

	tokio::time::sleep(Duration::from_millis(10)).await;
	assert!(fx.session.is_mounted());
	assert_eq!(fx.session.running_feeds().await, 3);

	fx.session.shutdown().await;

	assert!(!fx.session.is_mounted());
	assert_eq!(fx.session.running_feeds().await, 0);
	assert!(exited.load(Ordering::Acquire));

	// no timer survived the shutdown
	let calls = list_calls(&fx.store);
	tokio::time::sleep(fx.session.config().resync_interval() * 4).await;
	assert_eq!(list_calls(&fx.store), calls);
}

/// Holds `list_leads` until the test lets it through.
#[derive(Debug)]
struct GatedStore {
	inner: MemoryLeadStore,
	gate: Semaphore,
}

#[async_trait]
impl LeadStore for GatedStore {
	async fn list_leads(
		&self,
		tenant: &TenantId,
		mode: FetchMode,
	) -> Result<Vec<LeadProjection>, StoreError> {
		let leads = self.inner.list_leads(tenant, mode).await;
		let _permit = self.gate.acquire().await;
		leads
	}

	async fn update_stage(
		&self,
		tenant: &TenantId,
		lead_id: &str,
		stage: StageId,
	) -> Result<Option<LeadProjection>, StoreError> {
		self.inner.update_stage(tenant, lead_id, stage).await
	}

	async fn search(
		&self,
		tenant: &TenantId,
		lookup: &LeadLookup,
	) -> Result<Option<LeadProjection>, StoreError> {
		self.inner.search(tenant, lookup).await
	}

	async fn create(&self, tenant: &TenantId, lead: &NewLead) -> Result<LeadProjection, StoreError> {
		self.inner.create(tenant, lead).await
	}
}

#[tokio::test]
async fn responses_after_unmount_are_dropped() {
	let store = Arc::new(GatedStore {
		inner: MemoryLeadStore::new(),
		gate: Semaphore::new(0),
	});
	store
		.inner
		.insert(&tenant(), StoredLead::new("L1", "Ana", "new"));

	let cache = Arc::new(EntityCache::default());
	let broadcaster = Arc::new(EventBroadcaster::default());
	let mut events = broadcaster.stream();
	let poller = PollingReconciler::new(
		tenant(),
		store.clone(),
		Arc::clone(&cache),
		broadcaster,
		Arc::new(MutationLog::new(
			Arc::new(MemoryStorage::default()),
			"updates",
			50,
		)),
	);

	let mounted = MountedFlag::new(true);
	let in_flight = tokio::spawn({
		let mounted = mounted.clone();
		async move { poller.resync(&mounted).await }
	});

	tokio::time::sleep(Duration::from_millis(20)).await;
	mounted.set(false);
	store.gate.add_permits(1);

	let report = in_flight.await.expect("join").expect("resync");
	assert!(report.discarded);
	assert_eq!(report.fetched, 1);
	assert!(cache.is_empty());
	assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn unmounted_sessions_ignore_focus_until_mounted() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");

	fx.session.notify_focus();
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(fx.store.calls().is_empty());
	assert!(!fx.session.is_mounted());

	let mut events = fx.session.broadcaster().stream();
	fx.session.mount().await;
	next_matching(&mut events, |event| event.lead_id == "L1").await;

	fx.session.shutdown().await;
}

#[derive(Debug)]
struct QuotaExceeded;

impl LogStorage for QuotaExceeded {
	fn read(&self, _: &str) -> Result<Option<String>, StorageError> {
		Err(StorageError::Unavailable("quota exceeded".into()))
	}

	fn write(&self, _: &str, _: &str, _: Uuid) -> Result<(), StorageError> {
		Err(StorageError::Unavailable("quota exceeded".into()))
	}
}

#[tokio::test]
async fn broken_log_only_degrades_cross_session_sync() {
	let fx = Fixture::new();
	fx.seed("L1", "Ana", "new");
	let degraded = session(common::config(), &fx.store, Arc::new(QuotaExceeded));

	assert!(matches!(degraded.check_log(), Err(Error::SyncDegraded(_))));
	assert_eq!(fx.session.check_log().expect("memory log"), 0);

	// local transitions still work
	let outcome = degraded
		.transition("L1", "prospecting", None)
		.await
		.expect("transition");
	assert_eq!(outcome.record.stage, StageId::Prospecting);
	assert_eq!(
		degraded.get("L1").map(|record| record.stage),
		Some(StageId::Prospecting)
	);
}
