#![allow(dead_code)]

use lf_lead_sync::{
	mutation_log::MemoryStorage,
	store::{MemoryLeadStore, StoredLead},
	LeadEvent, LeadSyncSession, LogStorage, Subscription, SyncConfig, TenantId,
};

use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::sync::broadcast;

pub const TENANT: &str = "acme";

pub fn tenant() -> TenantId {
	TenantId::new(TENANT)
}

pub fn config() -> SyncConfig {
	SyncConfig::default()
}

pub struct Fixture {
	pub store: Arc<MemoryLeadStore>,
	pub storage: Arc<MemoryStorage>,
	pub session: LeadSyncSession,
}

impl Fixture {
	pub fn new() -> Self {
		Self::with_config(config())
	}

	pub fn with_config(config: SyncConfig) -> Self {
		let store = Arc::new(MemoryLeadStore::new());
		let storage = Arc::new(MemoryStorage::default());
		let session = session(config, &store, storage.clone());

		Self {
			store,
			storage,
			session,
		}
	}

	/// Another session on the same store and storage medium.
	pub fn sibling(&self) -> LeadSyncSession {
		session(
			self.session.config().clone(),
			&self.store,
			self.storage.clone(),
		)
	}

	pub fn seed(&self, id: &str, name: &str, stage: &str) {
		self.store.insert(&tenant(), StoredLead::new(id, name, stage));
	}
}

pub fn session(
	config: SyncConfig,
	store: &Arc<MemoryLeadStore>,
	storage: Arc<dyn LogStorage>,
) -> LeadSyncSession {
	LeadSyncSession::new(config, tenant(), store.clone(), storage).expect("valid config")
}

/// Collects every event a session publishes, through the synchronous listener API.
pub struct EventRecorder {
	events: Arc<Mutex<Vec<LeadEvent>>>,
	_subscription: Subscription,
}

impl EventRecorder {
	pub fn attach(session: &LeadSyncSession) -> Self {
		let events = Arc::new(Mutex::new(Vec::new()));
		let subscription = session.broadcaster().subscribe({
			let events = Arc::clone(&events);
			move |event| events.lock().expect("lock").push(event.clone())
		});

		Self {
			events,
			_subscription: subscription,
		}
	}

	pub fn events(&self) -> Vec<LeadEvent> {
		self.events.lock().expect("lock").clone()
	}

	pub fn clear(&self) {
		self.events.lock().expect("lock").clear();
	}
}

/// Waits for the first event on `stream` matching `predicate`.
pub async fn next_matching(
	stream: &mut broadcast::Receiver<LeadEvent>,
	predicate: impl Fn(&LeadEvent) -> bool,
) -> LeadEvent {
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			let event = stream.recv().await.expect("event stream open");
			if predicate(&event) {
				break event;
			}
		}
	})
	.await
	.expect("matching event in time")
}
