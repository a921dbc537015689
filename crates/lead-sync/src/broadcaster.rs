//! Same session fan out of lead events.
//!
//! Distinct from the [`MutationLog`](crate::MutationLog): events here are synchronous, carry the
//! full record and never leave the session; the log is persisted, crosses sessions and only
//! carries stage facts.

use crate::{observer::Observers, LeadRecord, StageId, Subscription};

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadEventKind {
	Create,
	Update,
	Delete,
}

/// Where the change that produced an event was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
	/// A transition applied by this session.
	Local,
	/// Picked up from another session through the mutation log.
	CrossSession,
	/// Found by a resync against the store.
	Poll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadEvent {
	pub kind: LeadEventKind,
	pub lead_id: String,
	pub origin: EventOrigin,
	/// Absent for deletions.
	pub payload: Option<LeadRecord>,
}

/// The minimal live update signal surfaces consume: `{ leadId, name?, stage?, timestamp }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSignal {
	pub lead_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stage: Option<StageId>,
	pub timestamp: i64,
}

impl LeadEvent {
	#[must_use]
	pub fn created(record: LeadRecord, origin: EventOrigin) -> Self {
		Self {
			kind: LeadEventKind::Create,
			lead_id: record.id.clone(),
			origin,
			payload: Some(record),
		}
	}

	#[must_use]
	pub fn updated(record: LeadRecord, origin: EventOrigin) -> Self {
		Self {
			kind: LeadEventKind::Update,
			lead_id: record.id.clone(),
			origin,
			payload: Some(record),
		}
	}

	#[must_use]
	pub fn deleted(lead_id: impl Into<String>, origin: EventOrigin) -> Self {
		Self {
			kind: LeadEventKind::Delete,
			lead_id: lead_id.into(),
			origin,
			payload: None,
		}
	}

	#[must_use]
	pub fn signal(&self) -> LeadSignal {
		LeadSignal {
			lead_id: self.lead_id.clone(),
			name: self
				.payload
				.as_ref()
				.map(|record| record.name.clone())
				.filter(|name| !name.is_empty()),
			stage: self.payload.as_ref().map(|record| record.stage),
			timestamp: self
				.payload
				.as_ref()
				.map_or_else(lf_utils::time::now_millis, |record| {
					record.updated_at.timestamp_millis()
				}),
		}
	}
}

/// Delivers every published event to all listeners, synchronously and in registration order,
/// then to async consumers of [`EventBroadcaster::stream`].
pub struct EventBroadcaster {
	observers: Observers<LeadEvent>,
	sender: broadcast::Sender<LeadEvent>,
}

impl fmt::Debug for EventBroadcaster {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventBroadcaster")
			.field("listeners", &self.observers.len())
			.field("streams", &self.sender.receiver_count())
			.finish()
	}
}

impl EventBroadcaster {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self {
			observers: Observers::new("event broadcaster"),
			sender,
		}
	}

	pub fn publish(&self, event: LeadEvent) {
		trace!(kind = ?event.kind, lead_id = %event.lead_id, origin = ?event.origin, "Publishing lead event");

		self.observers.notify(&event);

		// Ignore send errors (no stream receivers)
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self, listener: impl Fn(&LeadEvent) + Send + Sync + 'static) -> Subscription {
		self.observers.subscribe(listener)
	}

	#[must_use]
	pub fn stream(&self) -> broadcast::Receiver<LeadEvent> {
		self.sender.subscribe()
	}

	#[must_use]
	pub fn listener_count(&self) -> usize {
		self.observers.len() + self.sender.receiver_count()
	}
}

impl Default for EventBroadcaster {
	fn default() -> Self {
		Self::new(256)
	}
}
