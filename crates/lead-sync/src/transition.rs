//! Stage changes applied through the store, with the direct update → alternate lookup → create
//! fallback chain for ids the store doesn't know.

use crate::{
	identifier::{AuxiliaryIds, IdentifierBundle},
	EntityCache, Error, EventBroadcaster, EventOrigin, LeadEvent, LeadLookup, LeadPatch,
	LeadProjection, LeadRecord, LeadStore, MutationLog, NewLead, StageId, StoreStep, TenantId,
};

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

/// Everything besides the id a caller knows about the lead, used to find it when the id
/// doesn't resolve and to create it as a last resort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionFields {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub contact: Option<String>,
	#[serde(default, rename = "metadata", skip_serializing_if = "AuxiliaryIds::is_empty")]
	pub auxiliary: AuxiliaryIds,
	/// Passed through untouched to the store on creation.
	#[serde(default, flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TransitionFields {
	#[must_use]
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: Some(name.into()),
			..Self::default()
		}
	}

	fn name(&self) -> Option<&str> {
		self.name.as_deref().map(str::trim).filter(|name| !name.is_empty())
	}

	fn contact(&self) -> Option<&str> {
		self.contact
			.as_deref()
			.map(str::trim)
			.filter(|contact| !contact.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionKind {
	/// The requested id was the persistent one.
	Updated,
	/// Found through the alternate lookup under another id.
	Resolved { persistent_id: String },
	/// Nothing matched, a new lead was created with the requested stage.
	Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
	pub kind: TransitionKind,
	/// Persistent id of the lead that changed.
	pub lead_id: String,
	/// Normalized id the caller asked for.
	pub requested_id: String,
	pub record: LeadRecord,
}

impl TransitionOutcome {
	#[must_use]
	pub fn fallback_created(&self) -> bool {
		self.kind == TransitionKind::Created
	}
}

pub struct StageTransitionService {
	tenant: TenantId,
	store: Arc<dyn LeadStore>,
	cache: Arc<EntityCache>,
	broadcaster: Arc<EventBroadcaster>,
	log: Arc<MutationLog>,
}

impl fmt::Debug for StageTransitionService {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StageTransitionService")
			.field("tenant", &self.tenant)
			.field("store", &self.store)
			.finish_non_exhaustive()
	}
}

impl StageTransitionService {
	pub fn new(
		tenant: TenantId,
		store: Arc<dyn LeadStore>,
		cache: Arc<EntityCache>,
		broadcaster: Arc<EventBroadcaster>,
		log: Arc<MutationLog>,
	) -> Self {
		Self {
			tenant,
			store,
			cache,
			broadcaster,
			log,
		}
	}

	#[must_use]
	pub const fn tenant(&self) -> &TenantId {
		&self.tenant
	}

	/// Moves `lead_id` to `new_stage`, given by its canonical or legacy name.
	pub async fn transition(
		&self,
		lead_id: &str,
		new_stage: &str,
		fields: Option<&TransitionFields>,
	) -> Result<TransitionOutcome, Error> {
		let raw = new_stage.trim();
		if raw.is_empty() {
			return Err(Error::Validation("stage is required".to_string()));
		}

		let stage = StageId::parse_lenient(raw)
			.ok_or_else(|| Error::Validation(format!("unknown stage '{raw}'")))?
			.stage;

		self.transition_to(lead_id, stage, fields).await
	}

	/// Moves `lead_id` to `stage`. On success the cache, the event broadcaster and the
	/// mutation log all see the change; on failure none of them do.
	#[instrument(skip(self, fields), fields(tenant = %self.tenant))]
	pub async fn transition_to(
		&self,
		lead_id: &str,
		stage: StageId,
		fields: Option<&TransitionFields>,
	) -> Result<TransitionOutcome, Error> {
		let requested = self.cache.normalize(lead_id);
		if requested.is_empty() {
			return Err(Error::Validation("lead id is required".to_string()));
		}

		let no_fields = TransitionFields::default();
		let fields = fields.unwrap_or(&no_fields);

		let (projection, kind) = match self.apply(requested, stage, fields).await {
			Ok(applied) => applied,
			Err(e) => {
				match &e {
					Error::Store { step, .. } => {
						error!(%requested, %stage, %step, ?e, "Stage transition failed");
					}
					_ => warn!(%requested, %stage, ?e, "Stage transition failed"),
				}
				return Err(e);
			}
		};

		Ok(self.commit(requested, projection, stage, kind, fields.name()))
	}

	/// Applies a stage reported by an external conversation system. Hints that aren't a known
	/// stage, or that match what the cache already holds, are ignored.
	pub async fn apply_stage_hint(
		&self,
		lead_id: &str,
		hint: &str,
		fields: Option<&TransitionFields>,
	) -> Result<Option<TransitionOutcome>, Error> {
		let Some(parsed) = StageId::parse_lenient(hint) else {
			debug!(%lead_id, %hint, "Ignoring unknown stage hint");
			return Ok(None);
		};

		if self
			.cache
			.get(lead_id)
			.is_some_and(|record| record.stage == parsed.stage)
		{
			return Ok(None);
		}

		self.transition_to(lead_id, parsed.stage, fields)
			.await
			.map(Some)
	}

	async fn apply(
		&self,
		requested: &str,
		stage: StageId,
		fields: &TransitionFields,
	) -> Result<(LeadProjection, TransitionKind), Error> {
		let bundle = IdentifierBundle::new(requested, &fields.auxiliary);
		let resolution = bundle.resolve();
		let target = resolution.id.as_str();

		if let Some(projection) = self
			.store
			.update_stage(&self.tenant, target, stage)
			.await
			.map_err(Error::store(StoreStep::DirectUpdate))?
		{
			let kind = if self.cache.normalize(&projection.id) == requested {
				TransitionKind::Updated
			} else {
				TransitionKind::Resolved {
					persistent_id: projection.id.clone(),
				}
			};
			return Ok((projection, kind));
		}

		let lookup = LeadLookup {
			auxiliary_ids: bundle.all_ids(),
			name: fields.name().map(str::to_string),
			contact: fields.contact().map(str::to_string),
		};

		debug!(%target, verified = resolution.id.is_verified(), "Direct update missed, trying alternate lookup");

		if let Some(found) = self
			.store
			.search(&self.tenant, &lookup)
			.await
			.map_err(Error::store(StoreStep::AlternateLookup))?
		{
			if let Some(projection) = self
				.store
				.update_stage(&self.tenant, &found.id, stage)
				.await
				.map_err(Error::store(StoreStep::AlternateLookup))?
			{
				info!(%requested, persistent_id = %projection.id, "Resolved lead through alternate lookup");
				return Ok((
					projection.clone(),
					TransitionKind::Resolved {
						persistent_id: projection.id,
					},
				));
			}

			warn!(%requested, found = %found.id, "Lead found by lookup vanished before its update");
		}

		let Some(name) = fields.name() else {
			return Err(Error::NotFound {
				lead_id: requested.to_string(),
			});
		};

		// Keep the id the caller used, so the next transition on it finds this lead
		let mut metadata = fields.auxiliary.clone();
		if !metadata.contains(requested) && metadata.original_id.is_none() {
			metadata.original_id = Some(requested.to_string());
		}

		let projection = self
			.store
			.create(
				&self.tenant,
				&NewLead {
					name: name.to_string(),
					contact: fields.contact().map(str::to_string),
					stage,
					metadata,
					extra: fields.extra.clone(),
				},
			)
			.await
			.map_err(Error::store(StoreStep::Create))?;

		info!(%requested, persistent_id = %projection.id, "Created fallback lead");

		Ok((projection, TransitionKind::Created))
	}

	fn commit(
		&self,
		requested: &str,
		projection: LeadProjection,
		stage: StageId,
		kind: TransitionKind,
		fallback_name: Option<&str>,
	) -> TransitionOutcome {
		let persistent = self.cache.normalize(&projection.id).to_string();

		let mut patch = LeadPatch::stage(stage);
		if !projection.name.is_empty() {
			patch = patch.with_name(projection.name);
		} else if let Some(name) = fallback_name {
			patch = patch.with_name(name);
		}

		if persistent != requested {
			self.cache.alias(requested, &persistent);
		}
		let record = self.cache.update(&persistent, patch);

		self.broadcaster.publish(if kind == TransitionKind::Created {
			LeadEvent::created(record.clone(), EventOrigin::Local)
		} else {
			LeadEvent::updated(record.clone(), EventOrigin::Local)
		});

		self.log.record(&persistent, stage);

		info!(%requested, lead_id = %persistent, %stage, ?kind, "Stage transition applied");

		TransitionOutcome {
			kind,
			lead_id: persistent,
			requested_id: requested.to_string(),
			record,
		}
	}
}
