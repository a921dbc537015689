use super::{FetchMode, LeadLookup, LeadProjection, LeadStore, NewLead, TenantId};
use crate::{identifier::AuxiliaryIds, StageId, StoreError};

use std::{
	collections::{BTreeMap, HashSet},
	sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLead {
	pub id: String,
	pub name: String,
	pub contact: Option<String>,
	/// As persisted, possibly a legacy name.
	pub stage: String,
	pub metadata: AuxiliaryIds,
}

impl StoredLead {
	pub fn new(id: impl Into<String>, name: impl Into<String>, stage: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			contact: None,
			stage: stage.into(),
			metadata: AuxiliaryIds::default(),
		}
	}

	#[must_use]
	pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
		self.contact = Some(contact.into());
		self
	}

	#[must_use]
	pub fn with_metadata(mut self, metadata: AuxiliaryIds) -> Self {
		self.metadata = metadata;
		self
	}

	fn projection(&self) -> LeadProjection {
		LeadProjection {
			id: self.id.clone(),
			name: self.name.clone(),
			stage: self.stage.clone(),
		}
	}

	fn matches(&self, lookup: &LeadLookup) -> bool {
		let by_id = lookup
			.auxiliary_ids
			.iter()
			.any(|id| *id == self.id || self.metadata.contains(id));

		let by_name = lookup.name.as_deref().is_some_and(|name| {
			!name.trim().is_empty() && name.trim().eq_ignore_ascii_case(self.name.trim())
		});

		let by_contact = lookup
			.contact
			.as_deref()
			.zip(self.contact.as_deref())
			.is_some_and(|(wanted, contact)| !wanted.is_empty() && wanted == contact);

		by_id || by_name || by_contact
	}
}

/// Which store operation was invoked, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
	List(FetchMode),
	UpdateStage { lead_id: String, stage: StageId },
	Search(LeadLookup),
	Create { name: String, stage: StageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
	List,
	UpdateStage,
	Search,
	Create,
}

#[derive(Debug, Default)]
struct State {
	tenants: BTreeMap<TenantId, Vec<StoredLead>>,
	calls: Vec<StoreCall>,
	failing: HashSet<StoreOperation>,
}

/// Process local [`LeadStore`], used offline and as the collaborator in tests. It records
/// every call so the order of a fallback chain can be inspected.
#[derive(Debug, Default)]
pub struct MemoryLeadStore {
	state: Mutex<State>,
}

impl MemoryLeadStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, tenant: &TenantId, lead: StoredLead) {
		self.lock()
			.tenants
			.entry(tenant.clone())
			.or_default()
			.push(lead);
	}

	#[must_use]
	pub fn lead(&self, tenant: &TenantId, id: &str) -> Option<StoredLead> {
		self.lock()
			.tenants
			.get(tenant)
			.and_then(|leads| leads.iter().find(|lead| lead.id == id).cloned())
	}

	#[must_use]
	pub fn leads(&self, tenant: &TenantId) -> Vec<StoredLead> {
		self.lock().tenants.get(tenant).cloned().unwrap_or_default()
	}

	#[must_use]
	pub fn calls(&self) -> Vec<StoreCall> {
		self.lock().calls.clone()
	}

	pub fn clear_calls(&self) {
		self.lock().calls.clear();
	}

	/// Makes every following `operation` fail with a backend error until cleared.
	pub fn fail(&self, operation: StoreOperation) {
		self.lock().failing.insert(operation);
	}

	pub fn recover(&self, operation: StoreOperation) {
		self.lock().failing.remove(&operation);
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl State {
	fn check(&self, operation: StoreOperation) -> Result<(), StoreError> {
		if self.failing.contains(&operation) {
			Err(StoreError::Backend(format!("{operation:?} is failing")))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
	async fn list_leads(
		&self,
		tenant: &TenantId,
		mode: FetchMode,
	) -> Result<Vec<LeadProjection>, StoreError> {
		let mut state = self.lock();
		state.calls.push(StoreCall::List(mode));
		state.check(StoreOperation::List)?;

		Ok(state
			.tenants
			.get(tenant)
			.map(|leads| leads.iter().map(StoredLead::projection).collect())
			.unwrap_or_default())
	}

	async fn update_stage(
		&self,
		tenant: &TenantId,
		lead_id: &str,
		stage: StageId,
	) -> Result<Option<LeadProjection>, StoreError> {
		let mut state = self.lock();
		state.calls.push(StoreCall::UpdateStage {
			lead_id: lead_id.to_string(),
			stage,
		});
		state.check(StoreOperation::UpdateStage)?;

		Ok(state
			.tenants
			.get_mut(tenant)
			.and_then(|leads| leads.iter_mut().find(|lead| lead.id == lead_id))
			.map(|lead| {
				lead.stage = stage.as_str().to_string();
				lead.projection()
			}))
	}

	async fn search(
		&self,
		tenant: &TenantId,
		lookup: &LeadLookup,
	) -> Result<Option<LeadProjection>, StoreError> {
		let mut state = self.lock();
		state.calls.push(StoreCall::Search(lookup.clone()));
		state.check(StoreOperation::Search)?;

		if lookup.is_empty() {
			return Ok(None);
		}

		Ok(state.tenants.get(tenant).and_then(|leads| {
			leads
				.iter()
				.find(|lead| lead.matches(lookup))
				.map(StoredLead::projection)
		}))
	}

	async fn create(&self, tenant: &TenantId, lead: &NewLead) -> Result<LeadProjection, StoreError> {
		let mut state = self.lock();
		state.calls.push(StoreCall::Create {
			name: lead.name.clone(),
			stage: lead.stage,
		});
		state.check(StoreOperation::Create)?;

		if lead.name.trim().is_empty() {
			return Err(StoreError::from_status(400, "name is required"));
		}

		let stored = StoredLead {
			id: Uuid::new_v4().to_string(),
			name: lead.name.clone(),
			contact: lead.contact.clone(),
			stage: lead.stage.as_str().to_string(),
			metadata: lead.metadata.clone(),
		};
		let projection = stored.projection();

		state.tenants.entry(tenant.clone()).or_default().push(stored);

		Ok(projection)
	}
}
