//! The persistent lead store this crate synchronizes against. It is an external collaborator:
//! [`HttpLeadStore`] talks to the real API, [`MemoryLeadStore`] stands in for it offline.

mod http;
mod memory;

pub use http::HttpLeadStore;
pub use memory::{MemoryLeadStore, StoreCall, StoreOperation, StoredLead};

use crate::{identifier::AuxiliaryIds, ParsedStage, StageId, StoreError};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TenantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for TenantId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

/// The minimal `{ id, name, stage }` shape the store returns. `stage` is kept exactly as
/// persisted, it may still use a legacy name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadProjection {
	pub id: String,
	#[serde(default)]
	pub name: String,
	pub stage: String,
}

impl LeadProjection {
	/// Normalized view of the persisted stage, `None` when it isn't a known stage at all.
	#[must_use]
	pub fn stage(&self) -> Option<ParsedStage> {
		StageId::parse_lenient(&self.stage)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
	#[default]
	Default,
	/// Bypass every intermediate cache.
	Fresh,
}

/// Alternate ways of finding a lead when its id didn't match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadLookup {
	/// Matched against other leads' ids and auxiliary id fields.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub auxiliary_ids: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub contact: Option<String>,
}

impl LeadLookup {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.auxiliary_ids.is_empty() && self.name.is_none() && self.contact.is_none()
	}
}

/// A lead created as the last resort of a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub contact: Option<String>,
	pub stage: StageId,
	#[serde(default, skip_serializing_if = "AuxiliaryIds::is_empty")]
	pub metadata: AuxiliaryIds,
	#[serde(default, flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Every call is scoped to one tenant. A lead that doesn't exist is `Ok(None)`, never an error.
#[async_trait]
pub trait LeadStore: Send + Sync + fmt::Debug {
	async fn list_leads(
		&self,
		tenant: &TenantId,
		mode: FetchMode,
	) -> Result<Vec<LeadProjection>, StoreError>;

	async fn update_stage(
		&self,
		tenant: &TenantId,
		lead_id: &str,
		stage: StageId,
	) -> Result<Option<LeadProjection>, StoreError>;

	async fn search(
		&self,
		tenant: &TenantId,
		lookup: &LeadLookup,
	) -> Result<Option<LeadProjection>, StoreError>;

	async fn create(&self, tenant: &TenantId, lead: &NewLead) -> Result<LeadProjection, StoreError>;
}
