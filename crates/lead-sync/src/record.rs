use crate::StageId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last known attributes of a lead, keyed by its normalized id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
	pub id: String,
	pub name: String,
	pub stage: StageId,
	pub updated_at: DateTime<Utc>,
}

/// Partial update merged into a [`LeadRecord`], `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadPatch {
	pub name: Option<String>,
	pub stage: Option<StageId>,
}

impl LeadPatch {
	#[must_use]
	pub const fn stage(stage: StageId) -> Self {
		Self {
			name: None,
			stage: Some(stage),
		}
	}

	#[must_use]
	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.name.is_none() && self.stage.is_none()
	}

	/// Whether applying this patch would leave `record` as it is.
	#[must_use]
	pub fn is_noop_for(&self, record: &LeadRecord) -> bool {
		self.name.as_ref().map_or(true, |name| *name == record.name)
			&& self.stage.map_or(true, |stage| stage == record.stage)
	}

	pub(crate) fn apply(self, id: &str, existing: Option<&LeadRecord>, at: DateTime<Utc>) -> LeadRecord {
		let (name, stage) = existing.map_or_else(
			|| (String::new(), StageId::default()),
			|record| (record.name.clone(), record.stage),
		);

		LeadRecord {
			id: id.to_string(),
			name: self.name.unwrap_or(name),
			stage: self.stage.unwrap_or(stage),
			updated_at: at,
		}
	}
}
