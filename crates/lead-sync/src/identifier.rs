//! Resolution of the persistent identifier of a lead.
//!
//! A lead can be known by a synthetic id (assigned by a chat surface before the lead was
//! persisted) while the store knows it by a canonical id recorded later on the lead's metadata.
//! Auxiliary ids exist precisely because some earlier reconciliation found the authoritative
//! id, so they are trusted above the primary id.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Length of the canonical `8-4-4-4-12` hyphenated hex form.
pub const CANONICAL_ID_LEN: usize = 36;

/// Only the hyphenated form counts, `Uuid::try_parse` alone would also accept the simple,
/// braced and urn forms.
#[must_use]
pub fn is_canonical(id: &str) -> bool {
	id.len() == CANONICAL_ID_LEN
		&& id
			.char_indices()
			.all(|(idx, c)| matches!(idx, 8 | 13 | 18 | 23) == (c == '-'))
		&& Uuid::try_parse(id).is_ok()
}

/// Metadata fields that may carry an alternate identifier, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryField {
	/// Recorded by the most recent reconciliation.
	RealId,
	/// Id assigned by the store on a previous save.
	DbId,
	/// Id the lead was created with.
	OriginalId,
}

impl AuxiliaryField {
	pub const PRIORITY: [Self; 3] = [Self::RealId, Self::DbId, Self::OriginalId];

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::RealId => "real_id",
			Self::DbId => "db_id",
			Self::OriginalId => "original_id",
		}
	}
}

/// Alternate identifier fields carried on a lead's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryIds {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub real_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub db_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub original_id: Option<String>,
}

impl AuxiliaryIds {
	#[must_use]
	pub fn get(&self, field: AuxiliaryField) -> Option<&str> {
		match field {
			AuxiliaryField::RealId => self.real_id.as_deref(),
			AuxiliaryField::DbId => self.db_id.as_deref(),
			AuxiliaryField::OriginalId => self.original_id.as_deref(),
		}
		.map(str::trim)
		.filter(|id| !id.is_empty())
	}

	/// Non empty ids in [`AuxiliaryField::PRIORITY`] order.
	pub fn iter(&self) -> impl Iterator<Item = (AuxiliaryField, &str)> {
		AuxiliaryField::PRIORITY
			.into_iter()
			.filter_map(|field| self.get(field).map(|id| (field, id)))
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.iter().next().is_none()
	}

	#[must_use]
	pub fn contains(&self, id: &str) -> bool {
		self.iter().any(|(_, candidate)| candidate == id)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierBundle {
	pub primary_id: String,
	/// Already in priority order.
	pub auxiliary_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedId {
	Verified(String),
	/// Nothing looked canonical, callers must not assume the store knows this id.
	Unverified(String),
}

impl ResolvedId {
	#[must_use]
	pub fn as_str(&self) -> &str {
		match self {
			Self::Verified(id) | Self::Unverified(id) => id,
		}
	}

	#[must_use]
	pub const fn is_verified(&self) -> bool {
		matches!(self, Self::Verified(_))
	}

	#[must_use]
	pub fn into_string(self) -> String {
		match self {
			Self::Verified(id) | Self::Unverified(id) => id,
		}
	}
}

impl fmt::Display for ResolvedId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
	pub id: ResolvedId,
	/// Canonical auxiliary ids that lost against the winner. Non empty means the lead's
	/// metadata disagrees with itself and whoever wrote it should be looked at.
	pub conflicts: Vec<String>,
}

impl Resolution {
	#[must_use]
	pub fn has_conflicts(&self) -> bool {
		!self.conflicts.is_empty()
	}
}

impl IdentifierBundle {
	#[must_use]
	pub fn new(primary_id: impl Into<String>, auxiliary: &AuxiliaryIds) -> Self {
		Self {
			primary_id: primary_id.into(),
			auxiliary_ids: auxiliary.iter().map(|(_, id)| id.to_string()).collect(),
		}
	}

	/// Every distinct id in the bundle, primary first.
	#[must_use]
	pub fn all_ids(&self) -> Vec<String> {
		let mut ids = Vec::with_capacity(self.auxiliary_ids.len() + 1);
		for id in std::iter::once(&self.primary_id).chain(&self.auxiliary_ids) {
			if !id.is_empty() && !ids.contains(id) {
				ids.push(id.clone());
			}
		}
		ids
	}

	/// First canonical auxiliary id, else the primary id if canonical, else the primary id
	/// as [`ResolvedId::Unverified`].
	#[must_use]
	pub fn resolve(&self) -> Resolution {
		let mut canonical_aux = self
			.auxiliary_ids
			.iter()
			.map(String::as_str)
			.filter(|id| is_canonical(id));

		if let Some(winner) = canonical_aux.next() {
			let mut conflicts = Vec::new();
			for other in canonical_aux {
				if other != winner && !conflicts.iter().any(|c: &String| c == other) {
					conflicts.push(other.to_string());
				}
			}

			if !conflicts.is_empty() {
				warn!(
					primary_id = %self.primary_id,
					%winner,
					?conflicts,
					"Auxiliary identifiers disagree, using the highest priority one",
				);
			}

			return Resolution {
				id: ResolvedId::Verified(winner.to_string()),
				conflicts,
			};
		}

		Resolution {
			id: if is_canonical(&self.primary_id) {
				ResolvedId::Verified(self.primary_id.clone())
			} else {
				ResolvedId::Unverified(self.primary_id.clone())
			},
			conflicts: Vec::new(),
		}
	}
}

/// Shorthand for [`IdentifierBundle::resolve`].
#[must_use]
pub fn resolve(bundle: &IdentifierBundle) -> Resolution {
	bundle.resolve()
}
