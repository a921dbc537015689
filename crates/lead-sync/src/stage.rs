use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A position in the sales pipeline, in pipeline order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum StageId {
	#[default]
	New,
	Prospecting,
	Qualification,
	Opportunity,
	Confirmed,
	Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown pipeline stage: '{0}'")]
pub struct UnknownStage(pub String);

/// Outcome of reading a persisted stage value. `drifted` is set when the value used the
/// legacy localized naming and should eventually be migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedStage {
	pub stage: StageId,
	pub drifted: bool,
}

impl StageId {
	pub const ALL: [Self; 6] = [
		Self::New,
		Self::Prospecting,
		Self::Qualification,
		Self::Opportunity,
		Self::Confirmed,
		Self::Closed,
	];

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::New => "new",
			Self::Prospecting => "prospecting",
			Self::Qualification => "qualification",
			Self::Opportunity => "opportunity",
			Self::Confirmed => "confirmed",
			Self::Closed => "closed",
		}
	}

	#[must_use]
	pub const fn legacy_name(self) -> &'static str {
		match self {
			Self::New => "nuevos",
			Self::Prospecting => "prospectando",
			Self::Qualification => "calificacion",
			Self::Opportunity => "oportunidad",
			Self::Confirmed => "confirmado",
			Self::Closed => "cerrado",
		}
	}

	/// Accepts canonical and legacy names, ignoring case and surrounding whitespace.
	#[must_use]
	pub fn parse_lenient(raw: &str) -> Option<ParsedStage> {
		let normalized = raw.trim().to_lowercase();

		Self::ALL.into_iter().find_map(|stage| {
			if normalized == stage.as_str() {
				Some(ParsedStage {
					stage,
					drifted: false,
				})
			} else if normalized == stage.legacy_name()
				|| (stage == Self::Qualification && normalized == "calificación")
			{
				Some(ParsedStage {
					stage,
					drifted: true,
				})
			} else {
				None
			}
		})
	}

	#[must_use]
	pub fn position(self) -> usize {
		Self::ALL
			.iter()
			.position(|stage| *stage == self)
			.unwrap_or_default()
	}

	#[must_use]
	pub fn next(self) -> Option<Self> {
		Self::ALL.get(self.position() + 1).copied()
	}

	#[must_use]
	pub fn previous(self) -> Option<Self> {
		self.position()
			.checked_sub(1)
			.and_then(|idx| Self::ALL.get(idx).copied())
	}

	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Closed)
	}
}

impl fmt::Display for StageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for StageId {
	type Err = UnknownStage;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse_lenient(s)
			.map(|parsed| parsed.stage)
			.ok_or_else(|| UnknownStage(s.to_string()))
	}
}

impl TryFrom<String> for StageId {
	type Error = UnknownStage;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

// Always written with the canonical name, legacy names are only ever read.
impl Serialize for StageId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}
