use lf_utils::error::FileIOError;

use std::fmt;

use thiserror::Error;

/// Which store interaction failed, so callers can tell a failed direct update from a failed
/// fallback creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStep {
	DirectUpdate,
	AlternateLookup,
	Create,
	Resync,
	Migration,
}

impl fmt::Display for StoreStep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::DirectUpdate => "direct update",
			Self::AlternateLookup => "alternate lookup",
			Self::Create => "fallback create",
			Self::Resync => "resync",
			Self::Migration => "stage migration",
		})
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid transition input: {0}")]
	Validation(String),
	#[error("lead not found after exhausting fallbacks <id='{lead_id}'>")]
	NotFound { lead_id: String },
	#[error("store failure during {step}: {source}")]
	Store {
		step: StoreStep,
		#[source]
		source: StoreError,
	},
	/// Only surfaced by explicit checks such as `LeadSyncSession::check_log`, the regular
	/// paths log the failure and keep working locally.
	#[error("cross session sync degraded: {0}")]
	SyncDegraded(#[from] StorageError),

	#[error("invalid configuration: {0}")]
	Config(String),
	#[error("failed to parse configuration: {0}")]
	ConfigParse(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl Error {
	#[must_use]
	pub fn store(step: StoreStep) -> impl FnOnce(StoreError) -> Self {
		move |source| Self::Store { step, source }
	}

	/// Validation failures are never worth retrying, everything else might be.
	#[must_use]
	pub const fn is_retryable(&self) -> bool {
		!matches!(self, Self::Validation(_) | Self::Config(_))
	}
}

/// Failures reported by a [`LeadStore`](crate::LeadStore). A missing lead is not an error,
/// stores report it as `Ok(None)` so the fallback chain can continue.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("invalid store url: {0}")]
	InvalidUrl(String),
	#[error("http transport error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("store rejected the request <status={status}>: {body}")]
	Rejected { status: u16, body: String },
	#[error("not authorized for tenant <status={0}>")]
	Unauthorized(u16),
	#[error("store failure <status={status}>: {body}")]
	Status { status: u16, body: String },
	#[error("failed to decode store response: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("store backend error: {0}")]
	Backend(String),
}

impl StoreError {
	/// Maps a non success, non 404 status to its error.
	#[must_use]
	pub fn from_status(status: u16, body: impl Into<String>) -> Self {
		let body = body.into();
		match status {
			400 | 422 => Self::Rejected { status, body },
			401 | 403 => Self::Unauthorized(status),
			_ => Self::Status { status, body },
		}
	}
}

/// Failures of the storage medium behind the [`MutationLog`](crate::MutationLog).
#[derive(Debug, Error)]
pub enum StorageError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to serialize mutation log: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("storage unavailable: {0}")]
	Unavailable(String),
}
