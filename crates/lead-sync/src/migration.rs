use crate::{Error, FetchMode, LeadStore, StoreStep, TenantId};

use std::{fmt, sync::Arc};

use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
	pub scanned: usize,
	/// Leads whose legacy stage name was rewritten with the canonical one.
	pub migrated: Vec<String>,
	/// Leads whose stage matches no known stage, left as they are.
	pub unknown: Vec<String>,
}

/// Rewrites legacy stage names persisted in the store with their canonical names. Reads
/// normalize on their own, this is the only path writing the normalized names back.
pub struct StageMigration {
	tenant: TenantId,
	store: Arc<dyn LeadStore>,
}

impl fmt::Debug for StageMigration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StageMigration")
			.field("tenant", &self.tenant)
			.finish_non_exhaustive()
	}
}

impl StageMigration {
	pub fn new(tenant: TenantId, store: Arc<dyn LeadStore>) -> Self {
		Self { tenant, store }
	}

	#[instrument(skip(self), fields(tenant = %self.tenant), err)]
	pub async fn run(&self) -> Result<MigrationReport, Error> {
		let leads = self
			.store
			.list_leads(&self.tenant, FetchMode::Fresh)
			.await
			.map_err(Error::store(StoreStep::Migration))?;

		let mut report = MigrationReport {
			scanned: leads.len(),
			..MigrationReport::default()
		};

		for lead in leads {
			match lead.stage() {
				Some(parsed) if parsed.drifted => {
					self.store
						.update_stage(&self.tenant, &lead.id, parsed.stage)
						.await
						.map_err(Error::store(StoreStep::Migration))?;
					report.migrated.push(lead.id);
				}
				Some(_) => {}
				None => {
					warn!(lead_id = %lead.id, stage = %lead.stage, "Lead has an unknown stage, leaving it as is");
					report.unknown.push(lead.id);
				}
			}
		}

		info!(
			scanned = report.scanned,
			migrated = report.migrated.len(),
			unknown = report.unknown.len(),
			"Stage migration finished"
		);

		Ok(report)
	}
}
