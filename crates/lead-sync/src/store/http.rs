use super::{FetchMode, LeadLookup, LeadProjection, LeadStore, NewLead, TenantId};
use crate::{config::StoreConfig, StageId, StoreError};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
	header::{CACHE_CONTROL, PRAGMA},
	Client, RequestBuilder, Response, StatusCode, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};

/// [`LeadStore`] over the collaborator's HTTP API:
/// - `GET    /leads?tenant={id}`
/// - `PUT    /leads/{id}/stage?tenant={id}`
/// - `POST   /leads/search`
/// - `POST   /leads`
#[derive(Debug, Clone)]
pub struct HttpLeadStore {
	client: Client,
	base_url: Url,
	token: Option<String>,
}

#[derive(Serialize)]
struct StageBody {
	stage: StageId,
}

#[derive(Serialize)]
struct Scoped<'body, T: Serialize> {
	tenant: &'body TenantId,
	#[serde(flatten)]
	body: &'body T,
}

impl HttpLeadStore {
	pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
		let client = Client::builder()
			.timeout(Duration::from_millis(config.timeout_ms))
			.build()?;

		Self::with_client(client, config)
	}

	/// Uses a preconfigured client, `config.timeout_ms` is left to the client's own settings.
	pub fn with_client(client: Client, config: &StoreConfig) -> Result<Self, StoreError> {
		let base_url = Url::parse(&config.base_url)
			.map_err(|e| StoreError::InvalidUrl(format!("{}: {e}", config.base_url)))?;

		if base_url.cannot_be_a_base() {
			return Err(StoreError::InvalidUrl(config.base_url.clone()));
		}

		Ok(Self {
			client,
			base_url,
			token: config.token.clone(),
		})
	}

	/// Appends `segments` to the base url, percent encoding each one.
	pub fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|()| StoreError::InvalidUrl(self.base_url.to_string()))?
			.pop_if_empty()
			.extend(segments);
		Ok(url)
	}

	fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
		match &self.token {
			Some(token) => request.bearer_auth(token),
			None => request,
		}
	}
}

/// `Ok(None)` on 404 or an empty/`null` body, an error for any other non success status.
async fn read_optional<T: DeserializeOwned>(response: Response) -> Result<Option<T>, StoreError> {
	let status = response.status();
	if status == StatusCode::NOT_FOUND {
		return Ok(None);
	}

	let body = response.text().await?;
	if !status.is_success() {
		return Err(StoreError::from_status(status.as_u16(), body));
	}

	if body.trim().is_empty() {
		return Ok(None);
	}

	Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl LeadStore for HttpLeadStore {
	#[instrument(skip(self), err)]
	async fn list_leads(
		&self,
		tenant: &TenantId,
		mode: FetchMode,
	) -> Result<Vec<LeadProjection>, StoreError> {
		let mut request = self
			.client
			.get(self.endpoint(&["leads"])?)
			.query(&[("tenant", tenant.as_str())]);

		if mode == FetchMode::Fresh {
			request = request
				.header(CACHE_CONTROL, "no-cache, no-store")
				.header(PRAGMA, "no-cache");
		}

		let leads = read_optional::<Vec<LeadProjection>>(self.authorized(request).send().await?)
			.await?
			.unwrap_or_default();

		debug!(count = leads.len(), "Fetched lead projections");

		Ok(leads)
	}

	#[instrument(skip(self), err)]
	async fn update_stage(
		&self,
		tenant: &TenantId,
		lead_id: &str,
		stage: StageId,
	) -> Result<Option<LeadProjection>, StoreError> {
		let request = self
			.client
			.put(self.endpoint(&["leads", lead_id, "stage"])?)
			.query(&[("tenant", tenant.as_str())])
			.json(&StageBody { stage });

		let response = self.authorized(request).send().await?;
		let status = response.status();

		match read_optional::<LeadProjection>(response).await? {
			Some(projection) => Ok(Some(projection)),
			// 204 and friends: the update went through but the store didn't echo the lead
			None if status.is_success() => Ok(Some(LeadProjection {
				id: lead_id.to_string(),
				name: String::new(),
				stage: stage.as_str().to_string(),
			})),
			None => Ok(None),
		}
	}

	#[instrument(skip(self), err)]
	async fn search(
		&self,
		tenant: &TenantId,
		lookup: &LeadLookup,
	) -> Result<Option<LeadProjection>, StoreError> {
		let request = self
			.client
			.post(self.endpoint(&["leads", "search"])?)
			.json(&Scoped {
				tenant,
				body: lookup,
			});

		read_optional(self.authorized(request).send().await?).await
	}

	#[instrument(skip(self, lead), fields(name = %lead.name, stage = %lead.stage), err)]
	async fn create(&self, tenant: &TenantId, lead: &NewLead) -> Result<LeadProjection, StoreError> {
		let request = self
			.client
			.post(self.endpoint(&["leads"])?)
			.json(&Scoped { tenant, body: lead });

		read_optional(self.authorized(request).send().await?)
			.await?
			.ok_or_else(|| StoreError::Backend("store returned no lead after create".to_string()))
	}
}
