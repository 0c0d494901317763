//! Discovery manager handling trust material retrieval and lifecycle for one tenant.

// std
use std::time::Duration as StdDuration;
// crates.io
use jsonwebtoken::jwk::{Jwk, JwkSet};
use rand::Rng;
use tokio::time::Instant;
// self
use crate::{
	_prelude::*,
	auth::TenantId,
	discovery::DiscoverySettings,
	error::{UpstreamEndpoint, ValidationError},
	http,
	obs::{self, Stage, StageOutcome, StageSpan},
};

/// Discovery document and signing keys for one tenant, replaced wholesale on refresh.
#[derive(Clone, Debug)]
pub struct TenantTrustMaterial {
	/// Issuer advertised by the discovery document.
	pub issuer: Option<String>,
	/// Location of the signing key set.
	pub jwks_uri: Url,
	/// Published signing keys.
	pub keys: Arc<JwkSet>,
	/// When the material was fetched.
	pub fetched_at: Instant,
	/// When the next background refresh is due.
	pub refresh_at: Instant,
}
impl TenantTrustMaterial {
	/// Looks up a signing key by identifier.
	pub fn find(&self, kid: &str) -> Option<&Jwk> {
		self.keys.find(kid)
	}
}

/// Coordinates fetching, caching, and background refresh of one tenant's trust material.
///
/// The async single-flight guard serializes fetches for this tenant only; readers never wait on
/// it once material is present.
#[derive(Debug)]
pub struct DiscoveryManager {
	tenant: TenantId,
	metadata_url: Url,
	settings: Arc<DiscoverySettings>,
	client: ReqwestClient,
	state: RwLock<ManagerState>,
	single_flight: AsyncMutex<()>,
}
impl DiscoveryManager {
	/// Creates a manager; nothing is fetched until first use.
	pub fn new(
		tenant: TenantId,
		metadata_url: Url,
		settings: Arc<DiscoverySettings>,
		client: ReqwestClient,
	) -> Self {
		Self {
			tenant,
			metadata_url,
			settings,
			client,
			state: Default::default(),
			single_flight: AsyncMutex::new(()),
		}
	}

	/// Tenant served by this manager.
	pub fn tenant(&self) -> &TenantId {
		&self.tenant
	}

	/// Material currently held, without fetching.
	pub fn current(&self) -> Option<Arc<TenantTrustMaterial>> {
		self.state.read().material.clone()
	}

	/// Returns the tenant's material, fetching it on first use.
	///
	/// Once the refresh instant has passed a background refresh is spawned and the current
	/// material is returned immediately.
	pub async fn material(self: &Arc<Self>) -> Result<Arc<TenantTrustMaterial>> {
		let now = Instant::now();
		let (current, spawn) = {
			let mut state = self.state.write();

			match state.material.clone() {
				Some(material) => {
					let spawn = now >= material.refresh_at && !state.refreshing;

					if spawn {
						state.refreshing = true;
					}

					(Some(material), spawn)
				},
				None => (None, false),
			}
		};

		if spawn {
			self.schedule_background_refresh();
		}

		match current {
			Some(material) => Ok(material),
			None => self.load().await,
		}
	}

	/// Resolves the key named `kid`, forcing one rate-limited refresh when it is unknown.
	pub async fn signing_key(self: &Arc<Self>, kid: &str) -> Result<Jwk> {
		let material = self.material().await?;

		if let Some(jwk) = material.find(kid) {
			return Ok(jwk.clone());
		}

		tracing::debug!(tenant = %self.tenant, kid, "unknown signing key; forcing refresh");

		let refreshed = self.force_refresh(&material).await?;

		refreshed.find(kid).cloned().ok_or_else(|| {
			ValidationError::UnknownSigningKey { tenant: self.tenant.to_string(), kid: kid.into() }
				.into()
		})
	}

	async fn load(&self) -> Result<Arc<TenantTrustMaterial>> {
		let _guard = self.single_flight.lock().await;

		if let Some(material) = self.current() {
			return Ok(material);
		}

		let material = self.fetch().await?;

		Ok(self.install(material))
	}

	async fn force_refresh(
		&self,
		seen: &Arc<TenantTrustMaterial>,
	) -> Result<Arc<TenantTrustMaterial>> {
		let _guard = self.single_flight.lock().await;
		let current = self.current().unwrap_or_else(|| seen.clone());

		if !Arc::ptr_eq(&current, seen) {
			return Ok(current);
		}
		if current.fetched_at.elapsed() < self.settings.min_refresh_interval {
			tracing::debug!(tenant = %self.tenant, "forced refresh suppressed by minimum interval");

			return Ok(current);
		}

		let material = self.fetch().await?;

		Ok(self.install(material))
	}

	fn schedule_background_refresh(self: &Arc<Self>) {
		let manager = self.clone();

		tokio::spawn(async move {
			let _guard = manager.single_flight.lock().await;

			match manager.fetch().await {
				Ok(material) => {
					manager.install(material);
				},
				Err(e) => {
					tracing::warn!(tenant = %manager.tenant, error = %e, "background refresh failed");

					manager.postpone();
				},
			}
		});
	}

	fn install(&self, material: TenantTrustMaterial) -> Arc<TenantTrustMaterial> {
		let material = Arc::new(material);
		let mut state = self.state.write();

		state.material = Some(material.clone());
		state.refreshing = false;

		material
	}

	fn postpone(&self) {
		let retry_at = Instant::now() + self.settings.min_refresh_interval;
		let mut state = self.state.write();

		if let Some(current) = state.material.take() {
			state.material =
				Some(Arc::new(TenantTrustMaterial { refresh_at: retry_at, ..(*current).clone() }));
		}

		state.refreshing = false;
	}

	async fn fetch(&self) -> Result<TenantTrustMaterial> {
		const STAGE: Stage = Stage::Discovery;

		let span = StageSpan::new(STAGE, Some(self.tenant.as_ref()));

		obs::record_stage_outcome(STAGE, StageOutcome::Attempt);

		let result = span.instrument(self.fetch_once()).await;

		obs::record_stage_outcome(STAGE, StageOutcome::of(&result));

		result
	}

	async fn fetch_once(&self) -> Result<TenantTrustMaterial> {
		if self.settings.require_https {
			http::enforce_https("openid_configuration", &self.metadata_url)?;
		}

		let document: OpenIdConfiguration =
			get_json(&self.client, UpstreamEndpoint::Discovery, self.metadata_url.clone()).await?;
		let jwks_uri = http::parse_url("jwks_uri", &document.jwks_uri)?;

		if self.settings.require_https {
			http::enforce_https("jwks_uri", &jwks_uri)?;
		}

		let keys: JwkSet =
			get_json(&self.client, UpstreamEndpoint::SigningKeys, jwks_uri.clone()).await?;
		let fetched_at = Instant::now();
		let refresh_at =
			fetched_at + jittered(self.settings.refresh_interval, self.settings.refresh_jitter);

		tracing::debug!(tenant = %self.tenant, keys = keys.keys.len(), "trust material fetched");

		Ok(TenantTrustMaterial {
			issuer: document.issuer,
			jwks_uri,
			keys: Arc::new(keys),
			fetched_at,
			refresh_at,
		})
	}
}

#[derive(Debug, Default)]
struct ManagerState {
	material: Option<Arc<TenantTrustMaterial>>,
	refreshing: bool,
}

#[derive(Deserialize)]
struct OpenIdConfiguration {
	#[serde(default)]
	issuer: Option<String>,
	jwks_uri: String,
}

async fn get_json<T>(client: &ReqwestClient, endpoint: UpstreamEndpoint, url: Url) -> Result<T>
where
	T: serde::de::DeserializeOwned,
{
	let (status, body) = http::send(endpoint, client.get(url)).await?;

	if !status.is_success() {
		tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "discovery request rejected");

		return Err(Error::upstream_rejected(
			endpoint,
			status.as_u16(),
			String::from_utf8_lossy(&body).into_owned(),
		));
	}

	http::parse_json(endpoint, &body)
}

/// Subtracts a random share (up to `ratio`) of `interval`.
fn jittered(interval: StdDuration, ratio: f64) -> StdDuration {
	let max_ms =
		u64::try_from(interval.mul_f64(ratio.clamp(0.0, 1.0)).as_millis()).unwrap_or(u64::MAX);

	if max_ms == 0 {
		return interval;
	}

	interval.saturating_sub(StdDuration::from_millis(rand::rng().random_range(0..=max_ms)))
}
