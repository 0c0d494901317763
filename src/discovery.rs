//! Per-tenant discovery: OpenID configuration plus signing keys.
//!
//! [`DiscoveryRegistry`] owns one [`DiscoveryManager`] per tenant, created on first use and kept
//! for the life of the process. Managers fetch lazily, serialize their own fetches, and refresh in
//! the background while continuing to serve the material they already hold.

pub mod manager;

pub use manager::*;

// std
use std::time::Duration as StdDuration;
// self
use crate::{_prelude::*, auth::TenantId, http};

/// Discovery and refresh behavior shared by every tenant manager.
#[derive(Clone, Debug)]
pub struct DiscoverySettings {
	/// Identity provider host; `None` selects [`http::DEFAULT_AUTHORITY`].
	pub authority: Option<Url>,
	/// Rejects discovery or key URLs that do not use HTTPS.
	pub require_https: bool,
	/// Interval between background refreshes.
	pub refresh_interval: StdDuration,
	/// Fraction of the interval randomly subtracted from each schedule (`0.0..=1.0`).
	pub refresh_jitter: f64,
	/// Minimum spacing between fetches triggered by unknown key identifiers or failures.
	pub min_refresh_interval: StdDuration,
}
impl DiscoverySettings {
	/// Default background refresh interval (12 hours).
	pub const DEFAULT_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(12 * 60 * 60);
	/// Default minimum spacing between forced refreshes (5 minutes).
	pub const DEFAULT_MIN_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);

	/// OpenID configuration URL for `tenant`.
	pub fn metadata_url(&self, tenant: &TenantId) -> Result<Url> {
		http::parse_url(
			"openid_configuration",
			&format!(
				"{}/{tenant}/v2.0/.well-known/openid-configuration",
				http::authority_root(self.authority.as_ref())
			),
		)
	}
}
impl Default for DiscoverySettings {
	fn default() -> Self {
		Self {
			authority: None,
			require_https: true,
			refresh_interval: Self::DEFAULT_REFRESH_INTERVAL,
			refresh_jitter: 0.1,
			min_refresh_interval: Self::DEFAULT_MIN_REFRESH_INTERVAL,
		}
	}
}

/// Process-wide map from tenant to its [`DiscoveryManager`].
#[derive(Debug)]
pub struct DiscoveryRegistry {
	settings: Arc<DiscoverySettings>,
	client: ReqwestClient,
	managers: Mutex<HashMap<TenantId, Arc<DiscoveryManager>>>,
}
impl DiscoveryRegistry {
	/// Creates an empty registry.
	pub fn new(settings: DiscoverySettings, client: ReqwestClient) -> Self {
		Self { settings: Arc::new(settings), client, managers: Default::default() }
	}

	/// Settings shared by every manager.
	pub fn settings(&self) -> &DiscoverySettings {
		&self.settings
	}

	/// Returns the manager for `tenant`, creating it exactly once.
	///
	/// Creation happens under the registry lock and performs no I/O.
	pub fn manager(&self, tenant: &TenantId) -> Result<Arc<DiscoveryManager>> {
		if let Some(manager) = self.managers.lock().get(tenant) {
			return Ok(manager.clone());
		}

		let metadata_url = self.settings.metadata_url(tenant)?;
		let mut managers = self.managers.lock();
		let manager = managers.entry(tenant.clone()).or_insert_with(|| {
			tracing::debug!(tenant = %tenant, "creating discovery manager");

			Arc::new(DiscoveryManager::new(
				tenant.clone(),
				metadata_url,
				self.settings.clone(),
				self.client.clone(),
			))
		});

		Ok(manager.clone())
	}

	/// Number of tenants with a manager.
	pub fn len(&self) -> usize {
		self.managers.lock().len()
	}

	/// Returns `true` before any tenant has been seen.
	pub fn is_empty(&self) -> bool {
		self.managers.lock().is_empty()
	}
}
