//! Credential resolution backed by a remote secret store.

// crates.io
use futures::future;
// self
use crate::{
	_prelude::*,
	auth::{CredentialPair, TenantId},
	credentials::{CredentialFuture, CredentialResolver, UNAUTHORIZED_APPLICATION},
	obs::{self, Stage, StageOutcome, StageSpan},
};

/// Boxed future returned by [`SecretStore::get_secret`].
pub type SecretFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<String>>> + 'a + Send>>;

/// Named-secret lookup contract.
pub trait SecretStore
where
	Self: 'static + Send + Sync,
{
	/// Returns the secret value, or `None` when no secret with that name exists.
	fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a>;
}
impl<S> SecretStore for Arc<S>
where
	S: ?Sized + SecretStore,
{
	fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
		(**self).get_secret(name)
	}
}

/// Secret name holding a tenant's client identifier.
pub fn client_id_secret_name(tenant: &TenantId) -> String {
	format!("{tenant}-CLIENT-ID")
}

/// Secret name holding a tenant's client secret.
pub fn client_secret_secret_name(tenant: &TenantId) -> String {
	format!("{tenant}-CLIENT-SECRET")
}

/// Resolves per-tenant pairs from a [`SecretStore`], fetching each tenant at most once.
///
/// Concurrent first requests for a tenant share one fetch. Successful pairs stay cached for the
/// life of the process; a tenant with missing secrets is retried on the next request so
/// provisioning takes effect without a restart.
pub struct RemoteStoreCredentials<S>
where
	S: SecretStore,
{
	store: S,
	tenants: Mutex<HashMap<TenantId, Arc<AsyncOnceCell<CredentialPair>>>>,
}
impl<S> RemoteStoreCredentials<S>
where
	S: SecretStore,
{
	/// Wraps `store`.
	pub fn new(store: S) -> Self {
		Self { store, tenants: Default::default() }
	}

	/// Number of tenants with resolved or in-progress credentials.
	pub fn tracked_tenants(&self) -> usize {
		self.tenants.lock().len()
	}

	fn cell(&self, tenant: &TenantId) -> Arc<AsyncOnceCell<CredentialPair>> {
		self.tenants.lock().entry(tenant.clone()).or_default().clone()
	}

	/// Drops `cell` from the map while it is still empty, so failed lookups leave nothing behind.
	fn forget(&self, tenant: &TenantId, cell: &Arc<AsyncOnceCell<CredentialPair>>) {
		let mut tenants = self.tenants.lock();

		if tenants.get(tenant).is_some_and(|held| Arc::ptr_eq(held, cell) && !held.is_initialized())
		{
			tenants.remove(tenant);
		}
	}

	async fn fetch(&self, tenant: &TenantId) -> Result<CredentialPair> {
		let id_name = client_id_secret_name(tenant);
		let secret_name = client_secret_secret_name(tenant);
		let (client_id, client_secret) = future::try_join(
			self.store.get_secret(&id_name),
			self.store.get_secret(&secret_name),
		)
		.await?;

		CredentialPair::from_parts(client_id, client_secret).ok_or_else(|| {
			tracing::warn!(tenant = %tenant, "secret store has no credentials for tenant");

			Error::forbidden(UNAUTHORIZED_APPLICATION)
		})
	}
}
impl<S> CredentialResolver for RemoteStoreCredentials<S>
where
	S: SecretStore,
{
	fn resolve<'a>(&'a self, tenant: &'a TenantId) -> CredentialFuture<'a> {
		Box::pin(async move {
			let span = StageSpan::new(Stage::Credentials, Some(tenant.as_ref()));
			let cell = self.cell(tenant);
			let result = span
				.instrument(cell.get_or_try_init(|| self.fetch(tenant)))
				.await
				.map(Clone::clone);

			if result.is_err() {
				self.forget(tenant, &cell);
			}

			obs::record_stage_outcome(Stage::Credentials, StageOutcome::of(&result));

			result
		})
	}
}
impl<S> Debug for RemoteStoreCredentials<S>
where
	S: SecretStore,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RemoteStoreCredentials")
			.field("tracked_tenants", &self.tracked_tenants())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;

	#[derive(Default)]
	struct CountingStore {
		secrets: RwLock<HashMap<String, String>>,
		calls: AtomicUsize,
	}
	impl CountingStore {
		fn provision(&self, tenant: &str) {
			let mut secrets = self.secrets.write();

			secrets.insert(format!("{tenant}-CLIENT-ID"), format!("{tenant}-app"));
			secrets.insert(format!("{tenant}-CLIENT-SECRET"), format!("{tenant}-secret"));
		}
	}
	impl SecretStore for CountingStore {
		fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			let value = self.secrets.read().get(name).cloned();

			Box::pin(async move {
				tokio::task::yield_now().await;

				Ok(value)
			})
		}
	}

	fn tenant() -> TenantId {
		TenantId::new("tenant-a").expect("Tenant fixture should be valid.")
	}

	#[tokio::test]
	async fn concurrent_first_access_fetches_once() {
		let store = Arc::new(CountingStore::default());

		store.provision("tenant-a");

		let resolver = RemoteStoreCredentials::new(store.clone());
		let tenant = tenant();
		let (a, b, c) = tokio::join!(
			resolver.resolve(&tenant),
			resolver.resolve(&tenant),
			resolver.resolve(&tenant)
		);

		for pair in [a, b, c] {
			assert_eq!(pair.expect("Provisioned tenant should resolve.").client_id, "tenant-a-app");
		}

		assert_eq!(store.calls.load(Ordering::SeqCst), 2, "One fetch reads exactly two secrets.");

		resolver.resolve(&tenant).await.expect("Cached pair should resolve.");

		assert_eq!(store.calls.load(Ordering::SeqCst), 2, "Cached pairs must not refetch.");
	}

	#[tokio::test]
	async fn missing_secrets_are_forbidden_and_not_cached() {
		let store = Arc::new(CountingStore::default());
		let resolver = RemoteStoreCredentials::new(store.clone());
		let tenant = tenant();
		let err = resolver.resolve(&tenant).await.expect_err("Unprovisioned tenant should fail.");

		assert!(matches!(err, Error::Forbidden { .. }));
		assert_eq!(resolver.tracked_tenants(), 0, "Failed lookups must not be retained.");

		store.provision("tenant-a");

		let pair = resolver.resolve(&tenant).await.expect("Later provisioning should be seen.");

		assert_eq!(pair.client_secret.expose(), "tenant-a-secret");
	}

	#[tokio::test]
	async fn unknown_tenants_do_not_accumulate() {
		let resolver = RemoteStoreCredentials::new(Arc::new(CountingStore::default()));

		for index in 0..32 {
			let tenant =
				TenantId::new(format!("bogus-{index}")).expect("Tenant fixture should be valid.");

			resolver.resolve(&tenant).await.expect_err("Unknown tenant should fail.");
		}

		assert_eq!(resolver.tracked_tenants(), 0);
	}
}
