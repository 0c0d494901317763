//! Per-tenant client credential resolution.
//!
//! The broker authenticates to each tenant's token endpoint with its own client identifier and
//! secret. [`CredentialResolver`] hides where those come from:
//!
//! - [`StaticCredentials`] returns one fixed pair for every tenant.
//! - [`EnvironmentCredentials`] reads `{tenant}_CLIENT_ID` and `{tenant}_CLIENT_SECRET`.
//! - [`RemoteStoreCredentials`] reads `{tenant}-CLIENT-ID` and `{tenant}-CLIENT-SECRET` from a
//!   [`SecretStore`] such as [`KeyVaultSecretStore`], caching each tenant's pair for the life of
//!   the process.
//!
//! A tenant without credentials is an authorization failure, never a server error.

pub mod ambient;
pub mod key_vault;
pub mod remote;

pub use ambient::*;
pub use key_vault::*;
pub use remote::*;

// self
use crate::{
	_prelude::*,
	auth::{CredentialPair, TenantId},
	obs::{self, Stage, StageOutcome, StageSpan},
};

/// Caller-facing reason returned when a tenant has no provisioned credentials.
pub const UNAUTHORIZED_APPLICATION: &str = "You are not authorized to use this application.";

/// Boxed future returned by [`CredentialResolver::resolve`].
pub type CredentialFuture<'a> = Pin<Box<dyn Future<Output = Result<CredentialPair>> + 'a + Send>>;

/// Resolves the broker's client credentials for a tenant.
pub trait CredentialResolver
where
	Self: 'static + Send + Sync,
{
	/// Returns the pair for `tenant`, or [`Error::Forbidden`] when none is provisioned.
	fn resolve<'a>(&'a self, tenant: &'a TenantId) -> CredentialFuture<'a>;
}

/// Source of named variables; the process environment by default.
pub trait VariableSource
where
	Self: 'static + Send + Sync,
{
	/// Returns the value of `name`, if set.
	fn var(&self, name: &str) -> Option<String>;
}

/// Reads variables from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnvironment;
impl VariableSource for ProcessEnvironment {
	fn var(&self, name: &str) -> Option<String> {
		std::env::var(name).ok()
	}
}
impl VariableSource for HashMap<String, String> {
	fn var(&self, name: &str) -> Option<String> {
		self.get(name).cloned()
	}
}

/// Returns one fixed pair regardless of tenant.
#[derive(Clone, Debug)]
pub struct StaticCredentials(CredentialPair);
impl StaticCredentials {
	/// Wraps the fixed pair.
	pub fn new(pair: CredentialPair) -> Self {
		Self(pair)
	}
}
impl CredentialResolver for StaticCredentials {
	fn resolve<'a>(&'a self, _: &'a TenantId) -> CredentialFuture<'a> {
		let pair = self.0.clone();

		Box::pin(async move { Ok(pair) })
	}
}

/// Reads `{tenant}_CLIENT_ID` and `{tenant}_CLIENT_SECRET` on every request.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentCredentials<V = ProcessEnvironment>
where
	V: VariableSource,
{
	source: V,
}
impl EnvironmentCredentials {
	/// Reads from the process environment.
	pub fn new() -> Self {
		Self { source: ProcessEnvironment }
	}
}
impl<V> EnvironmentCredentials<V>
where
	V: VariableSource,
{
	/// Reads from `source` instead of the process environment.
	pub fn with_source(source: V) -> Self {
		Self { source }
	}

	fn lookup(&self, tenant: &TenantId) -> Result<CredentialPair> {
		let client_id = self.source.var(&format!("{tenant}_CLIENT_ID"));
		let client_secret = self.source.var(&format!("{tenant}_CLIENT_SECRET"));

		CredentialPair::from_parts(client_id, client_secret).ok_or_else(|| {
			tracing::warn!(tenant = %tenant, "no environment credentials for tenant");

			Error::forbidden(UNAUTHORIZED_APPLICATION)
		})
	}
}
impl<V> CredentialResolver for EnvironmentCredentials<V>
where
	V: VariableSource,
{
	fn resolve<'a>(&'a self, tenant: &'a TenantId) -> CredentialFuture<'a> {
		Box::pin(async move {
			let span = StageSpan::new(Stage::Credentials, Some(tenant.as_ref()));
			let result = span.span().in_scope(|| self.lookup(tenant));

			obs::record_stage_outcome(Stage::Credentials, StageOutcome::of(&result));

			result
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn tenant() -> TenantId {
		TenantId::new("tenant-a").expect("Tenant fixture should be valid.")
	}

	#[tokio::test]
	async fn static_credentials_ignore_the_tenant() {
		let resolver = StaticCredentials::new(CredentialPair::new("id", "secret"));
		let pair = resolver.resolve(&tenant()).await.expect("Static credentials should resolve.");

		assert_eq!(pair.client_id, "id");
	}

	#[tokio::test]
	async fn environment_credentials_use_tenant_prefixed_names() {
		let source = HashMap::from_iter([
			("tenant-a_CLIENT_ID".to_owned(), "app-a".to_owned()),
			("tenant-a_CLIENT_SECRET".to_owned(), "secret-a".to_owned()),
		]);
		let resolver = EnvironmentCredentials::with_source(source);
		let pair =
			resolver.resolve(&tenant()).await.expect("Provisioned tenant should resolve.");

		assert_eq!(pair.client_id, "app-a");
		assert_eq!(pair.client_secret.expose(), "secret-a");
	}

	#[tokio::test]
	async fn environment_credentials_reject_partial_pairs() {
		let source = HashMap::from_iter([
			("tenant-a_CLIENT_ID".to_owned(), "app-a".to_owned()),
			("tenant-a_CLIENT_SECRET".to_owned(), String::new()),
		]);
		let err = EnvironmentCredentials::with_source(source)
			.resolve(&tenant())
			.await
			.expect_err("Empty secret should be rejected.");

		assert!(matches!(err, Error::Forbidden { .. }));
		assert_eq!(err.to_string(), UNAUTHORIZED_APPLICATION);
	}
}
