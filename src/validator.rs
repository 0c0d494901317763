//! Signature, issuer, and lifetime validation of inbound tokens, per tenant.
//!
//! The tenant is read from the unverified `tid` claim only to pick which tenant's published keys
//! and issuer values apply; the token is trusted only after [`TenantSignatureValidator`] has
//! verified it against that tenant's material.

// std
use std::time::Duration as StdDuration;
// crates.io
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
// self
use crate::{
	_prelude::*,
	auth::{InboundClaims, TenantId},
	discovery::{DiscoveryRegistry, DiscoverySettings},
	error::ValidationError,
	http::{self, ReqwestHttpClient},
	obs::{self, Stage, StageOutcome, StageSpan},
};

/// Issuer host of tokens minted by the legacy (v1) endpoint.
pub const DEFAULT_LEGACY_ISSUER: &str = "https://sts.windows.net";

/// Boxed future returned by [`TokenValidator::validate`].
pub type ValidationFuture<'a> = Pin<Box<dyn Future<Output = Result<ValidatedToken>> + 'a + Send>>;

/// Inbound token validation contract.
pub trait TokenValidator
where
	Self: 'static + Send + Sync,
{
	/// Validates `token`, returning its verified header and claims.
	///
	/// Verification failures are [`Error::Validation`]; discovery transport or upstream failures
	/// keep their own variants.
	fn validate<'a>(&'a self, token: &'a str) -> ValidationFuture<'a>;
}

/// A token whose signature, issuer, and lifetime have been verified.
#[derive(Clone, Debug)]
pub struct ValidatedToken {
	/// Verified claims.
	pub claims: InboundClaims,
	/// Verified header.
	pub header: Header,
}

/// Validator configuration.
#[derive(Clone, Debug)]
pub struct ValidatorSettings {
	/// Discovery and refresh behavior.
	pub discovery: DiscoverySettings,
	/// Legacy issuer host; `None` selects [`DEFAULT_LEGACY_ISSUER`].
	pub legacy_issuer: Option<Url>,
	/// Accepted signing algorithms.
	pub algorithms: Vec<Algorithm>,
	/// Clock skew tolerated on `exp`/`nbf`, in seconds.
	pub leeway: u64,
}
impl ValidatorSettings {
	/// Overrides the identity provider host used for discovery and the primary issuer.
	pub fn with_authority(mut self, authority: Url) -> Self {
		self.discovery.authority = Some(authority);

		self
	}

	/// Overrides the legacy issuer host.
	pub fn with_legacy_issuer(mut self, legacy_issuer: Url) -> Self {
		self.legacy_issuer = Some(legacy_issuer);

		self
	}

	/// Toggles HTTPS enforcement for discovery and key URLs.
	pub fn require_https(mut self, require_https: bool) -> Self {
		self.discovery.require_https = require_https;

		self
	}

	/// Replaces the accepted signing algorithms.
	pub fn with_algorithms(mut self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
		self.algorithms = algorithms.into_iter().collect();

		self
	}

	/// Overrides the background refresh interval.
	pub fn with_refresh_interval(mut self, interval: StdDuration) -> Self {
		self.discovery.refresh_interval = interval;

		self
	}

	/// Overrides the minimum spacing between forced refreshes.
	pub fn with_min_refresh_interval(mut self, interval: StdDuration) -> Self {
		self.discovery.min_refresh_interval = interval;

		self
	}

	/// Overrides the tolerated clock skew.
	pub fn with_leeway(mut self, leeway: u64) -> Self {
		self.leeway = leeway;

		self
	}

	/// Issuer values accepted for `tenant`: `{authority}/{tid}/v2.0` and `{legacy}/{tid}/`.
	pub fn issuers(&self, tenant: &TenantId) -> [String; 2] {
		[
			format!("{}/{tenant}/v2.0", http::authority_root(self.discovery.authority.as_ref())),
			format!(
				"{}/{tenant}/",
				self.legacy_issuer
					.as_ref()
					.map_or(DEFAULT_LEGACY_ISSUER, Url::as_str)
					.trim_end_matches('/')
			),
		]
	}
}
impl Default for ValidatorSettings {
	fn default() -> Self {
		Self {
			discovery: DiscoverySettings::default(),
			legacy_issuer: None,
			algorithms: vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512],
			leeway: 60,
		}
	}
}

/// Production [`TokenValidator`] backed by per-tenant discovery.
#[derive(Debug)]
pub struct TenantSignatureValidator {
	settings: ValidatorSettings,
	registry: DiscoveryRegistry,
}
impl TenantSignatureValidator {
	/// Builds a validator with the default discovery HTTP client.
	pub fn new(settings: ValidatorSettings) -> Result<Self> {
		let client = ReqwestHttpClient::new()?;

		Ok(Self::with_client(settings, client.0))
	}

	/// Builds a validator using `client` for discovery.
	pub fn with_client(settings: ValidatorSettings, client: ReqwestClient) -> Self {
		let registry = DiscoveryRegistry::new(settings.discovery.clone(), client);

		Self { settings, registry }
	}

	/// Settings in effect.
	pub fn settings(&self) -> &ValidatorSettings {
		&self.settings
	}

	/// Per-tenant discovery registry.
	pub fn registry(&self) -> &DiscoveryRegistry {
		&self.registry
	}

	/// Number of tenants whose trust material is tracked.
	pub fn tracked_tenants(&self) -> usize {
		self.registry.len()
	}

	/// Validates `token` against its tenant's published keys and issuers.
	pub async fn validate_token(&self, token: &str) -> Result<ValidatedToken> {
		const STAGE: Stage = Stage::Validation;

		let span = StageSpan::new(STAGE, None);

		obs::record_stage_outcome(STAGE, StageOutcome::Attempt);

		let result = span.instrument(self.validate_once(token)).await;

		if let Err(e) = &result {
			tracing::warn!(error = %e, "inbound token failed validation");
		}

		obs::record_stage_outcome(STAGE, StageOutcome::of(&result));

		result
	}

	async fn validate_once(&self, token: &str) -> Result<ValidatedToken> {
		let tenant = InboundClaims::extract(token)
			.ok()
			.and_then(|claims| claims.tenant().ok())
			.ok_or(ValidationError::MissingTenant)?;
		let header = jsonwebtoken::decode_header(token)
			.map_err(|e| ValidationError::MalformedHeader { source: Arc::new(e) })?;

		if !self.settings.algorithms.contains(&header.alg) {
			return Err(ValidationError::DisallowedAlgorithm { algorithm: header.alg }.into());
		}

		let kid = header.kid.as_deref().ok_or(ValidationError::MissingKeyId)?;
		let manager = self.registry.manager(&tenant)?;
		let jwk = manager.signing_key(kid).await?;
		let key = DecodingKey::from_jwk(&jwk)
			.map_err(|e| ValidationError::UnusableKey { kid: kid.into(), source: Arc::new(e) })?;
		let issuers = self.settings.issuers(&tenant);
		let mut validation = Validation::new(header.alg);

		validation.leeway = self.settings.leeway;
		validation.validate_aud = false;
		validation.set_issuer(&issuers[..]);
		validation.set_required_spec_claims(&["exp", "iss"]);

		let data = jsonwebtoken::decode::<InboundClaims>(token, &key, &validation)
			.map_err(|e| ValidationError::Rejected { source: Arc::new(e) })?;

		tracing::debug!(tenant = %tenant, kid, "inbound token validated");

		Ok(ValidatedToken { claims: data.claims, header })
	}
}
impl TokenValidator for TenantSignatureValidator {
	fn validate<'a>(&'a self, token: &'a str) -> ValidationFuture<'a> {
		Box::pin(self.validate_token(token))
	}
}
