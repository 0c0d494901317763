//! Per-request broker pipeline.
//!
//! [`BrokerPipeline::authorize`] takes an inbound `http::Request`, derives a downstream token on
//! behalf of its caller, and stores it in the request extensions as an [`OboToken`]. Failures come
//! back as a [`Rejection`] carrying the status and message to send; [`Rejection::from_error`] is
//! the only place broker errors are mapped to HTTP status codes.
//!
//! Two modes exist:
//!
//! - [`ExchangeMode::Cached`]: `oid` and `aud` are required, the inbound token is validated
//!   against its tenant's signing keys, and the derived token is cached per `(tid, oid)`.
//! - [`ExchangeMode::Direct`]: every request performs an exchange and the token endpoint itself
//!   decides whether the inbound token is acceptable.

// crates.io
use oauth2::http::{
	Extensions, HeaderValue, Request, Response, StatusCode,
	header::{AUTHORIZATION, CONTENT_TYPE},
};
// self
use crate::{
	_prelude::*,
	auth::{InboundClaims, TokenSecret},
	cache::{CacheKey, TokenCache},
	config::{BrokerConfig, CredentialBackend},
	credentials::{
		ChainedCredential, CredentialResolver, EnvironmentCredentials, KeyVaultSecretStore,
		ProcessEnvironment, RemoteStoreCredentials, StaticCredentials,
	},
	error::UpstreamEndpoint,
	exchange::{ExchangeSettings, OboExchanger},
	http::{ReqwestHttpClient, TokenHttpClient},
	obs::{self, Stage, StageOutcome, StageSpan},
	validator::{TenantSignatureValidator, TokenValidator, ValidatorSettings},
};

/// Name under which the derived token is published to downstream handlers.
pub const OBO_TOKEN_KEY: &str = "obo-token";

const MISSING_BEARER: &str = "You must provide a Bearer Token in the Authorization header.";
const VALIDATION_FAILED: &str = "The provided Bearer Token could not be validated.";
const INTERNAL_ERROR: &str = "Internal server error.";

/// Derived downstream token published in the request extensions.
#[derive(Clone, PartialEq, Eq)]
pub struct OboToken(TokenSecret);
impl OboToken {
	/// Wraps a derived token.
	pub fn new(token: TokenSecret) -> Self {
		Self(token)
	}

	/// Raw token value for the downstream `Authorization` header. Never log it.
	pub fn expose(&self) -> &str {
		self.0.expose()
	}

	/// Reads the token published by [`BrokerPipeline::authorize`].
	///
	/// A handler reached without one is [`Error::Forbidden`].
	pub fn from_extensions(extensions: &Extensions) -> Result<Self> {
		extensions.get::<Self>().cloned().ok_or_else(|| {
			Error::forbidden(format!("The request context does not contain an `{OBO_TOKEN_KEY}`."))
		})
	}
}
impl Debug for OboToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("OboToken").field(&"<redacted>").finish()
	}
}

/// Caller-facing outcome of a failed request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
	/// HTTP status to return.
	pub status: StatusCode,
	/// Plain-text body to return.
	pub message: String,
}
impl Rejection {
	/// Maps a broker error onto the status and message returned to the caller.
	///
	/// Token endpoint rejections with HTTP 400 are passed through with the upstream body so the
	/// caller can react to consent or conditional access errors; everything else that is not an
	/// authentication or authorization failure becomes a generic 500.
	pub fn from_error(error: &Error) -> Self {
		let (status, message) = match error {
			Error::Unauthenticated { reason } => (StatusCode::UNAUTHORIZED, reason.clone()),
			Error::Forbidden { reason } => (StatusCode::FORBIDDEN, reason.clone()),
			Error::Validation(_) => (StatusCode::UNAUTHORIZED, VALIDATION_FAILED.into()),
			Error::UpstreamRejected { endpoint: UpstreamEndpoint::Token, status: 400, body, .. } =>
				(StatusCode::BAD_REQUEST, body.clone()),
			Error::UpstreamRejected { .. }
			| Error::MalformedUpstreamResponse { .. }
			| Error::Config(_)
			| Error::Transport(_)
			| Error::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR.into()),
		};

		if status.is_server_error() {
			tracing::error!(error = %error, source = ?StdError::source(error), "request failed");
		} else {
			tracing::warn!(status = status.as_u16(), error = %error, "request rejected");
		}

		Self { status, message }
	}

	/// Renders the rejection as a plain-text response.
	pub fn into_response(self) -> Response<String> {
		let mut response = Response::new(self.message);

		*response.status_mut() = self.status;
		response
			.headers_mut()
			.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

		response
	}
}
impl From<Error> for Rejection {
	fn from(error: Error) -> Self {
		Self::from_error(&error)
	}
}

/// How derived tokens are obtained.
#[derive(Clone)]
pub enum ExchangeMode {
	/// Validate inbound tokens and cache derived tokens per caller.
	Cached {
		/// Inbound token validator.
		validator: Arc<dyn TokenValidator>,
		/// Derived token cache.
		cache: TokenCache,
	},
	/// Exchange on every request without local validation.
	Direct,
}
impl Debug for ExchangeMode {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::Cached { cache, .. } => f.debug_struct("Cached").field("cache", cache).finish(),
			Self::Direct => f.write_str("Direct"),
		}
	}
}

/// Request pipeline tying claim extraction, validation, caching, and exchange together.
pub struct BrokerPipeline<C = ReqwestHttpClient>
where
	C: ?Sized + TokenHttpClient,
{
	exchanger: OboExchanger<C>,
	mode: ExchangeMode,
}
impl BrokerPipeline<ReqwestHttpClient> {
	/// Wires the pipeline from configuration.
	///
	/// The credential backend follows [`BrokerConfig::credential_backend`], and a non-zero cache
	/// budget selects [`ExchangeMode::Cached`].
	pub fn from_config(config: &BrokerConfig) -> Result<Self> {
		config.validate()?;

		let http_client = ReqwestHttpClient::new()?;
		let credentials: Arc<dyn CredentialResolver> = match config.credential_backend() {
			CredentialBackend::RemoteStore { vault } => {
				let ambient = ChainedCredential::from_kinds(
					&config.credential_types,
					&ProcessEnvironment,
					&http_client,
				)?;
				let store = KeyVaultSecretStore::new(vault, http_client.0.clone(), Arc::new(ambient))?;

				Arc::new(RemoteStoreCredentials::new(store))
			},
			CredentialBackend::Static(pair) => Arc::new(StaticCredentials::new(pair)),
			CredentialBackend::Environment => Arc::new(EnvironmentCredentials::new()),
		};
		let mut settings = ExchangeSettings::new(config.scope.clone());
		let mut validator_settings = ValidatorSettings::default();

		if let Some(authority) = &config.authority {
			settings = settings.with_authority(authority.clone());
			validator_settings = validator_settings.with_authority(authority.clone());
		}

		let exchanger = OboExchanger::new(settings, credentials)
			.with_http_client::<ReqwestHttpClient>(http_client.clone());
		let mode = match config.cache_budget_bytes() {
			0 => ExchangeMode::Direct,
			budget => ExchangeMode::Cached {
				validator: Arc::new(TenantSignatureValidator::with_client(
					validator_settings,
					http_client.0.clone(),
				)),
				cache: TokenCache::new(budget),
			},
		};

		tracing::info!(mode = ?mode, "broker pipeline configured");

		Ok(Self::new(exchanger, mode))
	}
}
impl<C> BrokerPipeline<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Assembles a pipeline from parts.
	pub fn new(exchanger: OboExchanger<C>, mode: ExchangeMode) -> Self {
		Self { exchanger, mode }
	}

	/// Active mode.
	pub fn mode(&self) -> &ExchangeMode {
		&self.mode
	}

	/// Exchanger used on cache misses and in direct mode.
	pub fn exchanger(&self) -> &OboExchanger<C> {
		&self.exchanger
	}

	/// Authorizes `request`, publishing an [`OboToken`] in its extensions on success.
	pub async fn authorize<B>(&self, request: &mut Request<B>) -> Result<(), Rejection> {
		let header = request.headers().get(AUTHORIZATION).and_then(|value| value.to_str().ok());
		let token = self.derive(header).await.map_err(Rejection::from)?;

		request.extensions_mut().insert(token);

		Ok(())
	}

	/// Derives a downstream token from an `Authorization` header value.
	pub async fn derive(&self, authorization: Option<&str>) -> Result<OboToken> {
		const STAGE: Stage = Stage::Pipeline;

		let span = StageSpan::new(STAGE, None);

		obs::record_stage_outcome(STAGE, StageOutcome::Attempt);

		let result = span.instrument(self.derive_once(authorization)).await;

		obs::record_stage_outcome(STAGE, StageOutcome::of(&result));

		result
	}

	async fn derive_once(&self, authorization: Option<&str>) -> Result<OboToken> {
		let raw = bearer_token(authorization).ok_or_else(|| Error::unauthenticated(MISSING_BEARER))?;
		let claims = InboundClaims::extract(raw)?;
		let tenant = claims.tenant()?;

		match &self.mode {
			ExchangeMode::Cached { validator, cache } => {
				let subject = claims.subject()?;
				let audience = claims.audience()?;

				validator.validate(raw).await?;

				let key = CacheKey::new(tenant.clone(), subject);
				let exchanger = self.exchanger.clone();
				let assertion = raw.to_owned();
				let entry = cache
					.get_or_exchange(key, audience, move || async move {
						exchanger.exchange(&tenant, &assertion).await
					})
					.await?;

				Ok(OboToken::new(entry.token))
			},
			ExchangeMode::Direct =>
				self.exchanger.exchange(&tenant, raw).await.map(OboToken::new),
		}
	}
}
impl<C> Debug for BrokerPipeline<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("BrokerPipeline")
			.field("exchanger", &self.exchanger)
			.field("mode", &self.mode)
			.finish()
	}
}

/// Extracts the token from a `Bearer` authorization value; the scheme is case-insensitive.
fn bearer_token(authorization: Option<&str>) -> Option<&str> {
	let value = authorization?.trim();
	let (scheme, token) = value.split_once(' ')?;
	let token = token.trim();

	(scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::{ConfigError, ValidationError};

	#[test]
	fn bearer_scheme_is_case_insensitive() {
		assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
		assert_eq!(bearer_token(Some("bearer  abc ")), Some("abc"));
		assert_eq!(bearer_token(Some("BEARER abc")), Some("abc"));
		assert_eq!(bearer_token(Some("Basic abc")), None);
		assert_eq!(bearer_token(Some("Bearer ")), None);
		assert_eq!(bearer_token(Some("Bearer")), None);
		assert_eq!(bearer_token(None), None);
	}

	#[test]
	fn rejections_follow_the_status_table() {
		let cases = [
			(Error::unauthenticated("who?"), StatusCode::UNAUTHORIZED, "who?"),
			(Error::forbidden("no"), StatusCode::FORBIDDEN, "no"),
			(
				Error::Validation(ValidationError::MissingKeyId),
				StatusCode::UNAUTHORIZED,
				VALIDATION_FAILED,
			),
			(
				Error::upstream_rejected(UpstreamEndpoint::Token, 400, "{\"error\":\"invalid_grant\"}"),
				StatusCode::BAD_REQUEST,
				"{\"error\":\"invalid_grant\"}",
			),
			(
				Error::upstream_rejected(UpstreamEndpoint::Token, 401, "nope"),
				StatusCode::INTERNAL_SERVER_ERROR,
				INTERNAL_ERROR,
			),
			(
				Error::upstream_rejected(UpstreamEndpoint::Discovery, 400, "bad"),
				StatusCode::INTERNAL_SERVER_ERROR,
				INTERNAL_ERROR,
			),
			(
				Error::malformed(UpstreamEndpoint::Token, "no token"),
				StatusCode::INTERNAL_SERVER_ERROR,
				INTERNAL_ERROR,
			),
			(
				Error::from(ConfigError::MissingSetting { name: "SCOPE" }),
				StatusCode::INTERNAL_SERVER_ERROR,
				INTERNAL_ERROR,
			),
		];

		for (error, status, message) in cases {
			let rejection = Rejection::from_error(&error);

			assert_eq!(rejection.status, status, "{error:?}");
			assert_eq!(rejection.message, message, "{error:?}");
		}
	}

	#[test]
	fn rejection_renders_plain_text() {
		let response = Rejection { status: StatusCode::FORBIDDEN, message: "no".into() }.into_response();

		assert_eq!(response.status(), StatusCode::FORBIDDEN);
		assert_eq!(response.body(), "no");
		assert_eq!(
			response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
			Some("text/plain; charset=utf-8")
		);
	}

	#[test]
	fn missing_context_token_is_forbidden() {
		let extensions = Extensions::new();
		let err = OboToken::from_extensions(&extensions).expect_err("Absent token must fail.");

		assert!(matches!(err, Error::Forbidden { .. }));

		let mut extensions = Extensions::new();

		extensions.insert(OboToken::new(TokenSecret::new("derived")));

		assert_eq!(
			OboToken::from_extensions(&extensions).expect("Token should be present.").expose(),
			"derived"
		);
	}
}
