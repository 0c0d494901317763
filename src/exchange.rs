//! On-Behalf-Of token exchange against a tenant's token endpoint.
//!
//! [`OboExchanger::exchange`] resolves the broker's client credentials for the inbound token's
//! tenant, then trades the inbound assertion for a token scoped to the configured downstream
//! resource. The exchanger is generic over [`TokenHttpClient`] so integrators can swap the HTTP
//! stack; [`ReqwestOboExchanger`] is the default.

// crates.io
use oauth2::{
	AsyncHttpClient,
	http::{
		Method, Request,
		header::{ACCEPT, CONTENT_TYPE},
	},
};
use url::form_urlencoded::Serializer;
// self
use crate::{
	_prelude::*,
	auth::{TenantId, TokenSecret},
	credentials::CredentialResolver,
	error::{ConfigError, UpstreamEndpoint},
	http::{self, ReqwestHttpClient, ResponseMetadataSlot, TokenHttpClient},
	obs::{self, Stage, StageOutcome, StageSpan},
};

/// Grant type used for the On-Behalf-Of exchange.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Value of the `requested_token_use` form field.
pub const ON_BEHALF_OF: &str = "on_behalf_of";

/// Exchanger alias using the default reqwest transport.
pub type ReqwestOboExchanger = OboExchanger<ReqwestHttpClient>;

/// Downstream scope and authority used for every exchange.
#[derive(Clone, Debug)]
pub struct ExchangeSettings {
	/// Scope requested for the derived token (for example `https://graph.microsoft.com/.default`).
	pub scope: String,
	authority: Option<Url>,
}
impl ExchangeSettings {
	/// Creates settings for `scope` against the default authority.
	pub fn new(scope: impl Into<String>) -> Self {
		Self { scope: scope.into(), authority: None }
	}

	/// Overrides the identity provider host.
	pub fn with_authority(mut self, authority: Url) -> Self {
		self.authority = Some(authority);

		self
	}

	/// Token endpoint for `tenant`: `{authority}/{tenant}/oauth2/v2.0/token`.
	pub fn token_endpoint(&self, tenant: &TenantId) -> Result<Url> {
		http::parse_url(
			"token_endpoint",
			&format!("{}/{tenant}/oauth2/v2.0/token", http::authority_root(self.authority.as_ref())),
		)
	}
}

/// Performs the delegated `jwt-bearer` exchange.
pub struct OboExchanger<C = ReqwestHttpClient>
where
	C: ?Sized + TokenHttpClient,
{
	settings: Arc<ExchangeSettings>,
	credentials: Arc<dyn CredentialResolver>,
	http_client: Arc<C>,
}
impl OboExchanger<ReqwestHttpClient> {
	/// Creates an exchanger backed by a default [`ReqwestHttpClient`].
	pub fn new(settings: ExchangeSettings, credentials: Arc<dyn CredentialResolver>) -> Self {
		Self {
			settings: Arc::new(settings),
			credentials,
			http_client: Arc::new(ReqwestHttpClient::default()),
		}
	}
}
impl<C> OboExchanger<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Swaps the HTTP transport.
	pub fn with_http_client<C2>(self, http_client: impl Into<Arc<C2>>) -> OboExchanger<C2>
	where
		C2: ?Sized + TokenHttpClient,
	{
		OboExchanger {
			settings: self.settings,
			credentials: self.credentials,
			http_client: http_client.into(),
		}
	}

	/// Settings applied to every exchange.
	pub fn settings(&self) -> &ExchangeSettings {
		&self.settings
	}

	/// Credential backend consulted before each exchange.
	pub fn credentials(&self) -> &Arc<dyn CredentialResolver> {
		&self.credentials
	}

	/// Exchanges `assertion` for a token scoped to [`ExchangeSettings::scope`].
	pub async fn exchange(&self, tenant: &TenantId, assertion: &str) -> Result<TokenSecret> {
		const STAGE: Stage = Stage::Exchange;

		let span = StageSpan::new(STAGE, Some(tenant.as_ref()));

		obs::record_stage_outcome(STAGE, StageOutcome::Attempt);

		let result = span.instrument(self.exchange_once(tenant, assertion)).await;

		obs::record_stage_outcome(STAGE, StageOutcome::of(&result));

		result
	}

	async fn exchange_once(&self, tenant: &TenantId, assertion: &str) -> Result<TokenSecret> {
		let credentials = self.credentials.resolve(tenant).await?;
		let endpoint = self.settings.token_endpoint(tenant)?;
		let form = Serializer::new(String::new())
			.append_pair("grant_type", JWT_BEARER_GRANT)
			.append_pair("client_id", &credentials.client_id)
			.append_pair("client_secret", credentials.client_secret.expose())
			.append_pair("assertion", assertion)
			.append_pair("scope", &self.settings.scope)
			.append_pair("requested_token_use", ON_BEHALF_OF)
			.finish();
		let request = Request::builder()
			.method(Method::POST)
			.uri(endpoint.as_str())
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.header(ACCEPT, "application/json")
			.body(form.into_bytes())
			.map_err(ConfigError::http_request)?;
		let meta = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(meta.clone());
		let response = handle
			.call(request)
			.await
			.map_err(|e| http::map_transport_error(UpstreamEndpoint::Token, e))?;
		let status = response.status();

		if !status.is_success() {
			let retry_after = meta.take().and_then(|meta| meta.retry_after);

			tracing::warn!(
				tenant = %tenant,
				status = status.as_u16(),
				retry_after = ?retry_after,
				"token endpoint rejected the exchange"
			);

			return Err(Error::upstream_rejected(
				UpstreamEndpoint::Token,
				status.as_u16(),
				String::from_utf8_lossy(response.body()).into_owned(),
			));
		}

		let body = http::parse_json::<ExchangeResponse>(UpstreamEndpoint::Token, response.body())?;

		match body.access_token {
			Some(token) if !token.is_empty() => {
				tracing::debug!(tenant = %tenant, "exchange succeeded");

				Ok(TokenSecret::new(token))
			},
			_ => Err(Error::malformed(UpstreamEndpoint::Token, "response carried no access_token")),
		}
	}
}
impl<C> Clone for OboExchanger<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn clone(&self) -> Self {
		Self {
			settings: self.settings.clone(),
			credentials: self.credentials.clone(),
			http_client: self.http_client.clone(),
		}
	}
}
impl<C> Debug for OboExchanger<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("OboExchanger").field("settings", &self.settings).finish_non_exhaustive()
	}
}

#[derive(Deserialize)]
struct ExchangeResponse {
	#[serde(default)]
	access_token: Option<String>,
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn token_endpoint_uses_tenant_path() {
		let tenant = TenantId::new("tenant-a").expect("Tenant fixture should be valid.");
		let default = ExchangeSettings::new("scope");

		assert_eq!(
			default.token_endpoint(&tenant).expect("Default endpoint should build.").as_str(),
			"https://login.microsoftonline.com/tenant-a/oauth2/v2.0/token"
		);

		let custom = default.with_authority(
			Url::parse("http://127.0.0.1:9000/").expect("Fixture URL should parse."),
		);

		assert_eq!(
			custom.token_endpoint(&tenant).expect("Custom endpoint should build.").as_str(),
			"http://127.0.0.1:9000/tenant-a/oauth2/v2.0/token"
		);
	}
}
