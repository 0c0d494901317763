//! Ambient credentials the broker uses to authenticate itself to the secret store.
//!
//! Two sources are supported, mirroring the `INCLUDE_CREDENTIAL_TYPES` values:
//!
//! - `env`: [`ClientSecretCredential`], a client-credentials grant configured through
//!   `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, and `AZURE_CLIENT_SECRET`.
//! - `mi`: [`ManagedIdentityCredential`], the platform's managed identity endpoint.
//!
//! [`ChainedCredential`] tries each configured source in order. Every source caches its tokens
//! until five minutes before they expire.

// std
use std::time::Duration as StdDuration;
// crates.io
use oauth2::{
	AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet, HttpClientError,
	RequestTokenError, Scope, TokenResponse, TokenUrl,
	basic::{BasicClient, BasicRequestTokenError, BasicTokenResponse},
};
// self
use crate::{
	_prelude::*,
	auth::{CredentialPair, TokenSecret},
	credentials::{ProcessEnvironment, VariableSource},
	error::{ConfigError, UpstreamEndpoint},
	http::{self, ReqwestHttpClient, ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
};

/// Boxed future returned by [`AmbientCredential::token`].
pub type AmbientFuture<'a> = Pin<Box<dyn Future<Output = Result<AccessToken>> + 'a + Send>>;

/// Bearer token obtained from an ambient credential.
#[derive(Clone, Debug)]
pub struct AccessToken {
	/// Token value.
	pub token: TokenSecret,
	/// Absolute expiry.
	pub expires_at: OffsetDateTime,
}
impl AccessToken {
	/// Tokens are reused only while more than this much lifetime remains.
	pub const REFRESH_MARGIN: Duration = Duration::minutes(5);

	/// Returns `true` while the token may still be handed out at `now`.
	pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
		self.expires_at - Self::REFRESH_MARGIN > now
	}
}

/// Source of bearer tokens for the broker's own identity.
pub trait AmbientCredential
where
	Self: 'static + Send + Sync,
{
	/// Short label used in logs (`env`, `mi`, `chain`).
	fn kind(&self) -> &'static str;

	/// Returns a token valid for `scope`.
	fn token<'a>(&'a self, scope: &'a str) -> AmbientFuture<'a>;
}

/// Ambient credential kinds selectable through configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AmbientCredentialKind {
	/// Client secret read from `AZURE_*` variables.
	Environment,
	/// Platform managed identity.
	ManagedIdentity,
}
impl FromStr for AmbientCredentialKind {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"env" => Ok(Self::Environment),
			"mi" => Ok(Self::ManagedIdentity),
			other => Err(ConfigError::InvalidSetting {
				name: "INCLUDE_CREDENTIAL_TYPES",
				reason: format!("unknown credential type `{other}`"),
			}),
		}
	}
}

/// Per-scope token cache shared by the ambient sources.
///
/// The async mutex is held across the fetch so concurrent callers wait for one token request.
#[derive(Debug, Default)]
struct TokenSlot(AsyncMutex<HashMap<String, AccessToken>>);
impl TokenSlot {
	async fn get_or_fetch<F, Fut>(&self, scope: &str, fetch: F) -> Result<AccessToken>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<AccessToken>>,
	{
		let mut tokens = self.0.lock().await;

		if let Some(token) =
			tokens.get(scope).filter(|token| token.is_usable_at(OffsetDateTime::now_utc()))
		{
			return Ok(token.clone());
		}

		let token = fetch().await?;

		tokens.insert(scope.to_owned(), token.clone());

		Ok(token)
	}
}

type ConfiguredBasicClient =
	BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Client-credentials grant against the configured authority.
#[derive(Debug)]
pub struct ClientSecretCredential {
	tenant: String,
	pair: CredentialPair,
	authority: Option<Url>,
	http_client: ReqwestHttpClient,
	cache: TokenSlot,
}
impl ClientSecretCredential {
	/// Creates a credential for `tenant` using `pair`.
	pub fn new(tenant: impl Into<String>, pair: CredentialPair, client: ReqwestClient) -> Self {
		Self {
			tenant: tenant.into(),
			pair,
			authority: None,
			http_client: ReqwestHttpClient::with_client(client),
			cache: TokenSlot::default(),
		}
	}

	/// Builds the credential from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, and `AZURE_CLIENT_SECRET`;
	/// `None` when any of them is unset.
	pub fn from_source(source: &impl VariableSource, client: ReqwestClient) -> Option<Self> {
		let tenant = source.var("AZURE_TENANT_ID").filter(|value| !value.is_empty())?;
		let pair = CredentialPair::from_parts(
			source.var("AZURE_CLIENT_ID"),
			source.var("AZURE_CLIENT_SECRET"),
		)?;

		Some(Self::new(tenant, pair, client))
	}

	/// [`ClientSecretCredential::from_source`] over the process environment.
	pub fn from_env(client: ReqwestClient) -> Option<Self> {
		Self::from_source(&ProcessEnvironment, client)
	}

	/// Overrides the identity provider host.
	pub fn with_authority(mut self, authority: Url) -> Self {
		self.authority = Some(authority);

		self
	}

	fn oauth_client(&self) -> Result<ConfiguredBasicClient> {
		let token_url = http::parse_url(
			"ambient_token_endpoint",
			&format!(
				"{}/{}/oauth2/v2.0/token",
				http::authority_root(self.authority.as_ref()),
				self.tenant
			),
		)?;

		Ok(BasicClient::new(ClientId::new(self.pair.client_id.clone()))
			.set_client_secret(ClientSecret::new(self.pair.client_secret.expose().to_owned()))
			.set_auth_type(AuthType::RequestBody)
			.set_token_uri(TokenUrl::from_url(token_url)))
	}

	async fn fetch(&self, scope: &str) -> Result<AccessToken> {
		let oauth_client = self.oauth_client()?;
		let meta = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(meta.clone());
		let response = oauth_client
			.exchange_client_credentials()
			.add_scope(Scope::new(scope.to_owned()))
			.request_async(&handle)
			.await
			.map_err(|e| map_request_error(meta.take(), e))?;

		map_token_response(&response)
	}
}
impl AmbientCredential for ClientSecretCredential {
	fn kind(&self) -> &'static str {
		"env"
	}

	fn token<'a>(&'a self, scope: &'a str) -> AmbientFuture<'a> {
		Box::pin(self.cache.get_or_fetch(scope, || self.fetch(scope)))
	}
}

/// Managed identity token source.
///
/// Uses the App Service style endpoint when `IDENTITY_ENDPOINT` and `IDENTITY_HEADER` are set,
/// and the instance metadata endpoint otherwise.
#[derive(Debug)]
pub struct ManagedIdentityCredential {
	endpoint: ManagedIdentityEndpoint,
	client_id: Option<String>,
	client: ReqwestClient,
	cache: TokenSlot,
}
impl ManagedIdentityCredential {
	/// Instance metadata token endpoint.
	pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

	const IMDS_API_VERSION: &str = "2018-02-01";
	const IMDS_TIMEOUT: StdDuration = StdDuration::from_secs(5);
	const APP_SERVICE_API_VERSION: &str = "2019-08-01";

	/// Detects the endpoint from `source`; user-assigned identities are selected through
	/// `AZURE_CLIENT_ID`.
	pub fn from_source(source: &impl VariableSource, client: ReqwestClient) -> Result<Self> {
		let endpoint = match (source.var("IDENTITY_ENDPOINT"), source.var("IDENTITY_HEADER")) {
			(Some(url), Some(header)) if !url.is_empty() && !header.is_empty() =>
				ManagedIdentityEndpoint::AppService {
					url: http::parse_url("IDENTITY_ENDPOINT", &url)?,
					header: TokenSecret::new(header),
				},
			_ => ManagedIdentityEndpoint::Imds {
				url: http::parse_url("IMDS_ENDPOINT", Self::IMDS_ENDPOINT)?,
			},
		};
		let client_id = source.var("AZURE_CLIENT_ID").filter(|value| !value.is_empty());

		Ok(Self { endpoint, client_id, client, cache: TokenSlot::default() })
	}

	/// [`ManagedIdentityCredential::from_source`] over the process environment.
	pub fn from_env(client: ReqwestClient) -> Result<Self> {
		Self::from_source(&ProcessEnvironment, client)
	}

	/// Uses an explicit instance-metadata style endpoint.
	pub fn with_imds_endpoint(mut self, url: Url) -> Self {
		self.endpoint = ManagedIdentityEndpoint::Imds { url };

		self
	}

	async fn fetch(&self, scope: &str) -> Result<AccessToken> {
		let resource = scope.strip_suffix("/.default").unwrap_or(scope);
		let mut query = vec![("resource", resource)];
		let request = match &self.endpoint {
			ManagedIdentityEndpoint::Imds { url } => {
				query.push(("api-version", Self::IMDS_API_VERSION));

				self.client.get(url.clone()).header("Metadata", "true").timeout(Self::IMDS_TIMEOUT)
			},
			ManagedIdentityEndpoint::AppService { url, header } => {
				query.push(("api-version", Self::APP_SERVICE_API_VERSION));

				self.client.get(url.clone()).header("X-IDENTITY-HEADER", header.expose())
			},
		};

		if let Some(client_id) = &self.client_id {
			query.push(("client_id", client_id.as_str()));
		}

		fetch_managed_identity_token(request.query(&query)).await
	}
}
impl AmbientCredential for ManagedIdentityCredential {
	fn kind(&self) -> &'static str {
		"mi"
	}

	fn token<'a>(&'a self, scope: &'a str) -> AmbientFuture<'a> {
		Box::pin(self.cache.get_or_fetch(scope, || self.fetch(scope)))
	}
}

#[derive(Debug)]
enum ManagedIdentityEndpoint {
	Imds { url: Url },
	AppService { url: Url, header: TokenSecret },
}

/// Tries each source in order, returning the first token obtained.
pub struct ChainedCredential {
	sources: Vec<Arc<dyn AmbientCredential>>,
}
impl ChainedCredential {
	/// Chains `sources` in order.
	pub fn new(sources: Vec<Arc<dyn AmbientCredential>>) -> Self {
		Self { sources }
	}

	/// Builds the chain for the configured kinds; environment sources whose variables are unset
	/// are skipped.
	pub fn from_kinds(
		kinds: &[AmbientCredentialKind],
		source: &impl VariableSource,
		client: &ReqwestHttpClient,
	) -> Result<Self> {
		let mut sources: Vec<Arc<dyn AmbientCredential>> = Vec::with_capacity(kinds.len());

		for kind in kinds {
			match kind {
				AmbientCredentialKind::Environment => {
					if let Some(credential) =
						ClientSecretCredential::from_source(source, client.0.clone())
					{
						sources.push(Arc::new(credential));
					}
				},
				AmbientCredentialKind::ManagedIdentity => {
					let credential = ManagedIdentityCredential::from_source(source, client.0.clone())?;

					sources.push(Arc::new(credential));
				},
			}
		}

		Ok(Self::new(sources))
	}

	/// Number of chained sources.
	pub fn len(&self) -> usize {
		self.sources.len()
	}

	/// Returns `true` when no source is configured.
	pub fn is_empty(&self) -> bool {
		self.sources.is_empty()
	}
}
impl AmbientCredential for ChainedCredential {
	fn kind(&self) -> &'static str {
		"chain"
	}

	fn token<'a>(&'a self, scope: &'a str) -> AmbientFuture<'a> {
		Box::pin(async move {
			let mut last_error = None;

			for source in &self.sources {
				match source.token(scope).await {
					Ok(token) => return Ok(token),
					Err(e) => {
						tracing::debug!(kind = source.kind(), error = %e, "ambient credential failed");

						last_error = Some(e);
					},
				}
			}

			Err(last_error.unwrap_or_else(|| {
				ConfigError::MissingSetting { name: "INCLUDE_CREDENTIAL_TYPES" }.into()
			}))
		})
	}
}
impl Debug for ChainedCredential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_list().entries(self.sources.iter().map(|source| source.kind())).finish()
	}
}

const AMBIENT_ENDPOINT: UpstreamEndpoint = UpstreamEndpoint::AmbientCredential;

fn map_request_error<E>(
	meta: Option<ResponseMetadata>,
	err: BasicRequestTokenError<HttpClientError<E>>,
) -> Error
where
	E: 'static + Send + Sync + StdError,
{
	let status = meta.and_then(|meta| meta.status);

	match err {
		RequestTokenError::ServerResponse(response) => {
			let body = serde_json::to_string(&response)
				.unwrap_or_else(|_| response.error().as_ref().to_owned());

			Error::upstream_rejected(AMBIENT_ENDPOINT, status.unwrap_or(400), body)
		},
		RequestTokenError::Request(error) => http::map_transport_error(AMBIENT_ENDPOINT, error),
		RequestTokenError::Parse(error, _body) => match status {
			Some(status) if !(200..300).contains(&status) =>
				Error::upstream_rejected(AMBIENT_ENDPOINT, status, error.to_string()),
			_ => Error::malformed(AMBIENT_ENDPOINT, error.to_string()),
		},
		RequestTokenError::Other(message) => match status {
			Some(status) => Error::upstream_rejected(AMBIENT_ENDPOINT, status, message),
			None => Error::malformed(AMBIENT_ENDPOINT, message),
		},
	}
}

fn map_token_response(response: &BasicTokenResponse) -> Result<AccessToken> {
	let token = response.access_token().secret();

	if token.is_empty() {
		return Err(Error::malformed(AMBIENT_ENDPOINT, "response carried no access_token"));
	}

	let expires_in = response
		.expires_in()
		.ok_or_else(|| Error::malformed(AMBIENT_ENDPOINT, "response carried no expires_in"))?;
	let expires_in = i64::try_from(expires_in.as_secs())
		.map_err(|_| Error::malformed(AMBIENT_ENDPOINT, "expires_in is out of range"))?;

	Ok(AccessToken {
		token: TokenSecret::new(token.to_owned()),
		expires_at: OffsetDateTime::now_utc() + Duration::seconds(expires_in),
	})
}

/// Seconds as sent by managed identity endpoints, which quote them as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
	Number(i64),
	Text(String),
}
impl Seconds {
	fn get(&self) -> Option<i64> {
		match self {
			Self::Number(secs) => Some(*secs),
			Self::Text(raw) => raw.trim().parse().ok(),
		}
	}
}

#[derive(Deserialize)]
struct ManagedIdentityTokenResponse {
	#[serde(default)]
	access_token: Option<String>,
	#[serde(default)]
	expires_in: Option<Seconds>,
	#[serde(default)]
	expires_on: Option<Seconds>,
}

async fn fetch_managed_identity_token(request: reqwest::RequestBuilder) -> Result<AccessToken> {
	let (status, body) = http::send(AMBIENT_ENDPOINT, request).await?;

	if !status.is_success() {
		return Err(Error::upstream_rejected(
			AMBIENT_ENDPOINT,
			status.as_u16(),
			String::from_utf8_lossy(&body).into_owned(),
		));
	}

	let response = http::parse_json::<ManagedIdentityTokenResponse>(AMBIENT_ENDPOINT, &body)?;
	let token = response
		.access_token
		.filter(|token| !token.is_empty())
		.ok_or_else(|| Error::malformed(AMBIENT_ENDPOINT, "response carried no access_token"))?;
	let now = OffsetDateTime::now_utc();
	let expires_at = response
		.expires_on
		.as_ref()
		.and_then(Seconds::get)
		.and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
		.or_else(|| {
			let secs = response.expires_in.as_ref().and_then(Seconds::get)?;

			Some(now + Duration::seconds(secs))
		})
		.ok_or_else(|| Error::malformed(AMBIENT_ENDPOINT, "response carried no expiry"))?;

	Ok(AccessToken { token: TokenSecret::new(token), expires_at })
}
