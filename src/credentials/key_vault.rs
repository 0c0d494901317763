//! Key Vault backed [`SecretStore`].

// crates.io
use reqwest::{StatusCode, header::ACCEPT};
// self
use crate::{
	_prelude::*,
	credentials::{AmbientCredential, SecretFuture, SecretStore},
	error::UpstreamEndpoint,
	http,
};

/// Reads secrets through the Key Vault REST API using an ambient bearer token.
pub struct KeyVaultSecretStore {
	vault: Url,
	client: ReqwestClient,
	credential: Arc<dyn AmbientCredential>,
}
impl KeyVaultSecretStore {
	/// Secrets API version.
	pub const API_VERSION: &str = "7.4";
	/// Scope requested from the ambient credential.
	pub const SCOPE: &str = "https://vault.azure.net/.default";

	/// Creates a store for `vault`; the URL must use HTTPS.
	pub fn new(
		vault: Url,
		client: ReqwestClient,
		credential: Arc<dyn AmbientCredential>,
	) -> Result<Self> {
		http::enforce_https("KEYVAULT_URL", &vault)?;

		Ok(Self::new_unchecked(vault, client, credential))
	}

	/// Creates a store without the HTTPS requirement (local emulators and tests).
	pub fn new_unchecked(
		vault: Url,
		client: ReqwestClient,
		credential: Arc<dyn AmbientCredential>,
	) -> Self {
		Self { vault, client, credential }
	}

	/// URL of secret `name`.
	pub fn secret_url(&self, name: &str) -> Result<Url> {
		let mut url = http::parse_url(
			"secret_url",
			&format!("{}/secrets/{name}", self.vault.as_str().trim_end_matches('/')),
		)?;

		url.query_pairs_mut().append_pair("api-version", Self::API_VERSION);

		Ok(url)
	}

	async fn fetch(&self, name: &str) -> Result<Option<String>> {
		const ENDPOINT: UpstreamEndpoint = UpstreamEndpoint::SecretStore;

		let url = self.secret_url(name)?;
		let access = self.credential.token(Self::SCOPE).await?;
		let request = self
			.client
			.get(url)
			.bearer_auth(access.token.expose())
			.header(ACCEPT, "application/json");
		let (status, body) = http::send(ENDPOINT, request).await?;

		if status == StatusCode::NOT_FOUND {
			tracing::debug!(secret = name, "secret not found");

			return Ok(None);
		}
		if !status.is_success() {
			tracing::warn!(secret = name, status = status.as_u16(), "secret store rejected the read");

			return Err(Error::upstream_rejected(
				ENDPOINT,
				status.as_u16(),
				String::from_utf8_lossy(&body).into_owned(),
			));
		}

		let bundle = http::parse_json::<SecretBundle>(ENDPOINT, &body)?;

		Ok(bundle.value.filter(|value| !value.is_empty()))
	}
}
impl SecretStore for KeyVaultSecretStore {
	fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
		Box::pin(self.fetch(name))
	}
}
impl Debug for KeyVaultSecretStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("KeyVaultSecretStore")
			.field("vault", &self.vault.as_str())
			.field("credential", &self.credential.kind())
			.finish_non_exhaustive()
	}
}

#[derive(Deserialize)]
struct SecretBundle {
	#[serde(default)]
	value: Option<String>,
}
