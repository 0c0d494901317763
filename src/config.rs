//! Environment-driven broker configuration.
//!
//! The library never loads `.env` files; hosts that want them should populate the process
//! environment first. Empty values count as unset.

// self
use crate::{
	_prelude::*,
	auth::{CredentialPair, TokenSecret},
	credentials::{AmbientCredentialKind, ProcessEnvironment, VariableSource},
	error::ConfigError,
	http,
};

/// Listening port used when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 5000;

const PORT: &str = "PORT";
const CACHE_SIZE_IN_MB: &str = "CACHE_SIZE_IN_MB";
const CLIENT_ID: &str = "CLIENT_ID";
const CLIENT_SECRET: &str = "CLIENT_SECRET";
const SCOPE: &str = "SCOPE";
const KEYVAULT_URL: &str = "KEYVAULT_URL";
const AUTHORITY_HOST: &str = "AUTHORITY_HOST";
const INCLUDE_CREDENTIAL_TYPES: &str = "INCLUDE_CREDENTIAL_TYPES";

/// Broker settings.
#[derive(Clone)]
pub struct BrokerConfig {
	/// Port the host should listen on.
	pub port: u16,
	/// Token cache budget in mebibytes; `0` selects direct mode.
	pub cache_size_mb: u64,
	/// Broker client identifier shared by every tenant.
	pub client_id: Option<String>,
	/// Broker client secret shared by every tenant.
	pub client_secret: Option<TokenSecret>,
	/// Scope requested for derived tokens.
	pub scope: String,
	/// Remote secret store holding per-tenant credentials.
	pub key_vault_url: Option<Url>,
	/// Identity provider host override.
	pub authority: Option<Url>,
	/// Ambient credential sources used against the secret store, in order.
	pub credential_types: Vec<AmbientCredentialKind>,
}
impl BrokerConfig {
	/// Reads and validates the configuration from the process environment.
	pub fn from_env() -> Result<Self> {
		Self::from_source(&ProcessEnvironment)
	}

	/// Reads and validates the configuration from `source`.
	pub fn from_source(source: &impl VariableSource) -> Result<Self> {
		let var = |name: &str| source.var(name).filter(|value| !value.trim().is_empty());
		let port = match var(PORT) {
			Some(raw) => parse_number(PORT, &raw)?,
			None => DEFAULT_PORT,
		};
		let cache_size_mb = match var(CACHE_SIZE_IN_MB) {
			Some(raw) => parse_number(CACHE_SIZE_IN_MB, &raw)?,
			None => 0,
		};
		let key_vault_url =
			var(KEYVAULT_URL).map(|raw| http::parse_url(KEYVAULT_URL, raw.trim())).transpose()?;
		let authority =
			var(AUTHORITY_HOST).map(|raw| http::parse_url(AUTHORITY_HOST, raw.trim())).transpose()?;
		let credential_types = match var(INCLUDE_CREDENTIAL_TYPES) {
			Some(raw) => raw
				.split(',')
				.filter(|kind| !kind.trim().is_empty())
				.map(AmbientCredentialKind::from_str)
				.collect::<Result<Vec<_>, _>>()?,
			None =>
				vec![AmbientCredentialKind::Environment, AmbientCredentialKind::ManagedIdentity],
		};
		let config = Self {
			port,
			cache_size_mb,
			client_id: var(CLIENT_ID),
			client_secret: var(CLIENT_SECRET).map(TokenSecret::new),
			scope: var(SCOPE).unwrap_or_default(),
			key_vault_url,
			authority,
			credential_types,
		};

		config.validate()?;

		Ok(config)
	}

	/// Checks the settings, reporting the first problem found.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.scope.trim().is_empty() {
			return Err(ConfigError::MissingSetting { name: SCOPE });
		}
		if let Some(vault) = &self.key_vault_url {
			http::enforce_https(KEYVAULT_URL, vault)?;

			if self.credential_types.is_empty() {
				return Err(ConfigError::MissingSetting { name: INCLUDE_CREDENTIAL_TYPES });
			}
		}
		if let Some(authority) = &self.authority {
			http::enforce_https(AUTHORITY_HOST, authority)?;
		}

		match (&self.client_id, &self.client_secret) {
			(Some(_), None) => Err(ConfigError::MissingSetting { name: CLIENT_SECRET }),
			(None, Some(_)) => Err(ConfigError::MissingSetting { name: CLIENT_ID }),
			_ => Ok(()),
		}
	}

	/// Token cache budget in bytes.
	pub fn cache_budget_bytes(&self) -> usize {
		usize::try_from(self.cache_size_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
	}

	/// Selects where per-tenant client credentials come from.
	///
	/// A vault URL wins, then a static client pair, then per-tenant environment variables.
	pub fn credential_backend(&self) -> CredentialBackend {
		if let Some(vault) = &self.key_vault_url {
			return CredentialBackend::RemoteStore { vault: vault.clone() };
		}

		match (&self.client_id, &self.client_secret) {
			(Some(id), Some(secret)) =>
				CredentialBackend::Static(CredentialPair::new(id.clone(), secret.expose())),
			_ => CredentialBackend::Environment,
		}
	}
}
impl Debug for BrokerConfig {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("BrokerConfig")
			.field("port", &self.port)
			.field("cache_size_mb", &self.cache_size_mb)
			.field("client_id", &self.client_id)
			.field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
			.field("scope", &self.scope)
			.field("key_vault_url", &self.key_vault_url.as_ref().map(Url::as_str))
			.field("authority", &self.authority.as_ref().map(Url::as_str))
			.field("credential_types", &self.credential_types)
			.finish()
	}
}

/// Per-tenant credential backend chosen by [`BrokerConfig::credential_backend`].
#[derive(Clone, Debug)]
pub enum CredentialBackend {
	/// Per-tenant secrets in a remote store.
	RemoteStore {
		/// Vault base URL.
		vault: Url,
	},
	/// One client pair for every tenant.
	Static(CredentialPair),
	/// `{tenant}_CLIENT_ID` and `{tenant}_CLIENT_SECRET` from the process environment.
	Environment,
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
	T: FromStr,
	T::Err: Display,
{
	raw.trim()
		.parse()
		.map_err(|e| ConfigError::InvalidSetting { name, reason: format!("`{raw}`: {e}") })
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
	}

	#[test]
	fn defaults_apply_when_only_scope_is_set() {
		let config = BrokerConfig::from_source(&source(&[(SCOPE, "api://downstream/.default")]))
			.expect("Minimal configuration should load.");

		assert_eq!(config.port, DEFAULT_PORT);
		assert_eq!(config.cache_size_mb, 0);
		assert_eq!(config.cache_budget_bytes(), 0);
		assert!(config.authority.is_none());
		assert_eq!(config.credential_types, [
			AmbientCredentialKind::Environment,
			AmbientCredentialKind::ManagedIdentity
		]);
		assert!(matches!(config.credential_backend(), CredentialBackend::Environment));
	}

	#[test]
	fn scope_is_required() {
		let err = BrokerConfig::from_source(&source(&[(PORT, "8080")]))
			.expect_err("Missing scope should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::MissingSetting { name: SCOPE })));
	}

	#[test]
	fn cache_budget_is_mebibytes() {
		let config = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(CACHE_SIZE_IN_MB, "4"),
		]))
		.expect("Configuration should load.");

		assert_eq!(config.cache_budget_bytes(), 4 * 1024 * 1024);
	}

	#[test]
	fn malformed_numbers_are_rejected() {
		let err = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(CACHE_SIZE_IN_MB, "lots"),
		]))
		.expect_err("Non-numeric cache size should be rejected.");

		assert!(matches!(
			err,
			Error::Config(ConfigError::InvalidSetting { name: CACHE_SIZE_IN_MB, .. })
		));
	}

	#[test]
	fn backend_prefers_vault_then_static_pair() {
		let vault = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(KEYVAULT_URL, "https://broker.vault.azure.net"),
			(CLIENT_ID, "id"),
			(CLIENT_SECRET, "secret"),
		]))
		.expect("Vault configuration should load.");

		assert!(matches!(vault.credential_backend(), CredentialBackend::RemoteStore { .. }));

		let fixed = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(CLIENT_ID, "id"),
			(CLIENT_SECRET, "secret"),
		]))
		.expect("Static configuration should load.");

		match fixed.credential_backend() {
			CredentialBackend::Static(pair) => {
				assert_eq!(pair.client_id, "id");
				assert_eq!(pair.client_secret.expose(), "secret");
			},
			other => panic!("Unexpected backend: {other:?}."),
		}
	}

	#[test]
	fn half_configured_client_pair_is_rejected() {
		let err = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(CLIENT_ID, "id"),
		]))
		.expect_err("A client id without a secret should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::MissingSetting { name: CLIENT_SECRET })));
	}

	#[test]
	fn endpoints_must_use_https() {
		let err = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(KEYVAULT_URL, "http://vault.local"),
		]))
		.expect_err("Plain-HTTP vault should be rejected.");

		assert!(matches!(
			err,
			Error::Config(ConfigError::InsecureEndpoint { name: KEYVAULT_URL, .. })
		));

		let err = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(AUTHORITY_HOST, "http://login.local"),
		]))
		.expect_err("Plain-HTTP authority should be rejected.");

		assert!(matches!(
			err,
			Error::Config(ConfigError::InsecureEndpoint { name: AUTHORITY_HOST, .. })
		));
	}

	#[test]
	fn credential_types_are_parsed_in_order() {
		let config = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(INCLUDE_CREDENTIAL_TYPES, "mi, env"),
		]))
		.expect("Configuration should load.");

		assert_eq!(config.credential_types, [
			AmbientCredentialKind::ManagedIdentity,
			AmbientCredentialKind::Environment
		]);

		let err = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(INCLUDE_CREDENTIAL_TYPES, "env,cli"),
		]))
		.expect_err("Unknown credential type should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::InvalidSetting { .. })));
	}

	#[test]
	fn debug_output_redacts_the_secret() {
		let config = BrokerConfig::from_source(&source(&[
			(SCOPE, "api://downstream/.default"),
			(CLIENT_ID, "id"),
			(CLIENT_SECRET, "hunter2"),
		]))
		.expect("Configuration should load.");

		assert!(!format!("{config:?}").contains("hunter2"));
	}
}
