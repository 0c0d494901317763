//! Multi-tenant On-Behalf-Of broker: validate inbound bearer tokens against each tenant's
//! published keys, exchange them for resource-scoped tokens, and cache the results behind
//! single-flight guards.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod http;
pub mod obs;
pub mod pipeline;
pub mod validator;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// self
	use crate::{
		auth::CredentialPair,
		credentials::{CredentialResolver, StaticCredentials},
		exchange::{ExchangeSettings, OboExchanger, ReqwestOboExchanger},
		http::ReqwestHttpClient,
		validator::{TenantSignatureValidator, ValidatorSettings},
	};

	/// HMAC secret signing test tokens.
	pub const TEST_SIGNING_SECRET: &[u8] = b"0123456789abcdefghijklmnopqrstuvw";
	/// Key identifier published for [`TEST_SIGNING_SECRET`].
	pub const TEST_KID: &str = "test-key";
	/// Client identifier used by test fixtures.
	pub const TEST_CLIENT_ID: &str = "broker-client";
	/// Client secret used by test fixtures.
	pub const TEST_CLIENT_SECRET: &str = "broker-secret";
	/// Scope requested by test fixtures.
	pub const TEST_SCOPE: &str = "https://graph.microsoft.com/.default";

	/// Parses the base URL of a mock server into an authority.
	pub fn mock_authority(base: &str) -> Url {
		Url::parse(base).expect("Mock server base URL should parse.")
	}

	/// Builds exchange settings pointing at a mock authority.
	pub fn test_exchange_settings(authority: &Url) -> ExchangeSettings {
		ExchangeSettings::new(TEST_SCOPE).with_authority(authority.clone())
	}

	/// Constructs a reqwest-backed [`OboExchanger`] using static test credentials.
	pub fn build_test_exchanger(authority: &Url) -> ReqwestOboExchanger {
		let credentials: Arc<dyn CredentialResolver> = Arc::new(StaticCredentials::new(
			CredentialPair::new(TEST_CLIENT_ID, TEST_CLIENT_SECRET),
		));

		OboExchanger::new(test_exchange_settings(authority), credentials)
			.with_http_client(ReqwestHttpClient::default())
	}

	/// Signs `claims` with [`TEST_SIGNING_SECRET`] under key `kid`.
	pub fn mint_token(kid: &str, claims: &serde_json::Value) -> String {
		let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);

		header.kid = Some(kid.to_owned());

		jsonwebtoken::encode(
			&header,
			claims,
			&jsonwebtoken::EncodingKey::from_secret(TEST_SIGNING_SECRET),
		)
		.expect("Test token should encode.")
	}

	/// Builds a token whose claims the pipeline accepts for `tenant`/`subject`, issued by
	/// `authority` and expiring `ttl_secs` from now.
	pub fn inbound_claims(
		authority: &Url,
		tenant: &str,
		subject: &str,
		ttl_secs: i64,
	) -> serde_json::Value {
		let now = OffsetDateTime::now_utc().unix_timestamp();

		serde_json::json!({
			"iss": format!("{}/{tenant}/v2.0", authority.as_str().trim_end_matches('/')),
			"tid": tenant,
			"oid": subject,
			"aud": "api://broker",
			"iat": now,
			"exp": now + ttl_secs,
		})
	}

	/// Key set document publishing [`TEST_SIGNING_SECRET`] under each of `kids`.
	pub fn jwks_body(kids: &[&str]) -> String {
		let keys = kids
			.iter()
			.map(|kid| {
				serde_json::json!({
					"kty": "oct",
					"kid": kid,
					"alg": "HS256",
					"k": "MDEyMzQ1Njc4OWFiY2RlZmdoaWprbG1ub3BxcnN0dXZ3",
				})
			})
			.collect::<Vec<_>>();

		serde_json::json!({ "keys": keys }).to_string()
	}

	/// Discovery document pointing at `jwks_uri`.
	pub fn discovery_body(issuer: &str, jwks_uri: &str) -> String {
		serde_json::json!({ "issuer": issuer, "jwks_uri": jwks_uri }).to_string()
	}

	/// Derived token the mock token endpoint hands out, expiring `ttl_secs` from now.
	pub fn derived_token(label: &str, ttl_secs: i64) -> String {
		let exp = OffsetDateTime::now_utc().unix_timestamp() + ttl_secs;

		mint_token("downstream", &serde_json::json!({ "sub": label, "exp": exp }))
	}

	/// Constructs a signature validator that accepts plain-HTTP mock discovery endpoints and the
	/// HMAC keys used by test fixtures.
	pub fn build_test_validator(authority: &Url) -> TenantSignatureValidator {
		let settings = ValidatorSettings::default()
			.with_authority(authority.clone())
			.require_https(false)
			.with_algorithms([jsonwebtoken::Algorithm::HS256]);

		TenantSignatureValidator::new(settings).expect("Test validator should build.")
	}
}

mod _prelude {
	pub use std::{
		collections::HashMap,
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		hash::Hash,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::{Mutex as AsyncMutex, OnceCell as AsyncOnceCell};
	pub use parking_lot::{Mutex, RwLock};
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use jsonwebtoken;
pub use oauth2;
pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
