//! Broker-level error types shared across the pipeline, exchanger, validator, and credential
//! backends.
//!
//! Every component returns one of these typed errors; only
//! [`Rejection::from_error`](crate::pipeline::Rejection::from_error) turns them into
//! caller-visible status codes. All variants are [`Clone`] because a coalesced token exchange
//! hands the same outcome to every waiter.

// self
use crate::_prelude::*;

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type SharedError = Arc<dyn StdError + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// No bearer token was presented, or it could not be decoded.
	#[error("{reason}")]
	Unauthenticated {
		/// Caller-facing explanation.
		reason: String,
	},
	/// The caller is authenticated (or routable) but not allowed to proceed.
	#[error("{reason}")]
	Forbidden {
		/// Caller-facing explanation; never contains secret material.
		reason: String,
	},
	/// An upstream endpoint answered with a non-success status.
	#[error("The {endpoint} endpoint rejected the request with HTTP {status}.")]
	UpstreamRejected {
		/// Endpoint that produced the response.
		endpoint: UpstreamEndpoint,
		/// HTTP status returned upstream.
		status: u16,
		/// OAuth `error` code when the body carried one.
		oauth_error: Option<String>,
		/// Raw response body.
		body: String,
	},
	/// An upstream endpoint answered successfully but the payload was unusable.
	#[error("The {endpoint} endpoint returned a malformed response: {reason}.")]
	MalformedUpstreamResponse {
		/// Endpoint that produced the response.
		endpoint: UpstreamEndpoint,
		/// Description of what was missing or unparseable.
		reason: String,
	},
	/// Inbound token failed signature, issuer, or lifetime validation.
	#[error(transparent)]
	Validation(#[from] ValidationError),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Anything else that should never reach the caller verbatim.
	#[error("Internal broker failure: {message}.")]
	Internal {
		/// Operator-facing detail.
		message: String,
	},
}
impl Error {
	/// Builds a [`Error::Forbidden`] with the provided caller-facing reason.
	pub fn forbidden(reason: impl Into<String>) -> Self {
		Self::Forbidden { reason: reason.into() }
	}

	/// Builds a [`Error::Unauthenticated`] with the provided caller-facing reason.
	pub fn unauthenticated(reason: impl Into<String>) -> Self {
		Self::Unauthenticated { reason: reason.into() }
	}

	/// Builds a [`Error::MalformedUpstreamResponse`] for `endpoint`.
	pub fn malformed(endpoint: UpstreamEndpoint, reason: impl Into<String>) -> Self {
		Self::MalformedUpstreamResponse { endpoint, reason: reason.into() }
	}

	/// Builds a [`Error::UpstreamRejected`], extracting the OAuth `error` field when the body is
	/// a JSON object carrying one.
	pub fn upstream_rejected(
		endpoint: UpstreamEndpoint,
		status: u16,
		body: impl Into<String>,
	) -> Self {
		let body = body.into();
		let oauth_error = serde_json::from_str::<serde_json::Value>(&body)
			.ok()
			.and_then(|value| value.get("error").and_then(|v| v.as_str()).map(str::to_owned));

		Self::UpstreamRejected { endpoint, status, oauth_error, body }
	}

	/// Wraps an unexpected failure.
	pub fn internal(message: impl Display) -> Self {
		Self::Internal { message: message.to_string() }
	}
}

/// Upstream endpoints the broker talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpstreamEndpoint {
	/// Tenant OpenID discovery document.
	Discovery,
	/// Tenant signing key set (`jwks_uri`).
	SigningKeys,
	/// Tenant token endpoint used for the On-Behalf-Of exchange.
	Token,
	/// Remote secret store holding per-tenant client credentials.
	SecretStore,
	/// Ambient credential source used to authenticate against the secret store.
	AmbientCredential,
}
impl UpstreamEndpoint {
	/// Returns a stable label suitable for log fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Discovery => "discovery",
			Self::SigningKeys => "signing-keys",
			Self::Token => "token",
			Self::SecretStore => "secret-store",
			Self::AmbientCredential => "ambient-credential",
		}
	}
}
impl Display for UpstreamEndpoint {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Inbound token validation failures.
#[derive(Clone, Debug, ThisError)]
pub enum ValidationError {
	/// Token does not carry a usable `tid` claim.
	#[error("Token does not contain a tenant identifier.")]
	MissingTenant,
	/// Token header could not be decoded.
	#[error("Token header is malformed.")]
	MalformedHeader {
		/// Decoder failure.
		#[source]
		source: Arc<jsonwebtoken::errors::Error>,
	},
	/// Token header does not name a signing key.
	#[error("Token header does not contain a key identifier.")]
	MissingKeyId,
	/// Token was signed with an algorithm the validator does not accept.
	#[error("Token algorithm {algorithm:?} is not accepted.")]
	DisallowedAlgorithm {
		/// Algorithm named in the token header.
		algorithm: jsonwebtoken::Algorithm,
	},
	/// The tenant's key set does not contain the referenced key.
	#[error("Signing key `{kid}` is not published for tenant `{tenant}`.")]
	UnknownSigningKey {
		/// Tenant identifier.
		tenant: String,
		/// Key identifier named in the token header.
		kid: String,
	},
	/// The published key could not be turned into a verification key.
	#[error("Signing key `{kid}` is unusable.")]
	UnusableKey {
		/// Key identifier.
		kid: String,
		/// Decoder failure.
		#[source]
		source: Arc<jsonwebtoken::errors::Error>,
	},
	/// Signature, issuer, or lifetime checks failed.
	#[error("Token was rejected: {source}.")]
	Rejected {
		/// Verification failure.
		#[source]
		source: Arc<jsonwebtoken::errors::Error>,
	},
}

/// Configuration and validation failures raised by the broker.
#[derive(Clone, Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: SharedError,
	},
	/// HTTP request construction failed.
	#[error("HTTP request could not be constructed.")]
	HttpRequest {
		/// Underlying request builder failure.
		#[source]
		source: SharedError,
	},
	/// A URL could not be parsed or joined.
	#[error("`{name}` is not a valid URL.")]
	InvalidUrl {
		/// Setting or endpoint name.
		name: &'static str,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// An endpoint must use HTTPS.
	#[error("`{name}` must use HTTPS but was {url}.")]
	InsecureEndpoint {
		/// Setting or endpoint name.
		name: &'static str,
		/// Offending URL.
		url: String,
	},
	/// A required setting is absent or empty.
	#[error("Required setting `{name}` is missing.")]
	MissingSetting {
		/// Setting name.
		name: &'static str,
	},
	/// A setting holds a value that cannot be used.
	#[error("Setting `{name}` is invalid: {reason}.")]
	InvalidSetting {
		/// Setting name.
		name: &'static str,
		/// Why the value was rejected.
		reason: String,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::HttpClientBuild { source: Arc::new(src) }
	}

	/// Wraps a request construction failure inside [`ConfigError`].
	pub fn http_request(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::HttpRequest { source: Arc::new(src) }
	}
}
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Transport-level failures (network, IO).
#[derive(Clone, Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the {endpoint} endpoint.")]
	Network {
		/// Endpoint being called.
		endpoint: UpstreamEndpoint,
		/// Transport-specific network error.
		#[source]
		source: SharedError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the {endpoint} endpoint.")]
	Io {
		/// Endpoint being called.
		endpoint: UpstreamEndpoint,
		/// IO failure.
		#[source]
		source: Arc<std::io::Error>,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(
		endpoint: UpstreamEndpoint,
		src: impl 'static + Send + Sync + StdError,
	) -> Self {
		Self::Network { endpoint, source: Arc::new(src) }
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn upstream_rejection_extracts_oauth_error() {
		let err = Error::upstream_rejected(
			UpstreamEndpoint::Token,
			400,
			"{\"error\":\"invalid_grant\",\"error_description\":\"AADSTS50013\"}",
		);

		match err {
			Error::UpstreamRejected { status, oauth_error, body, .. } => {
				assert_eq!(status, 400);
				assert_eq!(oauth_error.as_deref(), Some("invalid_grant"));
				assert!(body.contains("AADSTS50013"));
			},
			other => panic!("Unexpected error variant: {other:?}."),
		}
	}

	#[test]
	fn upstream_rejection_tolerates_plain_text_bodies() {
		let err = Error::upstream_rejected(UpstreamEndpoint::Discovery, 502, "bad gateway");

		assert!(matches!(err, Error::UpstreamRejected { oauth_error: None, .. }));
		assert_eq!(err.to_string(), "The discovery endpoint rejected the request with HTTP 502.");
	}

	#[test]
	fn transport_error_keeps_source() {
		let io = std::io::Error::other("connection reset");
		let err: Error =
			TransportError::Io { endpoint: UpstreamEndpoint::Token, source: Arc::new(io) }.into();
		let source = StdError::source(&err).expect("Transport error should expose its source.");

		assert!(err.to_string().contains("token"));
		assert_eq!(source.to_string(), "connection reset");
	}
}
