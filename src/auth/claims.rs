//! Pre-trust claim extraction for inbound bearer tokens.
//!
//! [`InboundClaims::extract`] decodes the payload segment of a compact JWS without looking at
//! the signature. The result only decides *which* tenant's trust material and credentials to use
//! next; it must never be used to authorize anything on its own.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserializer;
use serde_json::Value;
// self
use crate::{
	_prelude::*,
	auth::{IdentifierError, SubjectId, TenantId},
};

/// Reasons claim extraction can fail. The `Display` text is safe to return to callers.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ClaimError {
	/// The token is not a decodable compact JWS.
	#[error("The provided Bearer Token could not be decoded.")]
	Malformed {
		/// Operator-facing detail.
		detail: String,
	},
	/// No usable `tid` claim.
	#[error("You must provide a Bearer Token that contains the tid element.")]
	MissingTenant,
	/// No usable `oid` claim.
	#[error("You must provide a Bearer Token that contains the oid element.")]
	MissingSubject,
	/// No usable `aud` claim.
	#[error("You must provide a Bearer Token that contains the aud element.")]
	MissingAudience,
	/// A claim is present but cannot be used as an identifier.
	#[error("The {claim} element in the Bearer Token is not a valid identifier.")]
	InvalidIdentifier {
		/// Claim name.
		claim: &'static str,
		/// Validation failure.
		#[source]
		source: IdentifierError,
	},
}
impl From<ClaimError> for Error {
	fn from(e: ClaimError) -> Self {
		match e {
			ClaimError::Malformed { .. } => Error::unauthenticated(e.to_string()),
			_ => Error::forbidden(e.to_string()),
		}
	}
}

/// Claims consumed by the broker, decoded without signature verification.
///
/// Empty strings and values of the wrong JSON type are treated as absent so every required-claim
/// check goes through the same accessor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InboundClaims {
	/// Tenant identifier.
	#[serde(default, deserialize_with = "lenient_string")]
	pub tid: Option<String>,
	/// Subject (object) identifier.
	#[serde(default, deserialize_with = "lenient_string")]
	pub oid: Option<String>,
	/// Audience; arrays are joined with a single space.
	#[serde(default, deserialize_with = "lenient_audience")]
	pub aud: Option<String>,
	/// Expiry as seconds since the Unix epoch.
	#[serde(default, deserialize_with = "lenient_numeric_date")]
	pub exp: Option<i64>,
}
impl InboundClaims {
	/// Decodes the payload segment of `token`.
	pub fn extract(token: &str) -> Result<Self, ClaimError> {
		let payload = payload_segment(token)?;
		let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).map_err(|e| {
			ClaimError::Malformed { detail: format!("payload is not base64url: {e}") }
		})?;

		serde_json::from_slice(&bytes).map_err(|e| ClaimError::Malformed {
			detail: format!("payload is not a JSON object: {e}"),
		})
	}

	/// Tenant used to route the request.
	pub fn tenant(&self) -> Result<TenantId, ClaimError> {
		let raw = self.tid.as_deref().ok_or(ClaimError::MissingTenant)?;

		TenantId::new(raw).map_err(|source| ClaimError::InvalidIdentifier { claim: "tid", source })
	}

	/// Subject used to key the token cache.
	pub fn subject(&self) -> Result<SubjectId, ClaimError> {
		let raw = self.oid.as_deref().ok_or(ClaimError::MissingSubject)?;

		SubjectId::new(raw).map_err(|source| ClaimError::InvalidIdentifier { claim: "oid", source })
	}

	/// Original audience recorded alongside cached exchanges.
	pub fn audience(&self) -> Result<&str, ClaimError> {
		self.aud.as_deref().ok_or(ClaimError::MissingAudience)
	}

	/// Expiry instant, when present and representable.
	pub fn expires_at(&self) -> Option<OffsetDateTime> {
		self.exp.and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
	}
}

/// Reads the `exp` claim of a derived token.
///
/// Anything unparseable degrades to the Unix epoch, i.e. an already-expired instant, never to an
/// unbounded lifetime.
pub fn token_expiry(token: &str) -> OffsetDateTime {
	InboundClaims::extract(token)
		.ok()
		.and_then(|claims| claims.expires_at())
		.unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn payload_segment(token: &str) -> Result<&str, ClaimError> {
	let mut segments = token.split('.');

	match (segments.next(), segments.next(), segments.next(), segments.next()) {
		(Some(header), Some(payload), Some(_), None)
			if !header.is_empty() && !payload.is_empty() =>
			Ok(payload),
		_ => Err(ClaimError::Malformed {
			detail: "token is not a three-segment compact JWS".into(),
		}),
	}
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(match Option::<Value>::deserialize(deserializer)? {
		Some(Value::String(s)) if !s.is_empty() => Some(s),
		_ => None,
	})
}

fn lenient_audience<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(match Option::<Value>::deserialize(deserializer)? {
		Some(Value::String(s)) if !s.is_empty() => Some(s),
		Some(Value::Array(values)) => {
			let members = values
				.iter()
				.filter_map(Value::as_str)
				.filter(|s| !s.is_empty())
				.collect::<Vec<_>>();

			if members.is_empty() { None } else { Some(members.join(" ")) }
		},
		_ => None,
	})
}

fn lenient_numeric_date<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(match Option::<Value>::deserialize(deserializer)? {
		Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
		Some(Value::String(s)) => s.trim().parse().ok(),
		_ => None,
	})
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn token_with(payload: &str) -> String {
		format!("eyJhbGciOiJub25lIn0.{}.c2ln", URL_SAFE_NO_PAD.encode(payload))
	}

	#[test]
	fn extracts_consumed_claims() {
		let token = token_with(
			r#"{"tid":"tenant-1","oid":"user-1","aud":"api://broker","exp":1700000000,"name":"x"}"#,
		);
		let claims = InboundClaims::extract(&token).expect("Claims should decode.");

		assert_eq!(claims.tenant().expect("tid should be present").as_ref(), "tenant-1");
		assert_eq!(claims.subject().expect("oid should be present").as_ref(), "user-1");
		assert_eq!(claims.audience().expect("aud should be present"), "api://broker");
		assert_eq!(claims.expires_at().map(|t| t.unix_timestamp()), Some(1_700_000_000));
	}

	#[test]
	fn missing_claims_are_reported_individually() {
		let claims = InboundClaims::extract(&token_with(r#"{"tid":"","oid":42}"#))
			.expect("Claims should decode even when values are unusable.");

		assert_eq!(claims.tenant(), Err(ClaimError::MissingTenant));
		assert_eq!(claims.subject(), Err(ClaimError::MissingSubject));
		assert_eq!(claims.audience(), Err(ClaimError::MissingAudience));
		assert_eq!(claims.expires_at(), None);
	}

	#[test]
	fn audience_arrays_are_normalized() {
		let claims = InboundClaims::extract(&token_with(r#"{"aud":["a","","b"]}"#))
			.expect("Claims should decode.");

		assert_eq!(claims.aud.as_deref(), Some("a b"));
	}

	#[test]
	fn malformed_tokens_map_to_unauthenticated() {
		let non_object = token_with("42");

		for raw in ["", "abc", "a.b", "a.!!!.c", "a.b.c.d", non_object.as_str()] {
			let err = InboundClaims::extract(raw).expect_err("Malformed token must be rejected.");

			assert!(matches!(Error::from(err), Error::Unauthenticated { .. }), "{raw}");
		}
	}

	#[test]
	fn claim_errors_map_to_forbidden_with_caller_message() {
		let err = Error::from(ClaimError::MissingTenant);

		assert!(matches!(err, Error::Forbidden { .. }));
		assert_eq!(
			err.to_string(),
			"You must provide a Bearer Token that contains the tid element."
		);
	}

	#[test]
	fn invalid_tenant_identifiers_are_rejected() {
		let claims = InboundClaims::extract(&token_with(r#"{"tid":"../common"}"#))
			.expect("Claims should decode.");

		assert!(matches!(
			claims.tenant(),
			Err(ClaimError::InvalidIdentifier { claim: "tid", .. })
		));
	}

	#[test]
	fn unparseable_expiry_degrades_to_epoch() {
		assert_eq!(token_expiry("not-a-jwt"), OffsetDateTime::UNIX_EPOCH);
		assert_eq!(token_expiry(&token_with(r#"{"exp":"soon"}"#)), OffsetDateTime::UNIX_EPOCH);
		assert_eq!(
			token_expiry(&token_with(r#"{"exp":"1700000000"}"#)).unix_timestamp(),
			1_700_000_000
		);
	}
}
