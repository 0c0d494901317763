//! Redacting wrappers for token values and client credentials.

// self
use crate::_prelude::*;

/// Redacted token secret wrapper keeping sensitive material out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a new secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the inner value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// Byte length of the wrapped value.
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Returns `true` when the wrapped value is empty.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}
impl AsRef<str> for TokenSecret {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

/// The broker's own client identifier and secret for one tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
	/// Application (client) identifier registered in the tenant.
	pub client_id: String,
	/// Client secret; never logged.
	pub client_secret: TokenSecret,
}
impl CredentialPair {
	/// Creates a pair from raw values.
	pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
		Self { client_id: client_id.into(), client_secret: TokenSecret::new(client_secret) }
	}

	/// Builds a pair only when both halves are present and non-empty.
	pub fn from_parts(client_id: Option<String>, client_secret: Option<String>) -> Option<Self> {
		match (client_id, client_secret) {
			(Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() =>
				Some(Self::new(id, secret)),
			_ => None,
		}
	}
}
impl Debug for CredentialPair {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialPair")
			.field("client_id", &self.client_id)
			.field("client_secret", &"<redacted>")
			.finish()
	}
}
