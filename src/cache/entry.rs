//! Cache keys and cached exchange results.

// self
use crate::{
	_prelude::*,
	auth::{SubjectId, TenantId, TokenSecret, token_expiry},
};

/// Identifies one caller: the `(tenant, subject)` pair, rendered as `tenant:subject`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	/// Tenant of the caller.
	pub tenant: TenantId,
	/// Subject of the caller.
	pub subject: SubjectId,
}
impl CacheKey {
	/// Builds a key.
	pub fn new(tenant: TenantId, subject: SubjectId) -> Self {
		Self { tenant, subject }
	}
}
impl Debug for CacheKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "CacheKey({self})")
	}
}
impl Display for CacheKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "{}:{}", self.tenant, self.subject)
	}
}

/// A derived token plus the audience it was issued for.
///
/// Never mutated after creation.
#[derive(Clone, Debug)]
pub struct CachedExchange {
	/// Derived downstream token.
	pub token: TokenSecret,
	/// Audience of the inbound token the derived token was exchanged for.
	pub audience: String,
	/// Expiry read from the derived token's `exp` claim; the Unix epoch when unreadable.
	pub expires_at: OffsetDateTime,
	/// Accounting weight in bytes.
	pub weight: usize,
}
impl CachedExchange {
	/// Wraps an exchange result, reading its expiry and computing its weight.
	pub fn new(token: TokenSecret, audience: impl Into<String>) -> Self {
		let audience = audience.into();
		let expires_at = token_expiry(token.expose());
		let weight = token.len() + audience.len();

		Self { token, audience, expires_at, weight }
	}

	/// Returns `true` once `now` has reached the expiry.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		now >= self.expires_at
	}
}

/// Stored entry with recency bookkeeping.
#[derive(Debug)]
pub(crate) struct Slot {
	pub(crate) value: CachedExchange,
	pub(crate) last_used: u64,
}
