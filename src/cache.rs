//! Bounded, expiry-strict cache of derived tokens with per-key request coalescing.
//!
//! - Entries are keyed by [`CacheKey`] and served only until their `exp` passes.
//! - A hit is served only when the caller's audience equals the recorded one.
//! - Concurrent misses for one key share a single exchange. The exchange runs as a spawned task,
//!   so a caller going away does not cancel it for the others, and every waiter observes the same
//!   success or failure.
//! - Total entry weight never exceeds the byte budget. Inserting purges expired entries, then
//!   evicts the soonest-expiring entries (least recently used first on ties) until the new entry
//!   fits; an entry heavier than the whole budget is returned but not stored.

pub mod entry;

pub use entry::{CacheKey, CachedExchange};

// crates.io
use futures::{
	FutureExt,
	future::{BoxFuture, Shared},
};
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	cache::entry::Slot,
	obs::{self, Stage, StageOutcome},
};

/// Caller-facing reason returned when a cached token was issued for a different audience.
pub const AUDIENCE_MISMATCH: &str = "The aud in the Bearer Token does not appear to be valid.";

type SharedExchange = Shared<BoxFuture<'static, Result<CachedExchange>>>;

/// Shared handle to the derived-token cache.
#[derive(Clone)]
pub struct TokenCache {
	inner: Arc<CacheInner>,
}
impl TokenCache {
	/// Creates an empty cache holding at most `budget_bytes` of entry weight.
	pub fn new(budget_bytes: usize) -> Self {
		Self {
			inner: Arc::new(CacheInner {
				budget_bytes,
				state: Default::default(),
				in_flight: Default::default(),
			}),
		}
	}

	/// Configured byte budget.
	pub fn budget_bytes(&self) -> usize {
		self.inner.budget_bytes
	}

	/// Number of stored entries, expired ones included until they are purged.
	pub fn len(&self) -> usize {
		self.inner.state.lock().entries.len()
	}

	/// Returns `true` when nothing is stored.
	pub fn is_empty(&self) -> bool {
		self.inner.state.lock().entries.is_empty()
	}

	/// Total weight of stored entries.
	pub fn weight(&self) -> usize {
		self.inner.state.lock().weight
	}

	/// Drops every expired entry, returning how many were removed.
	pub fn purge_expired(&self) -> usize {
		self.inner.state.lock().purge_expired(OffsetDateTime::now_utc())
	}

	/// Returns the live entry for `key`, if any, without touching recency.
	pub fn peek(&self, key: &CacheKey) -> Option<CachedExchange> {
		let now = OffsetDateTime::now_utc();

		self.inner
			.state
			.lock()
			.entries
			.get(key)
			.filter(|slot| !slot.value.is_expired_at(now))
			.map(|slot| slot.value.clone())
	}

	/// Returns the cached exchange for `key`, running `exchange` on a miss.
	///
	/// `expected_audience` must equal the audience recorded with the entry, whether the entry
	/// was already stored or produced by a concurrent caller's exchange; a mismatch is
	/// [`Error::Forbidden`].
	pub async fn get_or_exchange<F, Fut>(
		&self,
		key: CacheKey,
		expected_audience: &str,
		exchange: F,
	) -> Result<CachedExchange>
	where
		F: 'static + Send + FnOnce() -> Fut,
		Fut: 'static + Send + Future<Output = Result<TokenSecret>>,
	{
		if let Some(hit) = self.inner.lookup(&key, OffsetDateTime::now_utc()) {
			obs::record_stage_outcome(Stage::Cache, StageOutcome::Hit);
			tracing::debug!(key = %key, "token cache hit");

			return check_audience(hit, expected_audience);
		}

		let flight = {
			let mut in_flight = self.inner.in_flight.lock();

			if let Some(hit) = self.inner.lookup(&key, OffsetDateTime::now_utc()) {
				drop(in_flight);
				obs::record_stage_outcome(Stage::Cache, StageOutcome::Hit);

				return check_audience(hit, expected_audience);
			}

			match in_flight.get(&key) {
				Some(flight) => {
					tracing::debug!(key = %key, "joining in-flight exchange");

					flight.clone()
				},
				None => {
					obs::record_stage_outcome(Stage::Cache, StageOutcome::Miss);
					tracing::debug!(key = %key, "token cache miss");

					let flight =
						self.spawn_exchange(key.clone(), expected_audience.to_owned(), exchange);

					in_flight.insert(key, flight.clone());

					flight
				},
			}
		};

		check_audience(flight.await?, expected_audience)
	}

	/// Must be called with the in-flight map locked so the task cannot deregister before it is
	/// registered.
	fn spawn_exchange<F, Fut>(
		&self,
		key: CacheKey,
		audience: String,
		exchange: F,
	) -> SharedExchange
	where
		F: 'static + Send + FnOnce() -> Fut,
		Fut: 'static + Send + Future<Output = Result<TokenSecret>>,
	{
		let inner = self.inner.clone();
		let task = tokio::spawn(async move {
			let flight = FlightGuard { inner, key };
			let result = exchange().await.map(|token| CachedExchange::new(token, audience));

			if let Ok(entry) = &result {
				flight.inner.insert(&flight.key, entry.clone(), OffsetDateTime::now_utc());
			}

			drop(flight);

			result
		});

		async move {
			task.await.unwrap_or_else(|e| Err(Error::internal(format!("exchange task failed: {e}"))))
		}
		.boxed()
		.shared()
	}
}
impl Debug for TokenCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let state = self.inner.state.lock();

		f.debug_struct("TokenCache")
			.field("budget_bytes", &self.inner.budget_bytes)
			.field("entries", &state.entries.len())
			.field("weight", &state.weight)
			.finish()
	}
}

/// Deregisters an in-flight exchange when its task ends, including by panic or runtime shutdown.
struct FlightGuard {
	inner: Arc<CacheInner>,
	key: CacheKey,
}
impl Drop for FlightGuard {
	fn drop(&mut self) {
		self.inner.in_flight.lock().remove(&self.key);
	}
}

struct CacheInner {
	budget_bytes: usize,
	state: Mutex<CacheState>,
	in_flight: Mutex<HashMap<CacheKey, SharedExchange>>,
}
impl CacheInner {
	fn lookup(&self, key: &CacheKey, now: OffsetDateTime) -> Option<CachedExchange> {
		let mut state = self.state.lock();
		let tick = state.tick();

		match state.entries.get_mut(key) {
			Some(slot) if !slot.value.is_expired_at(now) => {
				slot.last_used = tick;

				Some(slot.value.clone())
			},
			Some(_) => {
				state.remove(key);

				None
			},
			None => None,
		}
	}

	fn insert(&self, key: &CacheKey, value: CachedExchange, now: OffsetDateTime) {
		if value.weight > self.budget_bytes {
			tracing::debug!(key = %key, weight = value.weight, "entry exceeds budget; not stored");

			return;
		}
		if value.is_expired_at(now) {
			tracing::debug!(key = %key, "derived token already expired; not stored");

			return;
		}

		let mut state = self.state.lock();

		state.remove(key);
		state.purge_expired(now);

		while state.weight + value.weight > self.budget_bytes {
			let Some(victim) = state.eviction_candidate() else { break };

			tracing::debug!(key = %victim, "evicting cache entry");

			state.remove(&victim);
		}

		let tick = state.tick();

		state.weight += value.weight;
		state.entries.insert(key.clone(), Slot { value, last_used: tick });
	}
}

#[derive(Debug, Default)]
struct CacheState {
	entries: HashMap<CacheKey, Slot>,
	weight: usize,
	clock: u64,
}
impl CacheState {
	fn tick(&mut self) -> u64 {
		self.clock += 1;

		self.clock
	}

	fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
		let slot = self.entries.remove(key)?;

		self.weight -= slot.value.weight;

		Some(slot)
	}

	fn purge_expired(&mut self, now: OffsetDateTime) -> usize {
		let expired = self
			.entries
			.iter()
			.filter(|(_, slot)| slot.value.is_expired_at(now))
			.map(|(key, _)| key.clone())
			.collect::<Vec<_>>();

		for key in &expired {
			self.remove(key);
		}

		expired.len()
	}

	fn eviction_candidate(&self) -> Option<CacheKey> {
		self.entries
			.iter()
			.min_by_key(|(_, slot)| (slot.value.expires_at, slot.last_used))
			.map(|(key, _)| key.clone())
	}
}

fn check_audience(entry: CachedExchange, expected: &str) -> Result<CachedExchange> {
	if entry.audience == expected {
		Ok(entry)
	} else {
		tracing::warn!("cached token audience does not match the inbound token");

		Err(Error::forbidden(AUDIENCE_MISMATCH))
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// crates.io
	use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
	// self
	use super::*;
	use crate::auth::{SubjectId, TenantId};

	fn key(subject: &str) -> CacheKey {
		CacheKey::new(
			TenantId::new("tenant-a").expect("Tenant fixture should be valid."),
			SubjectId::new(subject).expect("Subject fixture should be valid."),
		)
	}

	fn derived(exp_offset: Duration, padding: usize) -> TokenSecret {
		let exp = (OffsetDateTime::now_utc() + exp_offset).unix_timestamp();
		let payload = format!(r#"{{"exp":{exp},"pad":"{}"}}"#, "x".repeat(padding));

		TokenSecret::new(format!("e30.{}.c2ln", URL_SAFE_NO_PAD.encode(payload)))
	}

	async fn fill(cache: &TokenCache, subject: &str, token: TokenSecret) -> CachedExchange {
		cache
			.get_or_exchange(key(subject), "aud", move || async move { Ok::<_, Error>(token) })
			.await
			.expect("Exchange should succeed.")
	}

	#[tokio::test]
	async fn hits_do_not_exchange_again() {
		let cache = TokenCache::new(1 << 20);
		let calls = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let calls = calls.clone();

			cache
				.get_or_exchange(key("user"), "aud", move || async move {
					calls.fetch_add(1, Ordering::SeqCst);

					Ok::<_, Error>(derived(Duration::hours(1), 0))
				})
				.await
				.expect("Exchange should succeed.");
		}

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn audience_mismatch_is_forbidden() {
		let cache = TokenCache::new(1 << 20);

		fill(&cache, "user", derived(Duration::hours(1), 0)).await;

		let err = cache
			.get_or_exchange(key("user"), "other-aud", || async {
				Ok::<_, Error>(derived(Duration::hours(1), 0))
			})
			.await
			.expect_err("Mismatched audience must be rejected.");

		assert!(matches!(err, Error::Forbidden { .. }));
		assert_eq!(err.to_string(), AUDIENCE_MISMATCH);
	}

	#[tokio::test]
	async fn failures_are_not_stored() {
		let cache = TokenCache::new(1 << 20);
		let err = cache
			.get_or_exchange(key("user"), "aud", || async {
				Err::<TokenSecret, _>(Error::forbidden("nope"))
			})
			.await
			.expect_err("Failure should propagate.");

		assert!(matches!(err, Error::Forbidden { .. }));
		assert!(cache.is_empty());
	}

	#[tokio::test]
	async fn expired_tokens_are_returned_but_not_stored() {
		let cache = TokenCache::new(1 << 20);
		let entry = fill(&cache, "user", TokenSecret::new("opaque-token")).await;

		assert_eq!(entry.token.expose(), "opaque-token");
		assert!(cache.is_empty());
	}

	#[tokio::test]
	async fn oversized_entries_are_not_stored() {
		let cache = TokenCache::new(64);

		fill(&cache, "user", derived(Duration::hours(1), 128)).await;

		assert!(cache.is_empty());
		assert_eq!(cache.weight(), 0);
	}

	#[tokio::test]
	async fn eviction_prefers_the_soonest_expiry() {
		let sample = CachedExchange::new(derived(Duration::hours(1), 0), "aud");
		let cache = TokenCache::new(sample.weight * 2 + 4);

		fill(&cache, "late", derived(Duration::hours(2), 0)).await;
		fill(&cache, "early", derived(Duration::hours(1), 0)).await;
		fill(&cache, "new", derived(Duration::hours(3), 0)).await;

		assert!(cache.weight() <= cache.budget_bytes());
		assert!(cache.peek(&key("early")).is_none());
		assert!(cache.peek(&key("late")).is_some());
		assert!(cache.peek(&key("new")).is_some());
	}

	#[tokio::test]
	async fn eviction_breaks_ties_by_recency() {
		let token_a = derived(Duration::hours(1), 0);
		let token_b = TokenSecret::new(token_a.expose().to_owned());
		let token_c = TokenSecret::new(token_a.expose().to_owned());
		let weight = CachedExchange::new(token_a.clone(), "aud").weight;
		let cache = TokenCache::new(weight * 2);

		fill(&cache, "a", token_a).await;
		fill(&cache, "b", token_b).await;
		// Touch `a` so `b` becomes the least recently used.
		fill(&cache, "a", derived(Duration::hours(1), 0)).await;
		fill(&cache, "c", token_c).await;

		assert!(cache.peek(&key("a")).is_some());
		assert!(cache.peek(&key("b")).is_none());
		assert!(cache.peek(&key("c")).is_some());
	}

	#[tokio::test]
	async fn stored_entries_expire_strictly() {
		let cache = TokenCache::new(1 << 20);
		let calls = Arc::new(AtomicUsize::new(0));
		let run = |calls: Arc<AtomicUsize>| {
			cache.get_or_exchange(key("user"), "aud", move || async move {
				calls.fetch_add(1, Ordering::SeqCst);

				Ok::<_, Error>(derived(Duration::seconds(2), 0))
			})
		};

		run(calls.clone()).await.expect("Exchange should succeed.");
		run(calls.clone()).await.expect("Hit should succeed.");

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.len(), 1);

		tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;

		assert!(cache.peek(&key("user")).is_none());

		run(calls.clone()).await.expect("Exchange should run again.");

		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	fn exploding_exchange() -> Result<TokenSecret> {
		panic!("exchange exploded");
	}

	#[tokio::test]
	async fn panicked_exchange_does_not_poison_the_key() {
		let cache = TokenCache::new(1 << 20);
		let err = cache
			.get_or_exchange(key("user"), "aud", || async { exploding_exchange() })
			.await
			.expect_err("A panicked exchange should surface as an error.");

		assert!(matches!(err, Error::Internal { .. }));
		assert!(cache.inner.in_flight.lock().is_empty());

		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let entry = cache
			.get_or_exchange(key("user"), "aud", move || async move {
				counter.fetch_add(1, Ordering::SeqCst);

				Ok::<_, Error>(derived(Duration::hours(1), 0))
			})
			.await
			.expect("The next request should run its own exchange.");

		assert_eq!(entry.audience, "aud");
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn aborted_caller_does_not_cancel_the_exchange() {
		let cache = TokenCache::new(1 << 20);
		let calls = Arc::new(AtomicUsize::new(0));
		let first = {
			let cache = cache.clone();
			let calls = calls.clone();

			tokio::spawn(async move {
				cache
					.get_or_exchange(key("user"), "aud", move || async move {
						calls.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(std::time::Duration::from_millis(200)).await;

						Ok::<_, Error>(derived(Duration::hours(1), 0))
					})
					.await
			})
		};

		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		first.abort();

		assert!(first.await.expect_err("Caller should be aborted.").is_cancelled());

		let counter = calls.clone();
		let entry = cache
			.get_or_exchange(key("user"), "aud", move || async move {
				counter.fetch_add(1, Ordering::SeqCst);

				Ok::<_, Error>(derived(Duration::hours(1), 0))
			})
			.await
			.expect("Joiner should receive the shared exchange.");

		assert_eq!(entry.audience, "aud");
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_misses_share_one_exchange() {
		let cache = TokenCache::new(1 << 20);
		let calls = Arc::new(AtomicUsize::new(0));
		let mut handles = Vec::new();

		for _ in 0..16 {
			let cache = cache.clone();
			let calls = calls.clone();

			handles.push(tokio::spawn(async move {
				cache
					.get_or_exchange(key("user"), "aud", move || async move {
						calls.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(std::time::Duration::from_millis(50)).await;

						Ok::<_, Error>(derived(Duration::hours(1), 0))
					})
					.await
			}));
		}

		for handle in handles {
			handle.await.expect("Task should not panic.").expect("Exchange should succeed.");
		}

		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn waiters_share_failures() {
		let cache = TokenCache::new(1 << 20);
		let calls = Arc::new(AtomicUsize::new(0));
		let run = |calls: Arc<AtomicUsize>| {
			let cache = cache.clone();

			async move {
				cache
					.get_or_exchange(key("user"), "aud", move || async move {
						calls.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(std::time::Duration::from_millis(20)).await;

						Err::<TokenSecret, _>(Error::upstream_rejected(
							crate::error::UpstreamEndpoint::Token,
							400,
							"{\"error\":\"invalid_grant\"}",
						))
					})
					.await
			}
		};
		let (a, b) = tokio::join!(run(calls.clone()), run(calls.clone()));

		assert!(matches!(a, Err(Error::UpstreamRejected { status: 400, .. })));
		assert!(matches!(b, Err(Error::UpstreamRejected { status: 400, .. })));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(cache.is_empty());
	}
}
