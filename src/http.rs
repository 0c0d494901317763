//! Transport primitives for the On-Behalf-Of token exchange.
//!
//! The module exposes [`TokenHttpClient`] alongside [`ResponseMetadata`] and
//! [`ResponseMetadataSlot`] so integrators can plug in their own HTTP stack without losing the
//! broker's diagnostics. Implementations call [`ResponseMetadataSlot::take`] before dispatching a
//! request and [`ResponseMetadataSlot::store`] once an HTTP status is known, so the exchanger can
//! attach consistent metadata to its log events and errors.

// std
use std::{ops::Deref, time::Duration as StdDuration};
// crates.io
use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse};
use reqwest::{
	RequestBuilder, StatusCode,
	header::{HeaderMap, RETRY_AFTER},
	redirect::Policy,
};
use serde::de::DeserializeOwned;
use time::format_description::well_known::Rfc2822;
// self
use crate::{
	_prelude::*,
	error::{ConfigError, TransportError, UpstreamEndpoint},
};

/// Identity provider host used when no authority override is configured.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Abstraction over HTTP transports capable of executing token exchanges while publishing
/// response metadata.
///
/// Implementations must be `Send + Sync + 'static` so one transport can be shared by every
/// request task, and the handles they return must own whatever state is required so their
/// request futures remain `Send` for the lifetime of the in-flight exchange. Exchanges run as
/// spawned tasks when the token cache coalesces them, so borrowed transports are not an option.
pub trait TokenHttpClient
where
	Self: 'static + Send + Sync,
{
	/// Concrete error emitted by the underlying transport.
	type TransportError: 'static + Send + Sync + StdError;

	/// [`AsyncHttpClient`] handle tied to a [`ResponseMetadataSlot`].
	type Handle: for<'c> AsyncHttpClient<
			'c,
			Error = HttpClientError<Self::TransportError>,
			Future: 'c + Send,
		>
		+ 'static
		+ Send
		+ Sync;

	/// Builds an [`AsyncHttpClient`] handle that records outcomes in `slot`.
	///
	/// # Metadata Contract
	///
	/// - Call [`ResponseMetadataSlot::take`] before submitting the HTTP request so stale
	///   information never leaks across calls.
	/// - Once an HTTP response provides a status, save it with [`ResponseMetadataSlot::store`].
	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle;
}

/// Captures metadata from the most recent HTTP response.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadata {
	/// HTTP status code returned upstream, if available.
	pub status: Option<u16>,
	/// Retry-After hint expressed as a relative duration.
	pub retry_after: Option<Duration>,
}

/// Thread-safe slot for sharing [`ResponseMetadata`] between transport and exchanger.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadataSlot(Arc<Mutex<Option<ResponseMetadata>>>);
impl ResponseMetadataSlot {
	/// Stores new metadata for the current request.
	pub fn store(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Returns the captured metadata, if any, consuming it from the slot.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
///
/// Token endpoints answer directly, so [`ReqwestHttpClient::new`] disables redirect following.
/// Any custom client passed to [`ReqwestHttpClient::with_client`] should do the same.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient(pub ReqwestClient);
impl ReqwestHttpClient {
	const TIMEOUT: StdDuration = StdDuration::from_secs(30);

	/// Builds a client with redirects disabled and a request timeout.
	pub fn new() -> Result<Self> {
		let client = ReqwestClient::builder()
			.redirect(Policy::none())
			.timeout(Self::TIMEOUT)
			.user_agent(concat!("obo-broker/", env!("CARGO_PKG_VERSION")))
			.build()
			.map_err(ConfigError::from)?;

		Ok(Self(client))
	}

	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	pub(crate) fn instrumented(&self, slot: ResponseMetadataSlot) -> InstrumentedHandle {
		InstrumentedHandle::new(self.0.clone(), slot)
	}
}
impl AsRef<ReqwestClient> for ReqwestHttpClient {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
impl Deref for ReqwestHttpClient {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl Debug for ReqwestHttpClient {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("ReqwestHttpClient(..)")
	}
}
impl TokenHttpClient for ReqwestHttpClient {
	type Handle = InstrumentedHandle;
	type TransportError = ReqwestError;

	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
		self.instrumented(slot)
	}
}

struct InstrumentedHttpClient {
	client: ReqwestClient,
	slot: ResponseMetadataSlot,
}

/// Handle returned by [`ReqwestHttpClient`] that satisfies [`TokenHttpClient`].
#[derive(Clone)]
pub struct InstrumentedHandle(Arc<InstrumentedHttpClient>);
impl InstrumentedHandle {
	fn new(client: ReqwestClient, slot: ResponseMetadataSlot) -> Self {
		Self(Arc::new(InstrumentedHttpClient { client, slot }))
	}
}
impl<'c> AsyncHttpClient<'c> for InstrumentedHandle {
	type Error = HttpClientError<ReqwestError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send + Sync>>;

	fn call(&'c self, request: HttpRequest) -> Self::Future {
		let client = Arc::clone(&self.0);

		Box::pin(async move {
			client.slot.take();

			let response = client
				.client
				.execute(request.try_into().map_err(Box::new)?)
				.await
				.map_err(Box::new)?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let retry_after = parse_retry_after(&headers);

			client.slot.store(ResponseMetadata { status: Some(status.as_u16()), retry_after });

			let mut response_new =
				HttpResponse::new(response.bytes().await.map_err(Box::new)?.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}

/// Returns the authority without a trailing slash, falling back to [`DEFAULT_AUTHORITY`].
pub(crate) fn authority_root(authority: Option<&Url>) -> &str {
	authority.map_or(DEFAULT_AUTHORITY, Url::as_str).trim_end_matches('/')
}

/// Rejects any URL that does not use HTTPS.
pub(crate) fn enforce_https(name: &'static str, url: &Url) -> Result<(), ConfigError> {
	if url.scheme() == "https" {
		Ok(())
	} else {
		Err(ConfigError::InsecureEndpoint { name, url: url.to_string() })
	}
}

/// Parses `raw` as a URL, naming the setting or endpoint in the error.
pub(crate) fn parse_url(name: &'static str, raw: &str) -> Result<Url> {
	Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { name, source }.into())
}

/// Sends a prepared request and buffers the body.
///
/// Network failures become [`TransportError`]s tagged with `endpoint`; the status is returned
/// unchanged so callers decide what counts as success.
pub(crate) async fn send(
	endpoint: UpstreamEndpoint,
	request: RequestBuilder,
) -> Result<(StatusCode, Vec<u8>)> {
	let response =
		request.send().await.map_err(|e| Error::from(TransportError::network(endpoint, e)))?;
	let status = response.status();
	let body = response.bytes().await.map_err(|e| TransportError::network(endpoint, e))?;

	Ok((status, body.to_vec()))
}

/// Decodes a JSON payload, reporting the failing path on error.
pub(crate) fn parse_json<T>(endpoint: UpstreamEndpoint, body: &[u8]) -> Result<T>
where
	T: DeserializeOwned,
{
	let mut deserializer = serde_json::Deserializer::from_slice(body);

	serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
		let path = e.path().to_string();

		Error::malformed(endpoint, format!("{} at `{path}`", e.into_inner()))
	})
}

/// Maps a failure raised by a [`TokenHttpClient`] handle onto a broker error tagged with
/// `endpoint`.
pub(crate) fn map_transport_error<E>(endpoint: UpstreamEndpoint, err: HttpClientError<E>) -> Error
where
	E: 'static + Send + Sync + StdError,
{
	match err {
		HttpClientError::Reqwest(inner) => TransportError::network(endpoint, *inner).into(),
		HttpClientError::Http(inner) => ConfigError::http_request(inner).into(),
		HttpClientError::Io(inner) => TransportError::Io { endpoint, source: Arc::new(inner) }.into(),
		HttpClientError::Other(message) =>
			TransportError::Io { endpoint, source: Arc::new(std::io::Error::other(message)) }.into(),
		_ => Error::internal(format!("unrecognized transport failure while calling {endpoint}")),
	}
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let value = headers.get(RETRY_AFTER)?;
	let raw = value.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::seconds(secs as i64));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Some(delta);
		}
	}

	None
}

#[cfg(test)]
mod tests {
	// crates.io
	use reqwest::header::HeaderValue;
	// self
	use super::*;

	#[test]
	fn retry_after_accepts_delta_seconds() {
		let mut headers = HeaderMap::new();

		headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));

		assert_eq!(parse_retry_after(&headers), Some(Duration::seconds(120)));
	}

	#[test]
	fn retry_after_ignores_past_dates_and_garbage() {
		let mut headers = HeaderMap::new();

		headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));

		assert_eq!(parse_retry_after(&headers), None);

		headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));

		assert_eq!(parse_retry_after(&headers), None);
	}

	#[test]
	fn authority_root_trims_trailing_slash() {
		let custom = Url::parse("http://127.0.0.1:8080/").expect("Fixture URL should parse.");

		assert_eq!(authority_root(None), DEFAULT_AUTHORITY);
		assert_eq!(authority_root(Some(&custom)), "http://127.0.0.1:8080");
	}

	#[test]
	fn parse_json_reports_the_failing_path() {
		#[derive(Debug, Deserialize)]
		struct Body {
			#[allow(dead_code)]
			expires_in: u64,
		}

		let err = parse_json::<Body>(UpstreamEndpoint::Token, br#"{"expires_in":"soon"}"#)
			.expect_err("Type mismatch should be reported.");

		assert!(err.to_string().contains("expires_in"), "{err}");
	}

	#[test]
	fn transport_errors_are_tagged_with_their_endpoint() {
		let err = map_transport_error::<std::io::Error>(
			UpstreamEndpoint::AmbientCredential,
			HttpClientError::Other("boom".into()),
		);

		assert!(matches!(
			err,
			Error::Transport(TransportError::Io {
				endpoint: UpstreamEndpoint::AmbientCredential,
				..
			})
		));
	}

	#[test]
	fn metadata_slot_take_consumes() {
		let slot = ResponseMetadataSlot::default();

		slot.store(ResponseMetadata { status: Some(400), retry_after: None });

		assert_eq!(slot.take().and_then(|meta| meta.status), Some(400));
		assert!(slot.take().is_none());
	}
}
