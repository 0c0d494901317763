//! Drives one request through the broker pipeline against a mock identity provider: the inbound
//! token is validated against the tenant's published keys, exchanged once, and served from the
//! cache on the second request.

// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
// self
use obo_broker::{
	_preludet::*,
	cache::TokenCache,
	oauth2::http::{Request, header::AUTHORIZATION},
	pipeline::{BrokerPipeline, ExchangeMode, OboToken},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let authority = mock_authority(&server.base_url());
	let keys_path = "/tenant-acme/discovery/v2.0/keys";
	let _discovery = server
		.mock_async(|when, then| {
			when.method(GET).path("/tenant-acme/v2.0/.well-known/openid-configuration");
			then.status(200)
				.header("content-type", "application/json")
				.body(discovery_body(&server.url("/tenant-acme/v2.0"), &server.url(keys_path)));
		})
		.await;
	let _keys = server
		.mock_async(|when, then| {
			when.method(GET).path(keys_path);
			then.status(200)
				.header("content-type", "application/json")
				.body(jwks_body(&[TEST_KID]));
		})
		.await;
	let token_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/tenant-acme/oauth2/v2.0/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(serde_json::json!({ "access_token": derived_token("demo", 3600) }));
		})
		.await;
	let pipeline = BrokerPipeline::new(build_test_exchanger(&authority), ExchangeMode::Cached {
		validator: Arc::new(build_test_validator(&authority)),
		cache: TokenCache::new(1024 * 1024),
	});
	let inbound =
		mint_token(TEST_KID, &inbound_claims(&authority, "tenant-acme", "user-42", 3600));

	for attempt in 1..=2 {
		let mut request =
			Request::builder().header(AUTHORIZATION, format!("Bearer {inbound}")).body(())?;

		if let Err(rejection) = pipeline.authorize(&mut request).await {
			println!("Request {attempt} rejected with {}: {}", rejection.status, rejection.message);

			continue;
		}

		let token = OboToken::from_extensions(request.extensions())?;

		println!("Request {attempt} carries a derived token of {} bytes.", token.expose().len());
	}

	token_mock.assert_calls_async(1).await;

	Ok(())
}
