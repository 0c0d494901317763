// crates.io
use tracing::{Span, instrument::Instrumented};
// self
use crate::{_prelude::*, obs::Stage};

/// A span builder used by broker stages.
#[derive(Clone, Debug)]
pub struct StageSpan {
	span: Span,
}
impl StageSpan {
	/// Creates a new span tagged with the provided stage and an optional tenant.
	pub fn new(stage: Stage, tenant: Option<&str>) -> Self {
		let span = tracing::info_span!(
			"obo_broker.stage",
			stage = stage.as_str(),
			tenant = tenant.unwrap_or_default()
		);

		Self { span }
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> Instrumented<Fut>
	where
		Fut: Future,
	{
		use tracing::Instrument;

		fut.instrument(self.span.clone())
	}

	/// Returns the underlying span, e.g. to record late fields.
	pub fn span(&self) -> &Span {
		&self.span
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn instrument_wraps_future() {
		let span = StageSpan::new(Stage::Exchange, Some("tenant-1"));
		let value = span.instrument(async { 42 }).await;

		assert_eq!(value, 42);
	}
}
