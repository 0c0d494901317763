//! Observability helpers for broker stages.
//!
//! - Every stage runs inside a `tracing` span named `obo_broker.stage` carrying the `stage` field.
//! - Enable the `metrics` feature to increment the `obo_broker_stage_total` counter for every
//!   attempt/success/failure, labeled by `stage` + `outcome`.

mod metrics;
mod tracing;

pub use self::metrics::*;
pub use self::tracing::*;

// self
use crate::_prelude::*;

/// Broker stages observed by spans and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
	/// Whole per-request pipeline.
	Pipeline,
	/// Per-tenant signature validation.
	Validation,
	/// Discovery document and signing key retrieval.
	Discovery,
	/// Client credential resolution.
	Credentials,
	/// On-Behalf-Of token exchange.
	Exchange,
	/// Derived token cache lookups.
	Cache,
}
impl Stage {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Stage::Pipeline => "pipeline",
			Stage::Validation => "validation",
			Stage::Discovery => "discovery",
			Stage::Credentials => "credentials",
			Stage::Exchange => "exchange",
			Stage::Cache => "cache",
		}
	}
}
impl Display for Stage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageOutcome {
	/// Entry to a stage.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
	/// Cache served an existing entry.
	Hit,
	/// Cache had to populate the entry.
	Miss,
}
impl StageOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			StageOutcome::Attempt => "attempt",
			StageOutcome::Success => "success",
			StageOutcome::Failure => "failure",
			StageOutcome::Hit => "hit",
			StageOutcome::Miss => "miss",
		}
	}

	/// Maps a result onto [`StageOutcome::Success`] or [`StageOutcome::Failure`].
	pub fn of<T, E>(result: &std::result::Result<T, E>) -> Self {
		if result.is_ok() { StageOutcome::Success } else { StageOutcome::Failure }
	}
}
impl Display for StageOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
