use thiserror::Error;

/// Failures of a single equivalence check.
///
/// Only [`Error::Timeout`] is recoverable by the caller; it reports an
/// inconclusive check and must never be read as a proof either way.
#[derive(Debug, Error)]
pub enum Error {
	#[error("structural mismatch: {0}")]
	StructuralMismatch(String),
	#[error("cannot translate: {0}")]
	Unsupported(String),
	#[error("timed out")]
	Timeout,
	#[error("decision procedure failed: {0}")]
	DecisionProcedure(String),
}

impl Error {
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout)
	}
}

pub type Result<T> = std::result::Result<T, Error>;
