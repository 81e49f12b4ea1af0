use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::error::{Error, Result};

/// Cooperative cancellation point shared by the search and the solver bridge.
#[derive(Clone, Debug)]
pub struct Timeout {
	deadline: Option<Instant>,
	interrupt: Arc<AtomicBool>,
}

impl Default for Timeout {
	fn default() -> Self {
		Timeout::never()
	}
}

impl Timeout {
	pub fn never() -> Self {
		Timeout { deadline: None, interrupt: Arc::new(AtomicBool::new(false)) }
	}

	pub fn new(limit: Option<Duration>) -> Self {
		Timeout::with_interrupt(limit, Arc::new(AtomicBool::new(false)))
	}

	pub fn with_interrupt(limit: Option<Duration>, interrupt: Arc<AtomicBool>) -> Self {
		Timeout { deadline: limit.map(|d| Instant::now() + d), interrupt }
	}

	/// Handle that cancels every check polling this timeout once set.
	pub fn interrupter(&self) -> Arc<AtomicBool> {
		self.interrupt.clone()
	}

	pub fn expired(&self) -> bool {
		self.interrupt.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
	}

	pub fn check(&self) -> Result<()> {
		if self.expired() {
			log::debug!("Timeout checkpoint tripped");
			return Err(Error::Timeout);
		}
		Ok(())
	}

	pub fn remaining(&self) -> Option<Duration> {
		self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interrupt_trips_checkpoint() {
		let timeout = Timeout::new(Some(Duration::from_secs(3600)));
		assert!(timeout.check().is_ok());
		timeout.interrupter().store(true, Ordering::SeqCst);
		assert!(timeout.check().unwrap_err().is_timeout());
	}

	#[test]
	fn elapsed_deadline_trips_checkpoint() {
		let timeout = Timeout::new(Some(Duration::ZERO));
		assert!(timeout.expired());
		assert_eq!(timeout.remaining(), Some(Duration::ZERO));
		assert!(Timeout::never().check().is_ok());
	}
}
