// common.rs

use std::time::Duration;

use tracing::{debug, warn};

use crate::types::StorageError;

/// How often, and how patiently, a conflicting atomic increment is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Retries after the first attempt. `0` disables retrying.
	pub max_retries: u32,
	/// Pause between attempts.
	pub backoff: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { max_retries: 5, backoff: Duration::from_millis(2) }
	}
}

impl RetryPolicy {
	/// Runs `op` until it succeeds, fails with a non-retryable error, or the retries run out.
	pub fn run<T>(
		&self,
		mut op: impl FnMut() -> Result<T, StorageError>,
	) -> Result<T, StorageError> {
		let mut retries = 0;

		loop {
			match op() {
				Err(e) if e.is_retryable() && retries < self.max_retries => {
					retries += 1;
					debug!(retries, error = %e, "Retrying after storage conflict");
					if !self.backoff.is_zero() {
						std::thread::sleep(self.backoff);
					}
				},
				Err(e) if e.is_retryable() => {
					warn!(retries, error = %e, "Giving up after storage conflicts");
					return Err(e)
				},
				res => return res,
			}
		}
	}
}
