//! Utility functions for namesync

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds
pub fn now_secs() -> i64 {
	match SystemTime::now().duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(_) => 0,
	}
}

/// Current unix time in nanoseconds (jitter source)
pub fn now_nanos() -> u128 {
	match SystemTime::now().duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_nanos(),
		Err(_) => 0,
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_now_secs_sane() {
		// after 2020-01-01
		assert!(now_secs() > 1_577_836_800);
	}

	#[test]
	fn test_now_nanos_matches_secs() {
		let secs = now_secs();
		let nanos = now_nanos();
		let diff = (nanos / 1_000_000_000) as i64 - secs;
		assert!(diff.abs() <= 1);
	}
}

// vim: ts=4
