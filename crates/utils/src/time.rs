//! Millisecond timestamps shared by the cache and the mutation log.

use chrono::{DateTime, Utc};

/// Milliseconds since the unix epoch for the current instant.
#[must_use]
pub fn now_millis() -> i64 {
	Utc::now().timestamp_millis()
}

/// Age of `timestamp_ms` relative to `now_ms`, clamped at zero so entries written by a
/// clock slightly ahead of ours never count as "from the future".
#[must_use]
pub const fn age_millis(timestamp_ms: i64, now_ms: i64) -> u64 {
	let age = now_ms.saturating_sub(timestamp_ms);
	if age < 0 {
		0
	} else {
		age.unsigned_abs()
	}
}

/// Returns `candidate` unless it does not come strictly after `previous`, in which case the
/// smallest representable instant after `previous` is returned instead.
#[must_use]
pub fn strictly_after(previous: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> DateTime<Utc> {
	match previous {
		Some(previous) if candidate <= previous => previous + chrono::Duration::microseconds(1),
		_ => candidate,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn age_is_never_negative() {
		assert_eq!(age_millis(1_000, 1_500), 500);
		assert_eq!(age_millis(2_000, 1_500), 0);
	}

	#[test]
	fn strictly_after_bumps_stale_candidates() {
		let now = Utc::now();

		assert_eq!(strictly_after(None, now), now);
		assert!(strictly_after(Some(now), now) > now);
		assert!(strictly_after(Some(now), now - chrono::Duration::seconds(1)) > now);

		let later = now + chrono::Duration::seconds(1);
		assert_eq!(strictly_after(Some(now), later), later);
	}
}
