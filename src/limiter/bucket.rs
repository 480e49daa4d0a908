//! Token bucket rate spec and per-IP state. A single bucket is only ever
//! touched while holding its owning `DashMap` shard's entry lock, so the
//! bucket itself needs no internal synchronization.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSpec {
	pub rps: f64,
	pub burst: u32,
}

impl RateSpec {
	/// Burst is clamped to >= 1 at bucket construction.
	pub fn clamped_burst(&self) -> u32 {
		self.burst.max(1)
	}
}

/// A token bucket refilled at `rps` tokens/sec up to `burst` capacity.
#[derive(Debug)]
pub struct TokenBucket {
	spec: RateSpec,
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	pub fn new(spec: RateSpec) -> Self {
		let burst = spec.clamped_burst();
		TokenBucket {
			spec,
			tokens: burst as f64,
			last_refill: Instant::now(),
		}
	}

	/// Rebuild the bucket for a new `RateSpec`, e.g. when an override is
	/// installed or removed. Resets to a full bucket, since the lookup that
	/// calls this returns a lazily-created bucket sized by the active
	/// override if any, else by the defaults.
	pub fn reconfigure(&mut self, spec: RateSpec) {
		self.spec = spec;
		self.tokens = spec.clamped_burst() as f64;
		self.last_refill = Instant::now();
	}

	pub fn spec(&self) -> RateSpec {
		self.spec
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
		let burst = self.spec.clamped_burst() as f64;
		self.tokens = (self.tokens + elapsed * self.spec.rps).min(burst);
		self.last_refill = now;
	}

	/// Non-blocking allow check: consumes a token if available.
	pub fn try_allow(&mut self) -> bool {
		self.refill(Instant::now());
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	/// How long until a token is next available, if not currently allowed.
	pub fn wait_duration(&mut self) -> Duration {
		self.refill(Instant::now());
		if self.tokens >= 1.0 {
			return Duration::ZERO;
		}
		if self.spec.rps <= 0.0 {
			return Duration::from_secs(u64::MAX / 2);
		}
		let need = 1.0 - self.tokens;
		Duration::from_secs_f64(need / self.spec.rps)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn burst_zero_is_clamped_to_one() {
		let spec = RateSpec { rps: 1.0, burst: 0 };
		assert_eq!(spec.clamped_burst(), 1);
		let mut bucket = TokenBucket::new(spec);
		assert!(bucket.try_allow());
		assert!(!bucket.try_allow());
	}

	#[test]
	fn exhausts_after_burst_requests() {
		let mut bucket = TokenBucket::new(RateSpec { rps: 0.0, burst: 3 });
		assert!(bucket.try_allow());
		assert!(bucket.try_allow());
		assert!(bucket.try_allow());
		assert!(!bucket.try_allow());
	}

	#[test]
	fn reconfigure_resets_to_full() {
		let mut bucket = TokenBucket::new(RateSpec { rps: 1.0, burst: 1 });
		assert!(bucket.try_allow());
		assert!(!bucket.try_allow());
		bucket.reconfigure(RateSpec { rps: 1.0, burst: 2 });
		assert!(bucket.try_allow());
		assert!(bucket.try_allow());
	}
}
