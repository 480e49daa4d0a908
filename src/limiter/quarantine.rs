//! Sliding-window strike detection and TTL-bounded auto-quarantine
//! overrides.

use std::time::{Duration, Instant};

use crate::limiter::bucket::RateSpec;

#[derive(Clone, Copy, Debug)]
pub struct AutoRule {
	pub threshold: u32,
	pub window: Duration,
	pub penalty: RateSpec,
	pub ttl: Duration,
}

#[derive(Debug, Default)]
pub struct StrikeState {
	count: u32,
	window_end: Option<Instant>,
}

/// Outcome of folding one request into the strike window.
#[derive(Debug, PartialEq)]
pub enum StrikeOutcome {
	/// No change; still accumulating within the window.
	Counted,
	/// Threshold reached: install `penalty` as an override with the given
	/// expiry and reset the window.
	Tripped { penalty: RateSpec, expiry: Instant },
}

impl StrikeState {
	/// Record one request against `rule`, rolling the window if expired.
	pub fn record(&mut self, rule: &AutoRule, now: Instant) -> StrikeOutcome {
		let expired = match self.window_end {
			None => true,
			Some(end) => now > end,
		};
		if expired {
			self.count = 0;
			self.window_end = Some(now + rule.window);
		}
		self.count += 1;
		if self.count >= rule.threshold {
			self.count = 0;
			self.window_end = Some(now + rule.window);
			StrikeOutcome::Tripped {
				penalty: rule.penalty,
				expiry: now + rule.ttl,
			}
		} else {
			StrikeOutcome::Counted
		}
	}
}

/// The reason a bucket is sized the way it is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OverrideKind {
	Manual,
	Auto,
}

#[derive(Clone, Copy, Debug)]
pub struct Override {
	pub spec: RateSpec,
	pub kind: OverrideKind,
	pub expiry: Option<Instant>,
}

impl Override {
	pub fn manual(spec: RateSpec) -> Self {
		Override { spec, kind: OverrideKind::Manual, expiry: None }
	}

	pub fn auto(spec: RateSpec, expiry: Instant) -> Self {
		Override { spec, kind: OverrideKind::Auto, expiry: Some(expiry) }
	}

	/// True once `now` has passed the auto-override's TTL. Manual
	/// overrides never expire.
	pub fn expired(&self, now: Instant) -> bool {
		matches!(self.expiry, Some(e) if now > e)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule() -> AutoRule {
		AutoRule {
			threshold: 5,
			window: Duration::from_secs(10),
			penalty: RateSpec { rps: 1.0, burst: 1 },
			ttl: Duration::from_secs(60),
		}
	}

	#[test]
	fn trips_after_threshold_within_window() {
		let rule = rule();
		let mut state = StrikeState::default();
		let start = Instant::now();
		for i in 0..4 {
			let outcome = state.record(&rule, start + Duration::from_millis(i * 100));
			assert_eq!(outcome, StrikeOutcome::Counted);
		}
		let outcome = state.record(&rule, start + Duration::from_millis(400));
		match outcome {
			StrikeOutcome::Tripped { penalty, .. } => assert_eq!(penalty.burst, 1),
			_ => panic!("expected trip"),
		}
	}

	#[test]
	fn window_rolls_over_after_expiry() {
		let rule = rule();
		let mut state = StrikeState::default();
		let start = Instant::now();
		state.record(&rule, start);
		state.record(&rule, start + Duration::from_secs(1));
		// window elapses; count should reset instead of accumulating toward threshold
		let outcome = state.record(&rule, start + Duration::from_secs(11));
		assert_eq!(outcome, StrikeOutcome::Counted);
	}

	#[test]
	fn auto_override_expires_after_ttl() {
		let now = Instant::now();
		let ov = Override::auto(RateSpec { rps: 1.0, burst: 1 }, now + Duration::from_secs(60));
		assert!(!ov.expired(now));
		assert!(ov.expired(now + Duration::from_secs(61)));
	}

	#[test]
	fn manual_override_never_expires() {
		let ov = Override::manual(RateSpec { rps: 1.0, burst: 1 });
		assert!(!ov.expired(Instant::now() + Duration::from_secs(1_000_000)));
	}
}
