//! Per-domain token-bucket admission control, strictly in-process.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

struct Bucket {
	tokens: f64,
	last_refill: Instant,
	rate_per_second: f64,
	burst: f64,
}

pub struct RateLimiter {
	default_rate_per_minute: u32,
	default_burst: u32,
	buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
	pub fn new(default_rate_per_minute: u32, default_burst: u32) -> Self {
		RateLimiter {
			default_rate_per_minute,
			default_burst,
			buckets: Mutex::new(HashMap::new()),
		}
	}

	/// Admit one call against `domain`'s bucket. `rate_override`/
	/// `burst_override` of 0 fall back to the configured default; an
	/// effective rate of 0 always allows.
	pub fn allow(&self, domain: &str, rate_override: u32, burst_override: u32) -> bool {
		let rate = if rate_override > 0 { rate_override } else { self.default_rate_per_minute };
		if rate == 0 {
			return true;
		}
		let burst = if burst_override > 0 { burst_override } else { self.default_burst };
		let burst = if burst == 0 { 1 } else { burst };

		let mut buckets = self.buckets.lock();
		let now = Instant::now();
		let bucket = buckets.entry(domain.to_string()).or_insert_with(|| Bucket {
			tokens: burst as f64,
			last_refill: now,
			rate_per_second: rate as f64 / 60.0,
			burst: burst as f64,
		});

		// config can change between calls (allowlist reload); keep policy current
		bucket.rate_per_second = rate as f64 / 60.0;
		bucket.burst = burst as f64;

		let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
		bucket.tokens = (bucket.tokens + elapsed * bucket.rate_per_second).min(bucket.burst);
		bucket.last_refill = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn burst_is_consumed_then_denied() {
		let limiter = RateLimiter::new(60, 2);
		assert!(limiter.allow("a.com", 0, 0));
		assert!(limiter.allow("a.com", 0, 0));
		assert!(!limiter.allow("a.com", 0, 0));
	}

	#[test]
	fn zero_rate_always_allows() {
		let limiter = RateLimiter::new(0, 0);
		for _ in 0..100 {
			assert!(limiter.allow("a.com", 0, 0));
		}
	}

	#[test]
	fn zero_burst_override_coerces_to_one() {
		let limiter = RateLimiter::new(60, 10);
		assert!(limiter.allow("a.com", 60, 0));
		// burst is overridden to the default (10) since override is 0, so a
		// second call should also succeed
		assert!(limiter.allow("a.com", 60, 0));
	}

	#[test]
	fn refill_after_long_idle_clamps_to_burst() {
		let limiter = RateLimiter::new(60, 5);
		assert!(limiter.allow("a.com", 0, 0));
		{
			let mut buckets = limiter.buckets.lock();
			let bucket = buckets.get_mut("a.com").unwrap();
			bucket.last_refill = Instant::now() - Duration::from_secs(3600);
		}
		assert!(limiter.allow("a.com", 0, 0));
		let buckets = limiter.buckets.lock();
		assert!(buckets.get("a.com").unwrap().tokens <= 5.0);
	}

	#[test]
	fn per_domain_buckets_are_independent() {
		let limiter = RateLimiter::new(60, 1);
		assert!(limiter.allow("a.com", 0, 0));
		assert!(!limiter.allow("a.com", 0, 0));
		assert!(limiter.allow("b.com", 0, 0));
	}
}
