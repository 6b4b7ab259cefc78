//! Short-lived, bounded LRU+TTL storage of completed responses, only for
//! cacheable requests.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::http_types::FetchResponse;

/// Fixed per-entry overhead added on top of key and body length when
/// accounting toward `max_bytes`.
const ENTRY_OVERHEAD: usize = 64;

struct Entry {
	response: FetchResponse,
	expires_at: Instant,
	size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
	pub items: usize,
	pub bytes: usize,
	pub max_items: usize,
	pub max_bytes: usize,
	pub hits: u64,
	pub misses: u64,
}

struct Inner {
	// insertion order doubles as LRU order: front = least recently used
	entries: IndexMap<String, Entry>,
	bytes: usize,
	hits: u64,
	misses: u64,
}

pub struct ResponseCache {
	max_items: usize,
	max_bytes: usize,
	inner: Mutex<Inner>,
}

impl ResponseCache {
	pub fn new(max_items: usize, max_bytes: usize) -> Self {
		ResponseCache {
			max_items,
			max_bytes,
			inner: Mutex::new(Inner {
				entries: IndexMap::new(),
				bytes: 0,
				hits: 0,
				misses: 0,
			}),
		}
	}

	pub fn enabled(&self) -> bool {
		self.max_items > 0 && self.max_bytes > 0
	}

	/// Classify a request: cacheable only when the method is empty or `GET`
	/// and the request carries no auth injection. The key format is fixed
	/// (`GET:<url>`) so callers never need to round-trip it.
	pub fn key(method: &str, url: &str, has_auth: bool) -> (String, bool) {
		let cacheable = (method.is_empty() || method.eq_ignore_ascii_case("GET")) && !has_auth;
		(format!("GET:{url}"), cacheable)
	}

	pub fn get(&self, key: &str) -> Option<FetchResponse> {
		let mut inner = self.inner.lock();
		let now = Instant::now();
		let expired = match inner.entries.get(key) {
			None => {
				inner.misses += 1;
				return None;
			},
			Some(entry) => entry.expires_at <= now,
		};
		if expired {
			inner.entries.shift_remove(key);
			inner.misses += 1;
			return None;
		}
		inner.hits += 1;
		// move to the back (most recently used)
		inner.entries.move_index(inner.entries.get_index_of(key).unwrap(), inner.entries.len() - 1);
		inner.entries.get(key).map(|e| e.response.clone())
	}

	pub fn put(&self, key: &str, response: FetchResponse, ttl: Duration) {
		if !self.enabled() || ttl.is_zero() {
			return;
		}
		let size = response.body.len() + key.len() + ENTRY_OVERHEAD;
		let mut inner = self.inner.lock();

		if let Some(old) = inner.entries.shift_remove(key) {
			inner.bytes -= old.size;
		}

		while !inner.entries.is_empty()
			&& (inner.entries.len() >= self.max_items || inner.bytes + size > self.max_bytes)
		{
			if let Some((_, evicted)) = inner.entries.shift_remove_index(0) {
				inner.bytes -= evicted.size;
			}
		}

		if inner.entries.len() >= self.max_items || inner.bytes + size > self.max_bytes {
			// a single entry too large for the cache; drop it rather than violate caps
			return;
		}

		inner.entries.insert(
			key.to_string(),
			Entry {
				response,
				expires_at: Instant::now() + ttl,
				size,
			},
		);
		inner.bytes += size;
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock();
		inner.entries.clear();
		inner.bytes = 0;
	}

	pub fn stats(&self) -> CacheStats {
		let inner = self.inner.lock();
		CacheStats {
			items: inner.entries.len(),
			bytes: inner.bytes,
			max_items: self.max_items,
			max_bytes: self.max_bytes,
			hits: inner.hits,
			misses: inner.misses,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::thread::sleep;

	fn resp(body: &str) -> FetchResponse {
		FetchResponse::new(200, HashMap::new(), body.as_bytes().to_vec())
	}

	#[test]
	fn non_get_or_authed_requests_are_not_cacheable() {
		assert!(!ResponseCache::key("POST", "https://x", false).1);
		assert!(!ResponseCache::key("GET", "https://x", true).1);
		assert!(ResponseCache::key("GET", "https://x", false).1);
		assert!(ResponseCache::key("", "https://x", false).1);
	}

	#[test]
	fn hit_then_expiry() {
		let cache = ResponseCache::new(10, 10_000);
		cache.put("GET:https://x", resp("hi"), Duration::from_millis(20));
		assert!(cache.get("GET:https://x").is_some());
		sleep(Duration::from_millis(30));
		assert!(cache.get("GET:https://x").is_none());
		let stats = cache.stats();
		assert_eq!(stats.hits, 1);
		assert_eq!(stats.misses, 1);
	}

	#[test]
	fn evicts_lru_when_item_cap_hit() {
		let cache = ResponseCache::new(2, 10_000);
		cache.put("GET:a", resp("a"), Duration::from_secs(60));
		cache.put("GET:b", resp("b"), Duration::from_secs(60));
		cache.put("GET:c", resp("c"), Duration::from_secs(60));
		assert!(cache.get("GET:a").is_none());
		assert!(cache.get("GET:b").is_some());
		assert!(cache.get("GET:c").is_some());
	}

	#[test]
	fn disabled_when_either_cap_is_zero() {
		let cache = ResponseCache::new(0, 10_000);
		assert!(!cache.enabled());
		cache.put("GET:a", resp("a"), Duration::from_secs(60));
		assert!(cache.get("GET:a").is_none());
	}

	#[test]
	fn clear_resets_everything() {
		let cache = ResponseCache::new(10, 10_000);
		cache.put("GET:a", resp("a"), Duration::from_secs(60));
		cache.clear();
		assert_eq!(cache.stats().items, 0);
		assert_eq!(cache.stats().bytes, 0);
	}
}
