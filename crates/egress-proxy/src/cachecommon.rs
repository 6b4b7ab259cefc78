//! A small read-through cache shared by the allowlist and secrets vault:
//! both sit in front of a store that may be a network round trip away, and
//! both want the same "serve stale for up to TTL, reload on miss" behavior.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

struct Entry<V> {
	value: V,
	loaded_at: Instant,
}

/// Caches the result of an expensive lookup for `ttl`, reloading on the next
/// access once expired. Concurrent reloads of the same key are not
/// deduplicated -- the loader is expected to be cheap enough (a single SQL
/// row lookup) that a double-checked reload race is harmless.
pub struct ReadThroughCache<K, V> {
	ttl: Duration,
	entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> ReadThroughCache<K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	pub fn new(ttl: Duration) -> Self {
		ReadThroughCache {
			ttl,
			entries: RwLock::new(HashMap::new()),
		}
	}

	/// Return the cached value for `key`, calling `load` if absent or stale.
	/// `load` returning `Err` propagates the error without poisoning the
	/// cache; a prior fresh value (if any) is left in place.
	pub async fn get_or_load<F, Fut, E>(&self, key: &K, load: F) -> Result<V, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V, E>>,
	{
		if let Some(v) = self.peek_fresh(key) {
			return Ok(v);
		}
		let value = load().await?;
		self.entries.write().insert(
			key.clone(),
			Entry {
				value: value.clone(),
				loaded_at: Instant::now(),
			},
		);
		Ok(value)
	}

	fn peek_fresh(&self, key: &K) -> Option<V> {
		let guard = self.entries.read();
		let entry = guard.get(key)?;
		if entry.loaded_at.elapsed() < self.ttl {
			Some(entry.value.clone())
		} else {
			None
		}
	}

	/// Drop a key immediately, e.g. after a mutation makes it stale.
	pub fn invalidate(&self, key: &K) {
		self.entries.write().remove(key);
	}

	/// Drop every cached entry.
	pub fn clear(&self) {
		self.entries.write().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn reloads_only_after_ttl() {
		let cache: ReadThroughCache<String, u32> = ReadThroughCache::new(Duration::from_millis(20));
		let calls = AtomicUsize::new(0);
		let key = "a".to_string();

		let load = || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Ok::<_, ()>(1) }
		};
		assert_eq!(cache.get_or_load(&key, load).await.unwrap(), 1);
		assert_eq!(cache.get_or_load(&key, load).await.unwrap(), 1);
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(cache.get_or_load(&key, load).await.unwrap(), 1);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn invalidate_forces_reload() {
		let cache: ReadThroughCache<String, u32> = ReadThroughCache::new(Duration::from_secs(60));
		let key = "a".to_string();
		cache.get_or_load(&key, || async { Ok::<_, ()>(1) }).await.unwrap();
		cache.invalidate(&key);
		let v = cache.get_or_load(&key, || async { Ok::<_, ()>(2) }).await.unwrap();
		assert_eq!(v, 2);
	}
}
