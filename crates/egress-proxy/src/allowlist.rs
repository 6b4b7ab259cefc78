//! Durable `(domain-pattern, app-scope)` entries with per-domain policy
//! overrides, fronted by a short-TTL read-through cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cachecommon::ReadThroughCache;
use crate::error::EgressError;
use crate::host::canonicalize_host;
use crate::store::{AllowlistRow, AllowlistStore};

/// A loaded allowlist entry plus the policy overrides it carries. Zero means
/// "use the proxy-wide default" for every override field.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowlistEntry {
	pub id: i64,
	pub pattern: String,
	pub app: String,
	pub https_only: bool,
	pub rate_override: u32,
	pub burst_override: u32,
	pub max_response_override: u64,
	pub timeout_override_ms: u64,
	pub cache_ttl_override_ms: u64,
}

impl AllowlistEntry {
	fn matches(&self, host: &str) -> bool {
		if let Some(suffix) = self.pattern.strip_prefix("*.") {
			host.ends_with(suffix) && host != suffix && host.len() > suffix.len()
		} else {
			host == self.pattern
		}
	}
}

impl From<AllowlistRow> for AllowlistEntry {
	fn from(row: AllowlistRow) -> Self {
		AllowlistEntry {
			id: row.id,
			pattern: row.pattern,
			app: row.app,
			https_only: row.https_only,
			rate_override: row.rate_override as u32,
			burst_override: row.burst_override as u32,
			max_response_override: row.max_response_override as u64,
			timeout_override_ms: row.timeout_override_ms as u64,
			cache_ttl_override_ms: row.cache_ttl_override_ms as u64,
		}
	}
}

/// Per-app partitioned view of all loaded entries, as cached in memory.
#[derive(Default, Clone)]
struct Loaded {
	by_app: HashMap<String, Vec<AllowlistEntry>>,
}

pub struct Allowlist {
	store: Arc<dyn AllowlistStore>,
	cache: ReadThroughCache<(), Arc<Loaded>>,
	// protects Add/Remove from racing a concurrent reload
	write_lock: tokio::sync::Mutex<()>,
}

impl Allowlist {
	pub fn new(store: Arc<dyn AllowlistStore>, cache_ttl: Duration) -> Self {
		Allowlist {
			store,
			cache: ReadThroughCache::new(cache_ttl),
			write_lock: tokio::sync::Mutex::new(()),
		}
	}

	async fn load(&self) -> Result<Arc<Loaded>, EgressError> {
		self
			.cache
			.get_or_load(&(), || async {
				let rows = self
					.store
					.load_all()
					.await
					.map_err(|e| EgressError::with_source(crate::error::ErrorKind::Net, "allowlist load failed", e))?;
				let mut by_app: HashMap<String, Vec<AllowlistEntry>> = HashMap::new();
				for row in rows {
					let entry: AllowlistEntry = row.into();
					by_app.entry(entry.app.clone()).or_default().push(entry);
				}
				Ok(Arc::new(Loaded { by_app }))
			})
			.await
	}

	async fn find(&self, host: &str, app: &str) -> Result<Option<AllowlistEntry>, EgressError> {
		let loaded = self.load().await?;
		if !app.is_empty() {
			if let Some(entries) = loaded.by_app.get(app) {
				if let Some(e) = entries.iter().find(|e| e.matches(host)) {
					return Ok(Some(e.clone()));
				}
			}
		}
		if let Some(entries) = loaded.by_app.get("") {
			if let Some(e) = entries.iter().find(|e| e.matches(host)) {
				return Ok(Some(e.clone()));
			}
		}
		Ok(None)
	}

	pub async fn is_allowed(&self, host: &str, app: &str) -> Result<bool, EgressError> {
		let host = canonicalize_host(host);
		Ok(self.find(&host, app).await?.is_some())
	}

	pub async fn entry_for(&self, host: &str, app: &str) -> Result<Option<AllowlistEntry>, EgressError> {
		let host = canonicalize_host(host);
		self.find(&host, app).await
	}

	pub async fn add(&self, pattern: &str, app: &str, https_only: bool) -> Result<(), EgressError> {
		let _guard = self.write_lock.lock().await;
		let pattern = canonicalize_host(pattern);
		if pattern == "*" {
			return Err(EgressError::blocked("bare wildcard pattern is not allowed"));
		}
		self
			.store
			.add(&pattern, app, https_only)
			.await
			.map_err(|e| EgressError::with_source(crate::error::ErrorKind::Net, "allowlist add failed", e))?;
		self.cache.invalidate(&());
		Ok(())
	}

	pub async fn remove(&self, pattern: &str, app: &str) -> Result<(), EgressError> {
		let _guard = self.write_lock.lock().await;
		let pattern = canonicalize_host(pattern);
		let removed = self
			.store
			.remove(&pattern, app)
			.await
			.map_err(|e| EgressError::with_source(crate::error::ErrorKind::Net, "allowlist remove failed", e))?;
		if !removed {
			return Err(EgressError::blocked("no such allowlist entry"));
		}
		self.cache.invalidate(&());
		Ok(())
	}

	pub async fn list(&self, app: &str) -> Result<Vec<AllowlistEntry>, EgressError> {
		let loaded = self.load().await?;
		Ok(loaded.by_app.get(app).cloned().unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::mem::MemAllowlistStore;

	async fn vault(entries: &[(&str, &str, bool)]) -> Allowlist {
		let store = Arc::new(MemAllowlistStore::new());
		for (pattern, app, https_only) in entries {
			store.add(pattern, app, *https_only).await.unwrap();
		}
		Allowlist::new(store, Duration::from_secs(30))
	}

	#[tokio::test]
	async fn exact_pattern_matches_only_itself() {
		let a = vault(&[("a.b.c", "", false)]).await;
		assert!(a.is_allowed("a.b.c", "").await.unwrap());
		assert!(!a.is_allowed("x.a.b.c", "").await.unwrap());
	}

	#[tokio::test]
	async fn wildcard_excludes_apex() {
		let a = vault(&[("*.b.c", "", false)]).await;
		assert!(a.is_allowed("x.b.c", "").await.unwrap());
		assert!(!a.is_allowed("b.c", "").await.unwrap());
	}

	#[tokio::test]
	async fn app_scope_resolves_before_global() {
		let a = vault(&[("a.b.c", "app1", false), ("a.b.c", "", true)]).await;
		let entry = a.entry_for("a.b.c", "app1").await.unwrap().unwrap();
		assert_eq!(entry.app, "app1");
		assert!(!entry.https_only);
	}

	#[tokio::test]
	async fn falls_back_to_global_when_app_scope_absent() {
		let a = vault(&[("a.b.c", "", false)]).await;
		assert!(a.is_allowed("a.b.c", "app1").await.unwrap());
	}

	#[tokio::test]
	async fn bare_wildcard_rejected() {
		let a = vault(&[]).await;
		let err = a.add("*", "", false).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Blocked);
	}

	#[tokio::test]
	async fn remove_nonexistent_is_blocked() {
		let a = vault(&[]).await;
		let err = a.remove("a.b.c", "").await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Blocked);
	}

	#[tokio::test]
	async fn canonicalizes_before_matching() {
		let a = vault(&[("A.B.C", "", false)]).await;
		assert!(a.is_allowed("a.b.c:443", "").await.unwrap());
	}
}
