//! In-memory store implementations used by unit tests in place of a real
//! database.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use super::{AllowlistRow, AllowlistStore, SecretRow, SecretStore};

#[derive(Default)]
pub struct MemAllowlistStore {
	rows: Mutex<Vec<AllowlistRow>>,
	next_id: AtomicI64,
}

impl MemAllowlistStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl AllowlistStore for MemAllowlistStore {
	async fn load_all(&self) -> Result<Vec<AllowlistRow>, anyhow::Error> {
		Ok(self.rows.lock().clone())
	}

	async fn add(&self, pattern: &str, app: &str, https_only: bool) -> Result<(), anyhow::Error> {
		let mut rows = self.rows.lock();
		rows.retain(|r| !(r.pattern == pattern && r.app == app));
		rows.push(AllowlistRow {
			id: self.next_id.fetch_add(1, Ordering::SeqCst),
			pattern: pattern.to_string(),
			app: app.to_string(),
			https_only,
			rate_override: 0,
			burst_override: 0,
			max_response_override: 0,
			timeout_override_ms: 0,
			cache_ttl_override_ms: 0,
			created_at: Utc::now(),
		});
		Ok(())
	}

	async fn remove(&self, pattern: &str, app: &str) -> Result<bool, anyhow::Error> {
		let mut rows = self.rows.lock();
		let before = rows.len();
		rows.retain(|r| !(r.pattern == pattern && r.app == app));
		Ok(rows.len() != before)
	}
}

#[derive(Default)]
pub struct MemSecretStore {
	rows: Mutex<Vec<SecretRow>>,
	next_id: AtomicI64,
}

impl MemSecretStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl SecretStore for MemSecretStore {
	async fn load_all(&self) -> Result<Vec<SecretRow>, anyhow::Error> {
		Ok(self.rows.lock().clone())
	}

	async fn set(
		&self,
		name: &str,
		value: &str,
		mode: &str,
		inject_key: &str,
		domain_binding: &str,
		app: &str,
	) -> Result<(), anyhow::Error> {
		let mut rows = self.rows.lock();
		rows.retain(|r| !(r.name == name && r.app == app));
		let now = Utc::now();
		rows.push(SecretRow {
			id: self.next_id.fetch_add(1, Ordering::SeqCst),
			name: name.to_string(),
			value: value.to_string(),
			mode: mode.to_string(),
			inject_key: inject_key.to_string(),
			domain_binding: domain_binding.to_string(),
			app: app.to_string(),
			created_at: now,
			updated_at: now,
		});
		Ok(())
	}

	async fn remove(&self, name: &str, app: &str) -> Result<bool, anyhow::Error> {
		let mut rows = self.rows.lock();
		let before = rows.len();
		rows.retain(|r| !(r.name == name && r.app == app));
		Ok(rows.len() != before)
	}
}
