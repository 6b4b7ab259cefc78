//! Durable storage traits for the allowlist, secrets vault, and audit log,
//! plus an `sqlx`-backed implementation against the three fixed tables.

pub mod mem;
pub mod sqlx_store;

pub use sqlx_store::SqlxStore;

use chrono::{DateTime, Utc};

/// One row of `net_allowlist`.
#[derive(Debug, Clone)]
pub struct AllowlistRow {
	pub id: i64,
	pub pattern: String,
	pub app: String,
	pub https_only: bool,
	pub rate_override: i64,
	pub burst_override: i64,
	pub max_response_override: i64,
	pub timeout_override_ms: i64,
	pub cache_ttl_override_ms: i64,
	pub created_at: DateTime<Utc>,
}

/// One row of `net_secrets`. `value` is the plaintext credential; callers
/// wrap it in `secrecy::SecretString` immediately on load.
#[derive(Debug, Clone)]
pub struct SecretRow {
	pub id: i64,
	pub name: String,
	pub value: String,
	pub mode: String,
	pub inject_key: String,
	pub domain_binding: String,
	pub app: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// One row of `net_log`.
#[derive(Debug, Clone)]
pub struct LogRow {
	pub app: String,
	pub host: String,
	pub method: String,
	pub path: String,
	pub status: Option<u16>,
	pub error_code: Option<String>,
	pub duration_ms: i64,
	pub request_bytes: i64,
	pub response_bytes: i64,
	pub created_at: DateTime<Utc>,
}

/// Storage for `net_allowlist`. Backed by `SqlxStore` in production and by
/// `mem::MemAllowlistStore` in tests.
#[async_trait::async_trait]
pub trait AllowlistStore: Send + Sync {
	async fn load_all(&self) -> Result<Vec<AllowlistRow>, anyhow::Error>;
	async fn add(&self, pattern: &str, app: &str, https_only: bool) -> Result<(), anyhow::Error>;
	/// Returns whether a row existed and was removed.
	async fn remove(&self, pattern: &str, app: &str) -> Result<bool, anyhow::Error>;
}

/// Storage for `net_secrets`.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
	async fn load_all(&self) -> Result<Vec<SecretRow>, anyhow::Error>;
	#[allow(clippy::too_many_arguments)]
	async fn set(
		&self,
		name: &str,
		value: &str,
		mode: &str,
		inject_key: &str,
		domain_binding: &str,
		app: &str,
	) -> Result<(), anyhow::Error>;
	async fn remove(&self, name: &str, app: &str) -> Result<bool, anyhow::Error>;
}

/// Storage for `net_log`; all writes happen in one batch transaction.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
	async fn insert_batch(&self, rows: &[LogRow]) -> Result<(), anyhow::Error>;
}
