//! `sqlx`-backed storage against the three fixed tables. Runs over
//! `sqlx::AnyPool` so the same queries serve either a sqlite or postgres
//! deployment; callers pick the backend by connection string.

use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use super::{AllowlistRow, AllowlistStore, AuditStore, LogRow, SecretRow, SecretStore};

/// Shared handle to the durable store. One instance backs all three traits.
#[derive(Clone)]
pub struct SqlxStore {
	pool: AnyPool,
}

impl SqlxStore {
	pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
		sqlx::any::install_default_drivers();
		let pool = AnyPoolOptions::new().max_connections(10).connect(url).await?;
		Ok(SqlxStore { pool })
	}

	/// Create the three tables if they do not already exist. Intended for
	/// sqlite-backed test/dev deployments; production schemas are expected
	/// to be migrated out of band.
	pub async fn migrate(&self) -> Result<(), anyhow::Error> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS net_allowlist (
				id INTEGER PRIMARY KEY,
				domain TEXT NOT NULL,
				app_id TEXT NOT NULL DEFAULT '',
				https_only INTEGER NOT NULL DEFAULT 0,
				rate_limit INTEGER NOT NULL DEFAULT 0,
				rate_burst INTEGER NOT NULL DEFAULT 0,
				max_response INTEGER NOT NULL DEFAULT 0,
				timeout_ms INTEGER NOT NULL DEFAULT 0,
				cache_ttl INTEGER NOT NULL DEFAULT 0,
				created_at TEXT NOT NULL,
				UNIQUE(domain, app_id)
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS net_secrets (
				id INTEGER PRIMARY KEY,
				app_id TEXT NOT NULL DEFAULT '',
				name TEXT NOT NULL,
				value TEXT NOT NULL,
				inject_as TEXT NOT NULL,
				inject_key TEXT,
				domain TEXT,
				created_at TEXT NOT NULL,
				updated_at TEXT NOT NULL,
				UNIQUE(app_id, name)
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS net_log (
				id INTEGER PRIMARY KEY,
				app_id TEXT NOT NULL,
				domain TEXT NOT NULL,
				method TEXT NOT NULL,
				path TEXT NOT NULL,
				status INTEGER,
				error_code TEXT,
				duration_ms INTEGER NOT NULL,
				request_bytes INTEGER NOT NULL,
				response_bytes INTEGER NOT NULL,
				created_at TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}

fn app_or_empty(v: Option<String>) -> String {
	v.unwrap_or_default()
}

#[async_trait::async_trait]
impl AllowlistStore for SqlxStore {
	async fn load_all(&self) -> Result<Vec<AllowlistRow>, anyhow::Error> {
		let rows = sqlx::query(
			"SELECT id, domain, app_id, https_only, rate_limit, rate_burst, max_response, timeout_ms, cache_ttl, created_at FROM net_allowlist",
		)
		.fetch_all(&self.pool)
		.await?;
		rows
			.into_iter()
			.map(|row| {
				Ok(AllowlistRow {
					id: row.try_get::<i64, _>("id")?,
					pattern: row.try_get::<String, _>("domain")?,
					app: row.try_get::<String, _>("app_id")?,
					https_only: row.try_get::<i64, _>("https_only")? != 0,
					rate_override: row.try_get::<i64, _>("rate_limit")?,
					burst_override: row.try_get::<i64, _>("rate_burst")?,
					max_response_override: row.try_get::<i64, _>("max_response")?,
					timeout_override_ms: row.try_get::<i64, _>("timeout_ms")?,
					cache_ttl_override_ms: row.try_get::<i64, _>("cache_ttl")?,
					created_at: row
						.try_get::<String, _>("created_at")?
						.parse::<DateTime<Utc>>()
						.unwrap_or_else(|_| Utc::now()),
				})
			})
			.collect()
	}

	async fn add(&self, pattern: &str, app: &str, https_only: bool) -> Result<(), anyhow::Error> {
		// app is stored as '' for the global scope, never NULL, so the
		// (domain, app_id) unique index actually dedupes global-scope rows --
		// NULL is never equal to NULL under a unique constraint.
		sqlx::query(
			"INSERT INTO net_allowlist (domain, app_id, https_only, created_at) VALUES (?, ?, ?, ?)
			 ON CONFLICT(domain, app_id) DO UPDATE SET https_only = excluded.https_only",
		)
		.bind(pattern)
		.bind(app)
		.bind(https_only as i64)
		.bind(Utc::now().to_rfc3339())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn remove(&self, pattern: &str, app: &str) -> Result<bool, anyhow::Error> {
		let result = sqlx::query("DELETE FROM net_allowlist WHERE domain = ? AND app_id = ?")
			.bind(pattern)
			.bind(app)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}
}

#[async_trait::async_trait]
impl SecretStore for SqlxStore {
	async fn load_all(&self) -> Result<Vec<SecretRow>, anyhow::Error> {
		let rows = sqlx::query(
			"SELECT id, app_id, name, value, inject_as, inject_key, domain, created_at, updated_at FROM net_secrets",
		)
		.fetch_all(&self.pool)
		.await?;
		rows
			.into_iter()
			.map(|row| {
				Ok(SecretRow {
					id: row.try_get::<i64, _>("id")?,
					name: row.try_get::<String, _>("name")?,
					value: row.try_get::<String, _>("value")?,
					mode: row.try_get::<String, _>("inject_as")?,
					inject_key: app_or_empty(row.try_get::<Option<String>, _>("inject_key")?),
					domain_binding: app_or_empty(row.try_get::<Option<String>, _>("domain")?),
					app: row.try_get::<String, _>("app_id")?,
					created_at: row
						.try_get::<String, _>("created_at")?
						.parse::<DateTime<Utc>>()
						.unwrap_or_else(|_| Utc::now()),
					updated_at: row
						.try_get::<String, _>("updated_at")?
						.parse::<DateTime<Utc>>()
						.unwrap_or_else(|_| Utc::now()),
				})
			})
			.collect()
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
		let inject_key = if inject_key.is_empty() { None } else { Some(inject_key) };
		let domain_binding = if domain_binding.is_empty() { None } else { Some(domain_binding) };
		let now = Utc::now().to_rfc3339();
		// app is stored as '' for the global scope, never NULL -- see add() above.
		sqlx::query(
			"INSERT INTO net_secrets (app_id, name, value, inject_as, inject_key, domain, created_at, updated_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
			 ON CONFLICT(app_id, name) DO UPDATE SET
				value = excluded.value, inject_as = excluded.inject_as,
				inject_key = excluded.inject_key, domain = excluded.domain,
				updated_at = excluded.updated_at",
		)
		.bind(app)
		.bind(name)
		.bind(value)
		.bind(mode)
		.bind(inject_key)
		.bind(domain_binding)
		.bind(&now)
		.bind(&now)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn remove(&self, name: &str, app: &str) -> Result<bool, anyhow::Error> {
		let result = sqlx::query("DELETE FROM net_secrets WHERE name = ? AND app_id = ?")
			.bind(name)
			.bind(app)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}
}

#[async_trait::async_trait]
impl AuditStore for SqlxStore {
	async fn insert_batch(&self, rows: &[LogRow]) -> Result<(), anyhow::Error> {
		if rows.is_empty() {
			return Ok(());
		}
		let mut tx = self.pool.begin().await?;
		for row in rows {
			sqlx::query(
				"INSERT INTO net_log (app_id, domain, method, path, status, error_code, duration_ms, request_bytes, response_bytes, created_at)
				 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
			)
			.bind(&row.app)
			.bind(&row.host)
			.bind(&row.method)
			.bind(&row.path)
			.bind(row.status.map(|s| s as i64))
			.bind(&row.error_code)
			.bind(row.duration_ms)
			.bind(row.request_bytes)
			.bind(row.response_bytes)
			.bind(row.created_at.to_rfc3339())
			.execute(&mut *tx)
			.await?;
		}
		tx.commit().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn temp_store() -> (SqlxStore, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("store.db");
		let store = SqlxStore::connect(&format!("sqlite://{}?mode=rwc", path.display())).await.unwrap();
		store.migrate().await.unwrap();
		(store, dir)
	}

	#[tokio::test]
	async fn global_scope_add_dedupes_instead_of_inserting_twice() {
		let (store, _dir) = temp_store().await;
		AllowlistStore::add(&store, "example.com", "", false).await.unwrap();
		AllowlistStore::add(&store, "example.com", "", true).await.unwrap();

		let rows = AllowlistStore::load_all(&store).await.unwrap();
		let matching: Vec<_> = rows.iter().filter(|r| r.pattern == "example.com" && r.app.is_empty()).collect();
		assert_eq!(matching.len(), 1, "global-scope add should upsert, not duplicate");
		assert!(matching[0].https_only, "second add should have updated the existing row");
	}

	#[tokio::test]
	async fn global_and_scoped_allowlist_entries_coexist() {
		let (store, _dir) = temp_store().await;
		AllowlistStore::add(&store, "example.com", "", false).await.unwrap();
		AllowlistStore::add(&store, "example.com", "app-a", true).await.unwrap();

		let rows = AllowlistStore::load_all(&store).await.unwrap();
		let matching: Vec<_> = rows.iter().filter(|r| r.pattern == "example.com").collect();
		assert_eq!(matching.len(), 2, "global and per-app scopes are distinct rows");
	}

	#[tokio::test]
	async fn global_scope_secret_set_dedupes_instead_of_inserting_twice() {
		let (store, _dir) = temp_store().await;
		SecretStore::set(&store, "api-key", "first", "bearer", "", "", "").await.unwrap();
		SecretStore::set(&store, "api-key", "second", "bearer", "", "", "").await.unwrap();

		let rows = SecretStore::load_all(&store).await.unwrap();
		let matching: Vec<_> = rows.iter().filter(|r| r.name == "api-key" && r.app.is_empty()).collect();
		assert_eq!(matching.len(), 1, "global-scope set should upsert, not duplicate");
		assert_eq!(matching[0].value, "second");
	}

	#[tokio::test]
	async fn remove_only_affects_matching_scope() {
		let (store, _dir) = temp_store().await;
		AllowlistStore::add(&store, "example.com", "", false).await.unwrap();
		AllowlistStore::add(&store, "example.com", "app-a", false).await.unwrap();

		let removed = AllowlistStore::remove(&store, "example.com", "").await.unwrap();
		assert!(removed);

		let rows = AllowlistStore::load_all(&store).await.unwrap();
		let matching: Vec<_> = rows.iter().filter(|r| r.pattern == "example.com").collect();
		assert_eq!(matching.len(), 1);
		assert_eq!(matching[0].app, "app-a");
	}
}
