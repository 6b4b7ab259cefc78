//! Named credentials with an injection recipe and optional domain binding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::cachecommon::ReadThroughCache;
use crate::error::{EgressError, ErrorKind};
use crate::host::canonicalize_host;
use crate::http_types::FetchRequest;
use crate::store::{SecretRow, SecretStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectMode {
	Bearer,
	Header,
	Query,
}

impl InjectMode {
	fn parse(s: &str) -> Result<Self, EgressError> {
		match s {
			"bearer" => Ok(InjectMode::Bearer),
			"header" => Ok(InjectMode::Header),
			"query" => Ok(InjectMode::Query),
			other => Err(EgressError::auth(format!("unknown inject mode: {other}"))),
		}
	}
}

#[derive(Clone)]
pub struct Secret {
	pub id: i64,
	pub name: String,
	pub value: SecretString,
	pub mode: InjectMode,
	pub inject_key: String,
	pub domain_binding: String,
	pub app: String,
}

impl From<SecretRow> for Secret {
	fn from(row: SecretRow) -> Self {
		Secret {
			id: row.id,
			name: row.name,
			value: SecretString::from(row.value),
			mode: InjectMode::parse(&row.mode).unwrap_or(InjectMode::Bearer),
			inject_key: row.inject_key,
			domain_binding: row.domain_binding,
			app: row.app,
		}
	}
}

#[derive(Default, Clone)]
struct Loaded {
	by_app: HashMap<String, Vec<Secret>>,
}

pub struct SecretsVault {
	store: Arc<dyn SecretStore>,
	cache: ReadThroughCache<(), Arc<Loaded>>,
	write_lock: tokio::sync::Mutex<()>,
}

impl SecretsVault {
	pub fn new(store: Arc<dyn SecretStore>, cache_ttl: Duration) -> Self {
		SecretsVault {
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
					.map_err(|e| EgressError::with_source(ErrorKind::Net, "secrets load failed", e))?;
				let mut by_app: HashMap<String, Vec<Secret>> = HashMap::new();
				for row in rows {
					let secret: Secret = row.into();
					by_app.entry(secret.app.clone()).or_default().push(secret);
				}
				Ok(Arc::new(Loaded { by_app }))
			})
			.await
	}

	pub async fn set(
		&self,
		name: &str,
		value: &str,
		mode: &str,
		inject_key: &str,
		domain_binding: &str,
		app: &str,
	) -> Result<(), EgressError> {
		let mode = InjectMode::parse(mode)?;
		if matches!(mode, InjectMode::Header | InjectMode::Query) && inject_key.is_empty() {
			return Err(EgressError::auth("inject-key is required for header/query mode"));
		}
		let domain_binding = if domain_binding.is_empty() {
			String::new()
		} else {
			canonicalize_host(domain_binding)
		};
		let _guard = self.write_lock.lock().await;
		self
			.store
			.set(name, value, mode_str(mode), inject_key, &domain_binding, app)
			.await
			.map_err(|e| EgressError::with_source(ErrorKind::Net, "secret set failed", e))?;
		self.cache.invalidate(&());
		Ok(())
	}

	pub async fn remove(&self, name: &str, app: &str) -> Result<(), EgressError> {
		let _guard = self.write_lock.lock().await;
		self
			.store
			.remove(name, app)
			.await
			.map_err(|e| EgressError::with_source(ErrorKind::Net, "secret remove failed", e))?;
		self.cache.invalidate(&());
		Ok(())
	}

	pub async fn lookup(&self, name: &str, app: &str) -> Result<Secret, EgressError> {
		let loaded = self.load().await?;
		if !app.is_empty() {
			if let Some(s) = loaded
				.by_app
				.get(app)
				.and_then(|v| v.iter().find(|s| s.name == name))
			{
				return Ok(s.clone());
			}
		}
		loaded
			.by_app
			.get("")
			.and_then(|v| v.iter().find(|s| s.name == name))
			.cloned()
			.ok_or_else(|| EgressError::auth(format!("no such secret: {name}")))
	}

	pub async fn list(&self, app: &str) -> Result<Vec<(String, String)>, EgressError> {
		let loaded = self.load().await?;
		Ok(loaded
			.by_app
			.get(app)
			.map(|v| {
				v.iter()
					.map(|s| (s.name.clone(), mask_value(s.value.expose_secret())))
					.collect()
			})
			.unwrap_or_default())
	}

	/// Apply `secret`'s injection recipe to `request`, verifying domain
	/// binding against the already-canonicalized `target_host`. Purely local:
	/// does not touch the store.
	pub fn inject_auth(
		&self,
		request: &mut FetchRequest,
		secret: &Secret,
		target_host: &str,
	) -> Result<(), EgressError> {
		if !secret.domain_binding.is_empty() && secret.domain_binding != target_host {
			return Err(EgressError::auth("secret domain binding mismatch"));
		}
		let value = secret.value.expose_secret();
		match secret.mode {
			InjectMode::Bearer => {
				request.headers.insert("authorization".to_string(), format!("Bearer {value}"));
			},
			InjectMode::Header => {
				request
					.headers
					.insert(secret.inject_key.to_ascii_lowercase(), value.to_string());
			},
			InjectMode::Query => {
				let mut url = url::Url::parse(&request.url)
					.map_err(|e| EgressError::with_source(ErrorKind::Auth, "invalid url for query injection", e))?;
				let pairs: Vec<(String, String)> = url
					.query_pairs()
					.filter(|(k, _)| k != secret.inject_key.as_str())
					.map(|(k, v)| (k.into_owned(), v.into_owned()))
					.chain(std::iter::once((secret.inject_key.clone(), value.to_string())))
					.collect();
				url.query_pairs_mut().clear().extend_pairs(&pairs);
				request.url = url.into();
			},
		}
		Ok(())
	}
}

fn mode_str(mode: InjectMode) -> &'static str {
	match mode {
		InjectMode::Bearer => "bearer",
		InjectMode::Header => "header",
		InjectMode::Query => "query",
	}
}

/// Mask a secret for list views: length ≤ 6 becomes all `*`; longer strings
/// keep the first and last three characters.
pub fn mask_value(s: &str) -> String {
	let len = s.chars().count();
	if len <= 6 {
		"*".repeat(len)
	} else {
		let chars: Vec<char> = s.chars().collect();
		let head: String = chars[..3].iter().collect();
		let tail: String = chars[len - 3..].iter().collect();
		format!("{head}{}{tail}", "*".repeat(len - 6))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::mem::MemSecretStore;

	fn vault() -> SecretsVault {
		SecretsVault::new(Arc::new(MemSecretStore::new()), Duration::from_secs(30))
	}

	#[tokio::test]
	async fn bearer_injection_sets_authorization() {
		let v = vault();
		v.set("tok", "abc123", "bearer", "", "", "").await.unwrap();
		let secret = v.lookup("tok", "").await.unwrap();
		let mut req = FetchRequest::new("GET", "https://api.example.com/x");
		v.inject_auth(&mut req, &secret, "api.example.com").unwrap();
		assert_eq!(req.headers.get("authorization").unwrap(), "Bearer abc123");
	}

	#[tokio::test]
	async fn header_mode_requires_inject_key() {
		let v = vault();
		let err = v.set("tok", "abc123", "header", "", "", "").await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::Auth);
	}

	#[tokio::test]
	async fn query_injection_replaces_existing_param() {
		let v = vault();
		v.set("tok", "abc123", "query", "api_key", "", "").await.unwrap();
		let secret = v.lookup("tok", "").await.unwrap();
		let mut req = FetchRequest::new("GET", "https://api.example.com/x?api_key=old&y=1");
		v.inject_auth(&mut req, &secret, "api.example.com").unwrap();
		assert!(req.url.contains("api_key=abc123"));
		assert!(!req.url.contains("api_key=old"));
	}

	#[tokio::test]
	async fn domain_binding_mismatch_is_auth_error() {
		let v = vault();
		v.set("tok", "abc123", "bearer", "", "other.example.com", "").await.unwrap();
		let secret = v.lookup("tok", "").await.unwrap();
		let mut req = FetchRequest::new("GET", "https://api.example.com/x");
		let err = v.inject_auth(&mut req, &secret, "api.example.com").unwrap_err();
		assert_eq!(err.kind, ErrorKind::Auth);
	}

	#[test]
	fn mask_value_boundary_at_six_and_seven_chars() {
		assert_eq!(mask_value("abcdef"), "******");
		assert_eq!(mask_value("abcdefg"), "abc*efg");
	}

	#[tokio::test]
	async fn app_scope_falls_back_to_global() {
		let v = vault();
		v.set("tok", "abc123", "bearer", "", "", "").await.unwrap();
		let secret = v.lookup("tok", "app1").await.unwrap();
		assert_eq!(secret.name, "tok");
	}
}
