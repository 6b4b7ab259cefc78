//! The statically-typed configuration surface, loadable from YAML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level proxy configuration. Every field has a sane default so a
/// deployment can override just the handful it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct ProxyConfig {
	/// Default requests-per-minute for a domain with no per-domain override.
	pub default_rate_per_minute: u32,
	/// Token bucket burst size; defaults to the per-minute rate when zero.
	pub default_burst: u32,

	/// Maximum number of fetches in flight across all apps.
	pub global_concurrency: usize,
	/// Maximum number of fetches in flight for a single app.
	pub per_app_concurrency: usize,

	/// Maximum request body size accepted from the caller, in bytes.
	pub max_request_bytes: u64,
	/// Maximum response body size read back from upstream, in bytes.
	pub max_response_bytes: u64,
	/// Maximum size of a response's header block, in bytes.
	pub max_response_header_bytes: usize,

	/// Maximum redirect hops followed before failing with `BLOCKED`.
	pub max_redirects: u8,

	/// Overall per-call deadline.
	#[serde(with = "duration_millis")]
	pub call_timeout: Duration,
	/// Deadline for establishing the TCP connection.
	#[serde(with = "duration_millis")]
	pub dial_timeout: Duration,

	/// Maximum number of entries held in the response cache.
	pub cache_capacity: usize,
	/// Maximum total bytes the response cache may hold across all entries,
	/// independent of the per-response `max_response_bytes` cap.
	pub cache_max_bytes: usize,
	/// Default TTL applied to a cached response lacking explicit
	/// cache-control freshness information.
	#[serde(with = "duration_millis")]
	pub cache_default_ttl: Duration,

	/// Number of entries the audit logger buffers before a flush.
	pub audit_buffer_size: usize,
	/// Maximum interval between audit flushes even if the buffer isn't full.
	#[serde(with = "duration_millis")]
	pub audit_flush_interval: Duration,

	/// TTL applied to the allowlist/secrets read-through caches.
	#[serde(with = "duration_millis")]
	pub lookup_cache_ttl: Duration,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		ProxyConfig {
			default_rate_per_minute: 600,
			default_burst: 600,
			global_concurrency: 256,
			per_app_concurrency: 16,
			max_request_bytes: 1024 * 1024,
			max_response_bytes: 10 * 1024 * 1024,
			max_response_header_bytes: 1024 * 1024,
			max_redirects: 5,
			call_timeout: Duration::from_secs(30),
			dial_timeout: Duration::from_secs(5),
			cache_capacity: 10_000,
			cache_max_bytes: 256 * 1024 * 1024,
			cache_default_ttl: Duration::from_secs(60),
			audit_buffer_size: 1024,
			audit_flush_interval: Duration::from_secs(2),
			lookup_cache_ttl: Duration::from_secs(30),
		}
	}
}

impl ProxyConfig {
	pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(s)
	}
}

mod duration_millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let millis = u64::deserialize(d)?;
		Ok(Duration::from_millis(millis))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_usable() {
		let cfg = ProxyConfig::default();
		assert!(cfg.global_concurrency >= cfg.per_app_concurrency);
	}

	#[test]
	fn parses_partial_yaml_with_defaults() {
		let cfg = ProxyConfig::from_yaml("defaultRatePerMinute: 120\n").unwrap();
		assert_eq!(cfg.default_rate_per_minute, 120);
		assert_eq!(cfg.global_concurrency, ProxyConfig::default().global_concurrency);
	}
}
