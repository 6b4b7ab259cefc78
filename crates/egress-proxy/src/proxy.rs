//! The coordinator: composes the allowlist, secrets vault, rate limiter,
//! response cache, and audit logger around a hardened HTTP client and
//! exposes the single `Fetch` entry point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::Request;
use parking_lot::RwLock;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::allowlist::{Allowlist, AllowlistEntry};
use crate::audit::{AuditLogger, LogRecord};
use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::dial::{self, ConnPool, Conn};
use crate::error::{EgressError, ErrorKind};
use crate::host::{canonicalize_host, parse_ip_literal};
use crate::http_types::{FetchRequest, FetchResponse, UNSAFE_REQUEST_HEADERS};
use crate::ratelimit::RateLimiter;
use crate::secrets::SecretsVault;
use hickory_resolver::TokioResolver;

/// Guards a concurrency slot increment, decrementing on drop regardless of
/// how `Fetch` returns.
struct ConnGuard<'a> {
	global: &'a AtomicUsize,
	per_app: Arc<AtomicUsize>,
}

impl Drop for ConnGuard<'_> {
	fn drop(&mut self) {
		self.global.fetch_sub(1, Ordering::Relaxed);
		self.per_app.fetch_sub(1, Ordering::Relaxed);
	}
}

/// Result of walking the redirect chain, tagged with whether it was served
/// from the response cache so the caller can skip audit-logging cache hits
/// as upstream traffic.
struct DispatchOutcome {
	response: FetchResponse,
	host: String,
	path: String,
	from_cache: bool,
}

pub struct EgressProxy {
	config: ProxyConfig,
	allowlist: Option<Arc<Allowlist>>,
	secrets: Option<Arc<SecretsVault>>,
	cache: Option<Arc<ResponseCache>>,
	audit: Option<Arc<AuditLogger>>,
	rate_limiter: RateLimiter,
	resolver: TokioResolver,
	tls_connector: TlsConnector,
	pool: ConnPool,
	global_conns: AtomicUsize,
	app_conns: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl EgressProxy {
	pub fn new(config: ProxyConfig) -> Result<Self, EgressError> {
		let tls_connector = dial::build_tls_connector()?;
		Ok(EgressProxy {
			rate_limiter: RateLimiter::new(config.default_rate_per_minute, config.default_burst),
			resolver: dial::build_resolver(),
			tls_connector,
			pool: ConnPool::new(config.global_concurrency.max(16)),
			global_conns: AtomicUsize::new(0),
			app_conns: RwLock::new(HashMap::new()),
			allowlist: None,
			secrets: None,
			cache: None,
			audit: None,
			config,
		})
	}

	pub fn with_allowlist(mut self, allowlist: Arc<Allowlist>) -> Self {
		self.allowlist = Some(allowlist);
		self
	}

	pub fn with_secrets(mut self, secrets: Arc<SecretsVault>) -> Self {
		self.secrets = Some(secrets);
		self
	}

	pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
		self.cache = Some(cache);
		self
	}

	pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
		self.audit = Some(audit);
		self
	}

	/// The configured per-invocation call budget; the guest runtime is
	/// responsible for counting and enforcing it.
	pub fn max_calls_hint(&self) -> usize {
		self.config.global_concurrency
	}

	fn app_counter(&self, app: &str) -> Arc<AtomicUsize> {
		if let Some(counter) = self.app_conns.read().get(app) {
			return counter.clone();
		}
		let mut guard = self.app_conns.write();
		guard.entry(app.to_string()).or_insert_with(|| Arc::new(AtomicUsize::new(0))).clone()
	}

	pub async fn fetch(&self, app: &str, request: FetchRequest) -> Result<FetchResponse, EgressError> {
		let timeout = request.timeout.unwrap_or(self.config.call_timeout);
		match tokio::time::timeout(timeout, self.fetch_inner(app, request)).await {
			Ok(result) => result,
			Err(_) => Err(EgressError::timeout("call deadline exceeded")),
		}
	}

	async fn fetch_inner(&self, app: &str, mut request: FetchRequest) -> Result<FetchResponse, EgressError> {
		if request.method.is_empty() {
			request.method = "GET".to_string();
		}

		let started = Instant::now();
		let url = Url::parse(&request.url).map_err(|e| EgressError::with_source(ErrorKind::Blocked, "invalid url", e))?;
		let result = self.dispatch_with_redirects(app, &request, url).await;

		let from_cache = matches!(&result, Ok(outcome) if outcome.from_cache);
		let (status, error_code, req_bytes, resp_bytes, host_for_log, path_for_log) = match &result {
			Ok(outcome) => (
				Some(outcome.response.status),
				None,
				request.body.len() as u64,
				outcome.response.body.len() as u64,
				outcome.host.clone(),
				outcome.path.clone(),
			),
			Err(err) => (None, Some(err.kind.code().to_string()), request.body.len() as u64, 0, host_of(&request.url), path_of(&request.url)),
		};

		// cache hits are not upstream traffic and must not be logged as such
		if !from_cache {
			if let Some(audit) = &self.audit {
				audit.log(LogRecord {
					app: app.to_string(),
					host: host_for_log,
					method: request.method.clone(),
					path: path_for_log,
					status,
					error_code,
					duration: started.elapsed(),
					request_bytes: req_bytes,
					response_bytes: resp_bytes,
					timestamp: None,
				});
			}
		}

		result.map(|outcome| outcome.response)
	}

	async fn dispatch_with_redirects(
		&self,
		app: &str,
		original: &FetchRequest,
		original_url: Url,
	) -> Result<DispatchOutcome, EgressError> {
		let original_host = original_url
			.host_str()
			.ok_or_else(|| EgressError::blocked("url has no host"))?
			.to_string();
		let original_host = canonicalize_host(&original_host);
		let original_path = original_url.path().to_string();

		let mut hop = 0u8;
		let mut url = original_url.clone();
		let mut current_request = original.clone();
		loop {
			let host = url.host_str().ok_or_else(|| EgressError::blocked("url has no host"))?.to_string();
			let host = canonicalize_host(&host);

			self.validate_pre_dial(&url, &host, app)?;
			let entry = self.entry_for(&host, app).await?;
			self.check_https_and_allowlist(&url, &host, &entry)?;

			if hop == 0 {
				self.run_gates(&host, app, &current_request, &entry)?;
				if let Some(cached) = self.cache_lookup(original, &original_url) {
					return Ok(DispatchOutcome {
						response: cached,
						host: original_host,
						path: original_path,
						from_cache: true,
					});
				}
			}

			let guard = self.acquire_slots(app);
			let response_result = self.dispatch_once(app, &url, &host, &current_request, &entry).await;
			drop(guard);

			let response = response_result?;

			if !(300..400).contains(&response.status) {
				self.maybe_cache(original, &original_url, &response, &entry);
				return Ok(DispatchOutcome {
					response,
					host: original_host,
					path: original_path,
					from_cache: false,
				});
			}

			hop += 1;
			if hop > self.config.max_redirects {
				return Err(EgressError::blocked("too many redirects"));
			}
			let location = response
				.headers
				.get("location")
				.ok_or_else(|| EgressError::blocked("redirect missing location"))?;
			url = url.join(location).map_err(|e| EgressError::with_source(ErrorKind::Blocked, "invalid redirect location", e))?;
			current_request.body = Vec::new();
			current_request.method = "GET".to_string();
		}
	}

	fn validate_pre_dial(&self, url: &Url, host: &str, _app: &str) -> Result<(), EgressError> {
		if parse_ip_literal(host).is_some() {
			return Err(EgressError::blocked("IP-literal hosts are not allowed"));
		}
		match url.scheme() {
			"http" | "https" => {},
			other => return Err(EgressError::blocked(format!("unsupported scheme: {other}"))),
		}
		Ok(())
	}

	async fn entry_for(&self, host: &str, app: &str) -> Result<Option<AllowlistEntry>, EgressError> {
		match &self.allowlist {
			Some(allowlist) => allowlist.entry_for(host, app).await,
			None => Ok(None),
		}
	}

	fn check_https_and_allowlist(&self, url: &Url, host: &str, entry: &Option<AllowlistEntry>) -> Result<(), EgressError> {
		if url.scheme() != "https" {
			match entry {
				Some(e) if !e.https_only => {},
				_ => return Err(EgressError::blocked("non-HTTPS requires an explicit allowlist entry with https-only disabled")),
			}
		}
		if entry.is_none() {
			return Err(EgressError::blocked(format!("{host} is not on the allowlist")));
		}
		Ok(())
	}

	fn run_gates(&self, host: &str, app: &str, request: &FetchRequest, entry: &Option<AllowlistEntry>) -> Result<(), EgressError> {
		let (rate_override, burst_override) = entry.as_ref().map(|e| (e.rate_override, e.burst_override)).unwrap_or((0, 0));
		if !self.rate_limiter.allow(host, rate_override, burst_override) {
			return Err(EgressError::rate(format!("rate limit exceeded for {host}")));
		}
		if request.body.len() as u64 > self.config.max_request_bytes {
			return Err(EgressError::size("request body exceeds configured limit"));
		}
		if self.global_conns.load(Ordering::Relaxed) >= self.config.global_concurrency {
			return Err(EgressError::limit("global concurrency limit reached"));
		}
		let app_counter = self.app_counter(app);
		if app_counter.load(Ordering::Relaxed) >= self.config.per_app_concurrency {
			return Err(EgressError::limit("per-app concurrency limit reached"));
		}
		Ok(())
	}

	fn acquire_slots(&self, app: &str) -> ConnGuard<'_> {
		self.global_conns.fetch_add(1, Ordering::Relaxed);
		let per_app = self.app_counter(app);
		per_app.fetch_add(1, Ordering::Relaxed);
		ConnGuard {
			global: &self.global_conns,
			per_app,
		}
	}

	fn cache_lookup(&self, request: &FetchRequest, url: &Url) -> Option<FetchResponse> {
		let cache = self.cache.as_ref()?;
		let (key, cacheable) = ResponseCache::key(&request.method, url.as_str(), !request.auth_name.is_empty());
		if !cacheable {
			return None;
		}
		cache.get(&key)
	}

	fn maybe_cache(&self, request: &FetchRequest, url: &Url, response: &FetchResponse, entry: &Option<AllowlistEntry>) {
		let Some(cache) = &self.cache else { return };
		if !response.ok {
			return;
		}
		let (key, cacheable) = ResponseCache::key(&request.method, url.as_str(), !request.auth_name.is_empty());
		if !cacheable {
			return;
		}
		let ttl_ms = entry.as_ref().map(|e| e.cache_ttl_override_ms).unwrap_or(0);
		let ttl = if ttl_ms > 0 { Duration::from_millis(ttl_ms) } else { self.config.cache_default_ttl };
		if ttl.is_zero() {
			return;
		}
		cache.put(&key, response.clone(), ttl);
	}

	async fn dispatch_once(
		&self,
		app: &str,
		url: &Url,
		host: &str,
		request: &FetchRequest,
		entry: &Option<AllowlistEntry>,
	) -> Result<FetchResponse, EgressError> {
		let scheme = url.scheme().to_string();
		let tls = scheme == "https";
		let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
		let key = dial::pool_key(&scheme, host, port);

		let mut sender = match self.pool.get(&key) {
			Some(s) => s,
			None => {
				let conn = dial::dial(&self.resolver, &self.tls_connector, host, port, tls, self.config.dial_timeout).await?;
				dial::handshake(conn, self.config.max_response_header_bytes).await?
			},
		};

		let mut http_request = self.build_request(app, url, request, entry, host).await?;
		if sender.ready().await.is_err() {
			// pooled connection died; redial once
			let conn = dial::dial(&self.resolver, &self.tls_connector, host, port, tls, self.config.dial_timeout).await?;
			sender = dial::handshake(conn, self.config.max_response_header_bytes).await?;
			http_request = self.build_request(app, url, request, entry, host).await?;
		}

		let response = sender
			.send_request(http_request)
			.await
			.map_err(|e| EgressError::from_transport_error(&e, false))?;

		let status = response.status().as_u16();
		let mut headers = HashMap::new();
		for (name, value) in response.headers().iter() {
			let name = name.as_str().to_ascii_lowercase();
			if !headers.contains_key(&name) {
				if let Ok(v) = value.to_str() {
					headers.insert(name, v.to_string());
				}
			}
		}

		let cap = entry
			.as_ref()
			.map(|e| e.max_response_override)
			.filter(|v| *v > 0)
			.unwrap_or(self.config.max_response_bytes);

		let body = Limited::new(response.into_body(), cap as usize)
			.collect()
			.await
			.map_err(|_| EgressError::size("response body exceeds configured limit"))?
			.to_bytes();

		self.pool.put(&key, sender);

		Ok(FetchResponse::new(status, headers, body.to_vec()))
	}

	async fn build_request(
		&self,
		app: &str,
		url: &Url,
		request: &FetchRequest,
		entry: &Option<AllowlistEntry>,
		host: &str,
	) -> Result<Request<Full<Bytes>>, EgressError> {
		let mut fetch_request = FetchRequest::new(&request.method, url.as_str());
		fetch_request.set_headers(request.headers.clone());
		fetch_request.body = request.body.clone();

		if !request.auth_name.is_empty() {
			if let Some(secrets) = &self.secrets {
				let secret = secrets.lookup(&request.auth_name, app).await?;
				secrets.inject_auth(&mut fetch_request, &secret, host)?;
			} else {
				return Err(EgressError::auth("no secrets vault configured"));
			}
		}

		let _ = entry;
		let path_and_query = url[url::Position::AfterPort..].to_string();
		let path_and_query = if path_and_query.is_empty() { "/".to_string() } else { path_and_query };
		// origin-form request-target: the connection is already dialed to the
		// right host, so the URI only needs to carry path+query; `Host` below
		// carries the authority.
		let uri: hyper::Uri = path_and_query
			.parse()
			.map_err(|e| EgressError::with_source(ErrorKind::Blocked, "invalid request path", e))?;

		let mut builder = Request::builder()
			.method(fetch_request.method.as_str())
			.uri(uri)
			.header("accept-encoding", "identity")
			.header("host", host);

		for (name, value) in &fetch_request.headers {
			if UNSAFE_REQUEST_HEADERS.contains(&name.as_str()) {
				continue;
			}
			builder = builder.header(name.as_str(), value.as_str());
		}

		builder
			.body(Full::new(Bytes::from(fetch_request.body)))
			.map_err(|e| EgressError::with_source(ErrorKind::Net, "failed to build request", e))
	}
}

fn host_of(url: &str) -> String {
	Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_string())).unwrap_or_default()
}

fn path_of(url: &str) -> String {
	Url::parse(url).ok().map(|u| u.path().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn rejects_ip_literal_before_any_dial() {
		let proxy = EgressProxy::new(ProxyConfig::default()).unwrap();
		let err = proxy
			.fetch("app1", FetchRequest::new("GET", "https://127.0.0.1/x"))
			.await
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::Blocked);
	}

	#[tokio::test]
	async fn unsupported_scheme_is_blocked() {
		let proxy = EgressProxy::new(ProxyConfig::default()).unwrap();
		let err = proxy
			.fetch("app1", FetchRequest::new("GET", "file:///etc/passwd"))
			.await
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::Blocked);
	}

	#[tokio::test]
	async fn no_allowlist_entry_is_blocked() {
		let proxy = EgressProxy::new(ProxyConfig::default()).unwrap();
		let err = proxy
			.fetch("app1", FetchRequest::new("GET", "https://example.com/x"))
			.await
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::Blocked);
	}
}
