//! Transient request/response types passed between the proxy and its
//! callers. Kept independent of `hyper`'s types so the public surface stays
//! stable even if the transport crate changes.

use std::collections::HashMap;
use std::time::Duration;

/// Header and query names stripped from a caller-supplied request before
/// dispatch; the proxy sets its own values for these where needed.
pub const UNSAFE_REQUEST_HEADERS: &[&str] = &[
	"host",
	"connection",
	"proxy-authorization",
	"proxy-connection",
	"transfer-encoding",
	"accept-encoding",
];

/// A caller's request to `EgressProxy::fetch`.
#[derive(Debug, Clone)]
pub struct FetchRequest {
	pub method: String,
	pub url: String,
	/// lowercased header name -> value; last write wins
	pub headers: HashMap<String, String>,
	pub body: Vec<u8>,
	pub timeout: Option<Duration>,
	/// name of a secret to look up and inject, or empty for none
	pub auth_name: String,
}

impl FetchRequest {
	pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
		FetchRequest {
			method: method.into(),
			url: url.into(),
			headers: HashMap::new(),
			body: Vec::new(),
			timeout: None,
			auth_name: String::new(),
		}
	}

	/// Copy caller headers into the request, dropping the unsafe set.
	/// Case-insensitive: names are lowercased on entry.
	pub fn set_headers(&mut self, headers: impl IntoIterator<Item = (String, String)>) {
		for (name, value) in headers {
			let lower = name.to_ascii_lowercase();
			if UNSAFE_REQUEST_HEADERS.contains(&lower.as_str()) {
				continue;
			}
			self.headers.insert(lower, value);
		}
	}
}

/// The result of a successful (or gate-denied, pre-dispatch) fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
	pub status: u16,
	pub ok: bool,
	/// lowercased header name -> first value seen
	pub headers: HashMap<String, String>,
	pub body: Vec<u8>,
}

impl FetchResponse {
	pub fn new(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
		FetchResponse {
			status,
			ok: (200..300).contains(&status),
			headers,
			body,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unsafe_headers_are_dropped() {
		let mut req = FetchRequest::new("GET", "https://example.com");
		req.set_headers([
			("Host".to_string(), "evil.com".to_string()),
			("X-Custom".to_string(), "ok".to_string()),
			("Accept-Encoding".to_string(), "gzip".to_string()),
		]);
		assert!(!req.headers.contains_key("host"));
		assert!(!req.headers.contains_key("accept-encoding"));
		assert_eq!(req.headers.get("x-custom").unwrap(), "ok");
	}

	#[test]
	fn ok_flag_follows_status_range() {
		assert!(FetchResponse::new(204, HashMap::new(), vec![]).ok);
		assert!(!FetchResponse::new(404, HashMap::new(), vec![]).ok);
		assert!(!FetchResponse::new(301, HashMap::new(), vec![]).ok);
	}
}
