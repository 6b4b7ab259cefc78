//! The closed error taxonomy every other component reports failures through.
//!
//! Every failure reaching a guest caller is converted to an [`EgressError`] at
//! its origin and preserved verbatim through the transport layers -- see
//! `dial.rs` and `proxy.rs` for the "unwrap one layer of transport wrapper"
//! dance this enables.

use std::fmt;

/// A closed set of error kinds, each carrying a stable machine code and a
/// retryable flag. Kinds must never be added to casually: callers match on
/// them to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
	/// allowlist/IP/scheme/redirect denial
	Blocked,
	/// deadline elapsed during dial, TLS, read, or overall budget
	Timeout,
	/// global or per-app concurrency cap reached
	Limit,
	/// insufficient remaining time from the caller's budget
	Budget,
	/// request or response exceeds configured bytes
	Size,
	/// transport failure not otherwise classified
	Net,
	/// secret not found, wrong app scope, or domain mismatch
	Auth,
	/// token bucket depleted
	Rate,
}

impl ErrorKind {
	/// Whether a caller may usefully retry this class of failure after backoff.
	pub fn retryable(self) -> bool {
		matches!(self, ErrorKind::Limit | ErrorKind::Budget | ErrorKind::Rate)
	}

	pub fn code(self) -> &'static str {
		match self {
			ErrorKind::Blocked => "BLOCKED",
			ErrorKind::Timeout => "TIMEOUT",
			ErrorKind::Limit => "LIMIT",
			ErrorKind::Budget => "BUDGET",
			ErrorKind::Size => "SIZE",
			ErrorKind::Net => "NET",
			ErrorKind::Auth => "AUTH",
			ErrorKind::Rate => "RATE",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.code())
	}
}

/// The error type surfaced to every `Fetch` caller. Carries the machine-
/// readable [`ErrorKind`], a human message (never a secret value), and an
/// optional lower-level cause for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EgressError {
	pub kind: ErrorKind,
	pub message: String,
	#[source]
	pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl EgressError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		EgressError {
			kind,
			message: message.into(),
			source: None,
		}
	}

	pub fn with_source(
		kind: ErrorKind,
		message: impl Into<String>,
		source: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		EgressError {
			kind,
			message: message.into(),
			source: Some(Box::new(source)),
		}
	}

	pub fn blocked(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Blocked, message)
	}

	pub fn timeout(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Timeout, message)
	}

	pub fn limit(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Limit, message)
	}

	pub fn budget(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Budget, message)
	}

	pub fn size(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Size, message)
	}

	pub fn net(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Net, message)
	}

	pub fn auth(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Auth, message)
	}

	pub fn rate(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Rate, message)
	}

	pub fn retryable(&self) -> bool {
		self.kind.retryable()
	}

	/// Walk a boxed `std::error::Error` source chain looking for an
	/// `EgressError` wrapped by a transport layer (hyper/hyper-util wrap
	/// connector errors in their own error types). Returns the original
	/// kind/message when found, else classifies as `NET` (or `TIMEOUT` when
	/// `timed_out` is true).
	pub fn from_transport_error(
		err: &(dyn std::error::Error + 'static),
		timed_out: bool,
	) -> EgressError {
		let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
		while let Some(e) = cause {
			if let Some(egress) = e.downcast_ref::<EgressError>() {
				return EgressError::new(egress.kind, egress.message.clone());
			}
			cause = e.source();
		}
		if timed_out {
			EgressError::timeout(err.to_string())
		} else {
			EgressError::net(err.to_string())
		}
	}
}
