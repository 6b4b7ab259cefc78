use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initialize the global `tracing` subscriber for a binary embedding the proxy.
///
/// Honors `RUST_LOG` via `EnvFilter`, defaulting to `info` when unset. When
/// `json` is true, logs are emitted as newline-delimited JSON (the shape
/// operators feed into a log pipeline); otherwise a human-readable format is
/// used, which is nicer for local development.
pub fn init(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_span_events(FmtSpan::CLOSE);
	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}
