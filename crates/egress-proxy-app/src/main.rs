//! Binary embedding `egress_proxy`: loads configuration, connects the
//! durable store, and wires an `EgressProxy` the way a guest-code host
//! would. `serve` just keeps the proxy alive for embedding/manual testing;
//! there is no inbound listener here -- see `spec.md`'s Non-goals.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use egress_proxy::allowlist::Allowlist;
use egress_proxy::audit::AuditLogger;
use egress_proxy::config::ProxyConfig;
use egress_proxy::secrets::SecretsVault;
use egress_proxy::store::SqlxStore;
use egress_proxy::EgressProxy;

#[derive(Parser)]
#[command(name = "egress-proxyd", version, about = "Hardened outbound HTTP egress proxy")]
struct Cli {
	/// Path to a YAML config file; defaults are used for anything absent.
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Database connection string (sqlite:// or postgres://).
	#[arg(long, global = true, default_value = "sqlite://egress-proxy.db?mode=rwc")]
	database_url: String,

	/// Emit logs as newline-delimited JSON instead of human-readable text.
	#[arg(long, global = true)]
	json_logs: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Create the store's tables if they don't already exist (sqlite dev use).
	Migrate,
	/// Start the proxy and idle, ready for embedding, until Ctrl-C.
	Serve,
	/// Allowlist administration.
	Allow {
		#[command(subcommand)]
		action: AllowAction,
	},
	/// Secrets vault administration.
	Secret {
		#[command(subcommand)]
		action: SecretAction,
	},
}

#[derive(Subcommand)]
enum AllowAction {
	Add {
		pattern: String,
		#[arg(long, default_value = "")]
		app: String,
		#[arg(long)]
		https_only: bool,
	},
	Remove {
		pattern: String,
		#[arg(long, default_value = "")]
		app: String,
	},
	List {
		#[arg(long, default_value = "")]
		app: String,
	},
}

#[derive(Subcommand)]
enum SecretAction {
	Set {
		name: String,
		value: String,
		#[arg(long, default_value = "bearer")]
		mode: String,
		#[arg(long, default_value = "")]
		inject_key: String,
		#[arg(long, default_value = "")]
		domain: String,
		#[arg(long, default_value = "")]
		app: String,
	},
	Remove {
		name: String,
		#[arg(long, default_value = "")]
		app: String,
	},
	List {
		#[arg(long, default_value = "")]
		app: String,
	},
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	egress_core::telemetry::init(cli.json_logs);

	let store = Arc::new(SqlxStore::connect(&cli.database_url).await.context("connecting to store")?);

	match cli.command {
		Command::Migrate => {
			store.migrate().await.context("running migrations")?;
			tracing::info!("store schema is up to date");
		},
		Command::Serve => {
			let config = load_config(cli.config.as_deref()).await?;
			let proxy = build_proxy(config, store).await?;
			tracing::info!(max_calls = proxy.max_calls_hint(), "egress proxy ready");
			tokio::signal::ctrl_c().await.ok();
			tracing::info!("shutting down");
		},
		Command::Allow { action } => {
			let config = load_config(cli.config.as_deref()).await?;
			let allowlist = Allowlist::new(store, config.lookup_cache_ttl);
			run_allow_action(&allowlist, action).await?;
		},
		Command::Secret { action } => {
			let config = load_config(cli.config.as_deref()).await?;
			let secrets = SecretsVault::new(store, config.lookup_cache_ttl);
			run_secret_action(&secrets, action).await?;
		},
	}

	Ok(())
}

async fn load_config(path: Option<&std::path::Path>) -> Result<ProxyConfig> {
	match path {
		Some(path) => {
			let text = fs_err::tokio::read_to_string(path)
				.await
				.with_context(|| format!("reading config at {}", path.display()))?;
			ProxyConfig::from_yaml(&text).context("parsing config")
		},
		None => Ok(ProxyConfig::default()),
	}
}

async fn build_proxy(config: ProxyConfig, store: Arc<SqlxStore>) -> Result<EgressProxy> {
	let allowlist = Arc::new(Allowlist::new(store.clone(), config.lookup_cache_ttl));
	let secrets = Arc::new(SecretsVault::new(store.clone(), config.lookup_cache_ttl));
	let cache = Arc::new(egress_proxy::cache::ResponseCache::new(config.cache_capacity, config.cache_max_bytes));
	let audit = Arc::new(AuditLogger::start(store, config.audit_buffer_size, config.audit_flush_interval));

	let proxy = EgressProxy::new(config)?
		.with_allowlist(allowlist)
		.with_secrets(secrets)
		.with_cache(cache)
		.with_audit(audit);
	Ok(proxy)
}

async fn run_allow_action(allowlist: &Allowlist, action: AllowAction) -> Result<()> {
	match action {
		AllowAction::Add { pattern, app, https_only } => {
			allowlist.add(&pattern, &app, https_only).await?;
			println!("added {pattern} (app={app}, https_only={https_only})");
		},
		AllowAction::Remove { pattern, app } => {
			allowlist.remove(&pattern, &app).await?;
			println!("removed {pattern} (app={app})");
		},
		AllowAction::List { app } => {
			for entry in allowlist.list(&app).await? {
				println!("{}\thttps_only={}\trate={}\tburst={}", entry.pattern, entry.https_only, entry.rate_override, entry.burst_override);
			}
		},
	}
	Ok(())
}

async fn run_secret_action(secrets: &SecretsVault, action: SecretAction) -> Result<()> {
	match action {
		SecretAction::Set { name, value, mode, inject_key, domain, app } => {
			secrets.set(&name, &value, &mode, &inject_key, &domain, &app).await?;
			println!("set secret {name} (app={app})");
		},
		SecretAction::Remove { name, app } => {
			secrets.remove(&name, &app).await?;
			println!("removed secret {name} (app={app})");
		},
		SecretAction::List { app } => {
			for (name, masked) in secrets.list(&app).await? {
				println!("{name}\t{masked}");
			}
		},
	}
	Ok(())
}
