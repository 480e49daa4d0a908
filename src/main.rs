//! CLI entry point: parse args, build the registry, open log/audit files,
//! load access counters, bind the listener, and run the proxy, admin, and
//! rotation loop side by side in a `JoinSet`, in the same
//! `#[tokio::main]`/`clap::Parser`/`JoinSet` shape agentgateway's own
//! binary entry point uses.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use vprox::config::{ChainConfig, GlobalOptions};
use vprox::counters::AccessCounters;
use vprox::geo::{GeoLookup, NoopGeo, SharedGeo};
use vprox::limiter::{AuditSink, Config as LimiterConfig, RateLimiter};
use vprox::registry::HostRegistry;
use vprox::rotation::{RotationOutcome, RotationPaths};
use vprox::admin::Metrics;
use vprox::state::AppState;
use vprox::{admin, logging, proxy, server};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the chain/global configuration document (YAML; parsing and
	/// validation live outside the proxy core).
	#[arg(short, long, value_name = "file")]
	config: PathBuf,

	#[arg(long, default_value = "0.0.0.0:3000")]
	listen_addr: SocketAddr,

	#[arg(long, default_value = "127.0.0.1:9091")]
	admin_addr: SocketAddr,

	/// Data/log root; defaults to $VPROX_HOME or the current directory.
	#[arg(long)]
	home: Option<PathBuf>,

	/// Suppress stdout mirroring of the access/main log in foreground mode.
	#[arg(long)]
	quiet: bool,

	/// Run attached to a terminal: dual-sink logging instead of file-only.
	#[arg(long)]
	foreground: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RuntimeConfig {
	chains: Vec<ChainConfig>,
	global: GlobalOptions,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	if let Err(e) = run(args).await {
		eprintln!("fatal: {e:?}");
		std::process::exit(1);
	}
}

async fn run(args: Args) -> anyhow::Result<()> {
	let home = args
		.home
		.or_else(|| std::env::var("VPROX_HOME").ok().map(PathBuf::from))
		.unwrap_or_else(|| PathBuf::from("."));

	let contents = std::fs::read_to_string(&args.config)?;
	let mut runtime: RuntimeConfig = serde_yaml::from_str(&contents)?;
	runtime.global.quiet = runtime.global.quiet || args.quiet;
	runtime.global.foreground = runtime.global.foreground || args.foreground;

	let main_log_path = home.join("data/logs/main.log");
	let audit_log_path = home.join("data/logs/rate-limit.jsonl");
	let counters_path = home.join("data/access-counts.json");

	logging::init(&main_log_path, runtime.global.foreground && !runtime.global.quiet)?;

	let registry = HostRegistry::build(runtime.chains, runtime.global.default_ports)?;
	let counters = AccessCounters::load(&counters_path)?;
	let audit = AuditSink::open(&audit_log_path)?;
	let geo: Arc<dyn GeoLookup> = Arc::new(NoopGeo);

	let limiter_cfg = runtime.global.limiter.clone();
	let limiter = RateLimiter::new(
		LimiterConfig {
			defaults: vprox::limiter::RateSpec { rps: limiter_cfg.default_rps, burst: limiter_cfg.default_burst },
			enforce_defaults: limiter_cfg.enforce_defaults,
			auto_rule: limiter_cfg.auto_rule(),
		},
		audit,
		Box::new(SharedGeo(geo.clone())),
	);

	let mut prom_registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut prom_registry));
	let prom_registry = Arc::new(prom_registry);

	let state = Arc::new(AppState {
		registry,
		limiter,
		counters,
		geo,
		client: proxy::build_client(),
		global: runtime.global.clone(),
		trust_proxy: limiter_cfg.trust_proxy,
		real_ip_header: limiter_cfg.real_ip_header.clone(),
		metrics,
	});

	let listener = tokio::net::TcpListener::bind(args.listen_addr).await?;
	let router = server::build_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

	let shutdown = CancellationToken::new();
	let mut tasks = JoinSet::new();

	{
		let shutdown = shutdown.clone();
		tasks.spawn(async move {
			axum::serve(listener, router)
				.with_graceful_shutdown(async move { shutdown.cancelled().await })
				.await
				.map_err(anyhow::Error::from)
		});
	}

	{
		let registry_prom = prom_registry.clone();
		let shutdown = shutdown.clone();
		let cfg = admin::Config { host: args.admin_addr.ip().to_string(), port: args.admin_addr.port(), tags: Default::default() };
		tasks.spawn(async move { admin::start(registry_prom, shutdown, cfg).await.map_err(anyhow::Error::from) });
	}

	{
		let log_path = main_log_path.clone();
		let archive_dir = home.join("data/logs/archives");
		let last_run_path = home.join("data/logs/.last-rotation");
		let shutdown = shutdown.clone();
		tasks.spawn(async move {
			run_rotation_loop(log_path, archive_dir, last_run_path, shutdown).await;
			Ok(())
		});
	}

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		result = tasks.join_next() => {
			if let Some(Err(e)) = result {
				tracing::error!("task join failed: {e}");
			}
		}
	}

	shutdown.cancel();
	let _ = tokio::time::timeout(std::time::Duration::from_secs(10), async {
		while tasks.join_next().await.is_some() {}
	})
	.await;

	state.limiter.close();
	Ok(())
}

async fn run_rotation_loop(log_path: PathBuf, archive_dir: PathBuf, last_run_path: PathBuf, shutdown: CancellationToken) {
	let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => return,
			_ = interval.tick() => {
				let paths = RotationPaths { log_path: log_path.clone(), archive_dir: archive_dir.clone() };
				match tokio::task::spawn_blocking(move || vprox::rotation::rotate(&paths)).await {
					Ok(Ok(RotationOutcome::Completed { filesize, archivesize, location, filename })) => {
						tracing::info!(
							target: "rotation",
							event = "BACKUP COMPLETE",
							filesize,
							archivesize,
							location = %location.display(),
							filename,
							compression = "TAR.GZ",
						);
						let _ = vprox::rotation::persist_last_run(&last_run_path, chrono::Utc::now());
					}
					Ok(Ok(RotationOutcome::Failed { reason })) => {
						tracing::warn!(target: "rotation", event = "BACKUP FAILED", reason = %reason);
					}
					Ok(Ok(RotationOutcome::Skipped)) => {}
					Ok(Err(e)) => tracing::warn!(error = %e, "rotation cycle errored"),
					Err(e) => tracing::warn!(error = %e, "rotation task panicked"),
				}
			}
		}
	}
}
