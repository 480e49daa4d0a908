use std::net::SocketAddr;
use std::sync::Arc;

use prometheus_client::registry::Registry;
use vprox::admin::Metrics;
use vprox::config::{ChainConfig, PortSet};
use vprox::counters::AccessCounters;
use vprox::geo::{GeoLookup, NoopGeo, SharedGeo};
use vprox::limiter::{AuditSink, Config as LimiterConfig, RateLimiter, RateSpec};
use vprox::registry::HostRegistry;
use vprox::state::AppState;

pub fn chain(name: &str, host: &str, ip: &str, port: u16, vhost: bool) -> ChainConfig {
	use vprox::config::{Aliases, Expose, Features, Services, WsConfig};
	ChainConfig {
		schema_version: 1,
		chain_name: name.to_string(),
		host: host.to_string(),
		ip: ip.to_string(),
		aliases: Aliases::default(),
		expose: Expose { path_enabled: true, vhost_enabled: vhost, ..Expose::default() },
		services: Services { rpc: true, rest: true, websocket: true, ..Services::default() },
		ports: PortSet { rpc: port, rest: port, grpc: port, grpc_web: port, api: port },
		use_default_ports: false,
		ws: WsConfig::default(),
		features: Features::default(),
		banner_rpc: None,
		banner_rest: None,
		log_file: None,
	}
}

fn temp_path(label: &str) -> std::path::PathBuf {
	std::env::temp_dir().join(format!(
		"vprox-it-{label}-{}-{}",
		std::process::id(),
		std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
	))
}

/// Build a full `AppState` (the same pieces `main.rs` assembles at
/// startup) around a chain list, with disposable temp-file-backed
/// sinks, and hand it back along with a limiter config override hook.
pub fn build_state(chains: Vec<ChainConfig>, limiter_cfg: LimiterConfig, trust_proxy: bool) -> Arc<AppState> {
	let registry = HostRegistry::build(chains, PortSet::default()).unwrap();
	let counters = AccessCounters::load(temp_path("counters")).unwrap();
	let audit = AuditSink::open(&temp_path("audit.jsonl")).unwrap();
	let geo: Arc<dyn GeoLookup> = Arc::new(NoopGeo);
	let limiter = RateLimiter::new(limiter_cfg, audit, Box::new(SharedGeo(geo.clone())));
	let mut prom = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut prom));

	Arc::new(AppState {
		registry,
		limiter,
		counters,
		geo,
		client: vprox::proxy::build_client(),
		global: vprox::config::GlobalOptions {
			default_ports: PortSet::default(),
			home: ".".to_string(),
			quiet: true,
			foreground: false,
			limiter: vprox::config::LimiterConfig::default(),
		},
		trust_proxy,
		real_ip_header: None,
		metrics,
	})
}

pub fn permissive_limiter() -> LimiterConfig {
	LimiterConfig { defaults: RateSpec { rps: 1000.0, burst: 1000 }, enforce_defaults: true, auto_rule: None }
}

/// Bind the proxy router on an ephemeral port and serve it in the
/// background for the lifetime of the test process.
pub async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let router = vprox::server::build_router(state).into_make_service_with_connect_info::<SocketAddr>();
	tokio::spawn(async move {
		axum::serve(listener, router).await.ok();
	});
	addr
}
