//! Admin/metrics listener: serves `/metrics` and `/healthz` on a
//! dedicated address, adapted from `src/mtrcs.rs`'s `App`/`Config`/`start`
//! shape and `Recorder`/`IncrementRecorder` trait pair.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};

pub trait Recorder<E, T> {
	fn record(&self, event: E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
	fn increment(&self, event: E);
}

impl<E, R> IncrementRecorder<E> for R
where
	R: Recorder<E, u64>,
{
	fn increment(&self, event: E) {
		self.record(event, 1);
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
	pub route: String,
	pub status: String,
}

pub enum RequestEvent {
	Served { route: String, status: String },
}

pub struct Metrics {
	requests_total: Family<RouteLabels, Counter>,
	rate_limit_denials_total: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let sub = registry.sub_registry_with_prefix("vprox");
		let requests_total = Family::default();
		sub.register("requests", "Total proxied requests by route and status", requests_total.clone());
		let rate_limit_denials_total = Counter::default();
		sub.register("rate_limit_denials", "Total requests denied by the rate limiter", rate_limit_denials_total.clone());
		Metrics { requests_total, rate_limit_denials_total }
	}

	pub fn record_denial(&self) {
		self.rate_limit_denials_total.inc();
	}
}

impl Recorder<RequestEvent, u64> for Metrics {
	fn record(&self, event: RequestEvent, meta: u64) {
		match event {
			RequestEvent::Served { route, status } => {
				self.requests_total.get_or_create(&RouteLabels { route, status }).inc_by(meta);
			}
		}
	}
}

#[derive(Clone)]
struct App {
	registry: Arc<Registry>,
}

impl App {
	fn router(&self) -> Router {
		Router::new().route("/metrics", get(metrics_handler)).route("/healthz", get(healthz_handler)).with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	match encode(&mut buffer, &app.registry) {
		Ok(_) => Ok(buffer),
		Err(e) => {
			tracing::error!("error encoding metrics: {e:?}");
			Err(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

async fn healthz_handler() -> &'static str {
	"ok"
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default)]
	pub tags: HashMap<String, String>,
}

fn default_host() -> String {
	"127.0.0.1".to_string()
}

fn default_port() -> u16 {
	9091
}

impl Default for Config {
	fn default() -> Self {
		Config { host: default_host(), port: default_port(), tags: HashMap::new() }
	}
}

pub async fn start(registry: Arc<Registry>, ct: tokio_util::sync::CancellationToken, cfg: Config) -> std::io::Result<()> {
	let listener = tokio::net::TcpListener::bind(format!("{}:{}", cfg.host, cfg.port)).await?;
	let app = App { registry };
	axum::serve(listener, app.router())
		.with_graceful_shutdown(async move {
			ct.cancelled().await;
		})
		.await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn metrics_records_requests_by_label() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics.increment(RequestEvent::Served { route: "rpc".to_string(), status: "ok".to_string() });
		metrics.record_denial();
		let mut buffer = String::new();
		encode(&mut buffer, &registry).unwrap();
		assert!(buffer.contains("vprox_requests_total"));
		assert!(buffer.contains("vprox_rate_limit_denials_total"));
	}
}
