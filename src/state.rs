//! Shared application state handed to every axum handler.

use std::sync::Arc;

use crate::admin::Metrics;
use crate::config::GlobalOptions;
use crate::counters::AccessCounters;
use crate::geo::GeoLookup;
use crate::limiter::RateLimiter;
use crate::registry::HostRegistry;

pub struct AppState {
	pub registry: HostRegistry,
	pub limiter: RateLimiter,
	pub counters: AccessCounters,
	pub geo: Arc<dyn GeoLookup>,
	pub client: reqwest::Client,
	pub global: GlobalOptions,
	pub trust_proxy: bool,
	pub real_ip_header: Option<String>,
	pub metrics: Arc<Metrics>,
}

pub type SharedState = Arc<AppState>;
