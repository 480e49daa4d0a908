//! Data model for chain configuration.
//!
//! The core never parses TOML or reads the filesystem for this data —
//! loading and validation are an external collaborator's job. These
//! types are plain `serde`-derived structs, styled after agentgateway's
//! `src/outbound.rs` target modeling, so an external loader can
//! deserialize straight into them and hand the result to `HostRegistry`.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsoluteLinks {
	#[default]
	Auto,
	Always,
	Never,
}

/// Port numbers for the services a chain may expose. Zero means "inherit
/// from the global defaults".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
	#[serde(default)]
	pub rpc: u16,
	#[serde(default)]
	pub rest: u16,
	#[serde(default)]
	pub grpc: u16,
	#[serde(default, rename = "grpc_web")]
	pub grpc_web: u16,
	#[serde(default)]
	pub api: u16,
}

impl PortSet {
	/// Merge `self` (chain-specific, zero = unset) over `defaults`.
	pub fn resolve(&self, use_default: bool, defaults: &PortSet) -> PortSet {
		if use_default {
			return *defaults;
		}
		PortSet {
			rpc: if self.rpc != 0 { self.rpc } else { defaults.rpc },
			rest: if self.rest != 0 {
				self.rest
			} else {
				defaults.rest
			},
			grpc: if self.grpc != 0 {
				self.grpc
			} else {
				defaults.grpc
			},
			grpc_web: if self.grpc_web != 0 {
				self.grpc_web
			} else {
				defaults.grpc_web
			},
			api: if self.api != 0 { self.api } else { defaults.api },
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aliases {
	#[serde(default)]
	pub rpc: HashSet<String>,
	#[serde(default)]
	pub rest: HashSet<String>,
	#[serde(default)]
	pub api: HashSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expose {
	#[serde(default = "default_true")]
	pub path_enabled: bool,
	#[serde(default)]
	pub vhost_enabled: bool,
	#[serde(default = "default_rpc_prefix")]
	pub rpc_prefix: String,
	#[serde(default = "default_rest_prefix")]
	pub rest_prefix: String,
}

fn default_true() -> bool {
	true
}
fn default_rpc_prefix() -> String {
	"rpc".to_string()
}
fn default_rest_prefix() -> String {
	"api".to_string()
}

impl Default for Expose {
	fn default() -> Self {
		Expose {
			path_enabled: true,
			vhost_enabled: false,
			rpc_prefix: default_rpc_prefix(),
			rest_prefix: default_rest_prefix(),
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services {
	#[serde(default)]
	pub rpc: bool,
	#[serde(default)]
	pub rest: bool,
	#[serde(default)]
	pub websocket: bool,
	#[serde(default)]
	pub grpc: bool,
	#[serde(default)]
	pub grpc_web: bool,
	#[serde(default)]
	pub api_alias: bool,
}

/// WebSocket bridge timing. Raw fields as read from config;
/// `effective_idle_timeout`/`effective_max_lifetime` apply the zero-value
/// defaulting rules.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct WsConfig {
	#[serde(default, with = "duration_secs")]
	pub idle_timeout: Duration,
	#[serde(default, with = "duration_secs")]
	pub max_lifetime: Duration,
}

impl WsConfig {
	pub fn effective_idle_timeout(&self) -> Duration {
		if self.idle_timeout.is_zero() {
			Duration::from_secs(3600)
		} else {
			self.idle_timeout
		}
	}

	/// `None` means unlimited.
	pub fn effective_max_lifetime(&self) -> Option<Duration> {
		if self.max_lifetime.is_zero() {
			None
		} else {
			Some(self.max_lifetime)
		}
	}
}

mod duration_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
	#[serde(default)]
	pub inject_rpc_index: bool,
	#[serde(default)]
	pub inject_rest_swagger: bool,
	#[serde(default)]
	pub absolute_links: AbsoluteLinks,
}

/// Immutable per-chain configuration. Constructed once at startup by the
/// external loader and never mutated afterward.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
	pub schema_version: u32,
	pub chain_name: String,
	/// Canonical lowercased FQDN.
	pub host: String,
	pub ip: String,
	#[serde(default)]
	pub aliases: Aliases,
	#[serde(default)]
	pub expose: Expose,
	#[serde(default)]
	pub services: Services,
	#[serde(default)]
	pub ports: PortSet,
	#[serde(default)]
	pub use_default_ports: bool,
	#[serde(default)]
	pub ws: WsConfig,
	#[serde(default)]
	pub features: Features,
	#[serde(default)]
	pub banner_rpc: Option<String>,
	#[serde(default)]
	pub banner_rest: Option<String>,
	#[serde(default)]
	pub log_file: Option<String>,
}

/// Rate limiter defaults and client-IP extraction policy, assembled
/// externally alongside the chain list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterConfig {
	#[serde(default = "default_rps")]
	pub default_rps: f64,
	#[serde(default = "default_burst")]
	pub default_burst: u32,
	#[serde(default)]
	pub enforce_defaults: bool,
	#[serde(default)]
	pub auto_threshold: u32,
	#[serde(default, with = "duration_secs")]
	pub auto_window: Duration,
	#[serde(default)]
	pub auto_penalty_rps: f64,
	#[serde(default)]
	pub auto_penalty_burst: u32,
	#[serde(default, with = "duration_secs")]
	pub auto_ttl: Duration,
	#[serde(default)]
	pub trust_proxy: bool,
	#[serde(default)]
	pub real_ip_header: Option<String>,
}

fn default_rps() -> f64 {
	5.0
}
fn default_burst() -> u32 {
	10
}

impl Default for LimiterConfig {
	fn default() -> Self {
		LimiterConfig {
			default_rps: default_rps(),
			default_burst: default_burst(),
			enforce_defaults: false,
			auto_threshold: 0,
			auto_window: Duration::ZERO,
			auto_penalty_rps: 0.0,
			auto_penalty_burst: 1,
			auto_ttl: Duration::ZERO,
			trust_proxy: false,
			real_ip_header: None,
		}
	}
}

impl LimiterConfig {
	/// `None` unless `auto_threshold` is configured (an `AutoRule` requires
	/// `threshold > 0`).
	pub fn auto_rule(&self) -> Option<crate::limiter::AutoRule> {
		if self.auto_threshold == 0 {
			return None;
		}
		Some(crate::limiter::AutoRule {
			threshold: self.auto_threshold,
			window: self.auto_window,
			penalty: crate::limiter::RateSpec { rps: self.auto_penalty_rps, burst: self.auto_penalty_burst },
			ttl: self.auto_ttl,
		})
	}
}

/// Global configuration not tied to a single chain: default ports, rate
/// limiter defaults, and rotation policy. Consumed the same way as
/// `ChainConfig` — assembled externally, read-only once loaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalOptions {
	pub default_ports: PortSet,
	pub home: String,
	#[serde(default)]
	pub quiet: bool,
	#[serde(default = "default_true")]
	pub foreground: bool,
	#[serde(default)]
	pub limiter: LimiterConfig,
}
