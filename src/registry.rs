//! Host registry: immutable host -> chain mapping, effective port
//! resolution, and routing classification.
//!
//! Modeled as a read-only map built once at startup: treat HostRegistry as
//! an immutable structure built once and expose a read-only `resolve`.
//! Lookups never take a lock — agentgateway's `ConfigStore`
//! (`agent-proxy/src/lib.rs`) wraps its stores in `RwLock` because its
//! data reloads from xDS; vProx has no reload path, so a plain `HashMap`
//! behind an `Arc` is enough.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ChainConfig, PortSet};

static FQDN_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)+$").unwrap()
});

pub fn is_valid_fqdn(host: &str) -> bool {
	FQDN_RE.is_match(host)
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
	#[error("host {0:?} is not a valid FQDN")]
	InvalidHost(String),
	#[error("host {0:?} is registered by both {1:?} and {2:?}")]
	Conflict(String, String, String),
}

/// The service a request was routed to, and how it got there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
	RpcVhost,
	RestVhost,
	PathRpc,
	PathRest,
	PathGrpc,
	PathGrpcWeb,
	PathApi,
}

impl RouteKind {
	pub fn as_str(self) -> &'static str {
		match self {
			RouteKind::RpcVhost | RouteKind::PathRpc => "rpc",
			RouteKind::RestVhost | RouteKind::PathRest => "rest",
			RouteKind::PathGrpc => "grpc",
			RouteKind::PathGrpcWeb => "grpc-web",
			RouteKind::PathApi => "api",
		}
	}

	fn is_vhost(self) -> bool {
		matches!(self, RouteKind::RpcVhost | RouteKind::RestVhost)
	}
}

/// Immutable mapping of FQDN -> chain, built once at startup.
#[derive(Debug)]
pub struct HostRegistry {
	by_host: HashMap<String, Arc<ChainConfig>>,
	chains: Vec<Arc<ChainConfig>>,
	default_ports: PortSet,
}

impl HostRegistry {
	/// Build the registry from a validated chain list. Fails if any host
	/// key is not an FQDN, or if two chains claim the same host.
	pub fn build(chains: Vec<ChainConfig>, default_ports: PortSet) -> Result<Self, RegistryError> {
		let mut by_host: HashMap<String, Arc<ChainConfig>> = HashMap::new();
		let mut arcs = Vec::with_capacity(chains.len());

		for chain in chains {
			let chain = Arc::new(chain);
			let mut keys = vec![chain.host.to_lowercase()];
			if chain.expose.vhost_enabled {
				keys.push(format!("{}.{}", chain.expose.rpc_prefix, chain.host));
				keys.push(format!("{}.{}", chain.expose.rest_prefix, chain.host));
			}
			keys.extend(chain.aliases.rpc.iter().map(|a| a.to_lowercase()));
			keys.extend(chain.aliases.rest.iter().map(|a| a.to_lowercase()));
			keys.extend(chain.aliases.api.iter().map(|a| a.to_lowercase()));

			for key in keys {
				if !is_valid_fqdn(&key) {
					return Err(RegistryError::InvalidHost(key));
				}
				if let Some(existing) = by_host.get(&key) {
					if !Arc::ptr_eq(existing, &chain) {
						return Err(RegistryError::Conflict(
							key,
							existing.chain_name.clone(),
							chain.chain_name.clone(),
						));
					}
				}
				by_host.insert(key, chain.clone());
			}
			arcs.push(chain);
		}

		Ok(HostRegistry {
			by_host,
			chains: arcs,
			default_ports,
		})
	}

	/// Lowercase and strip an optional `:port` suffix (with IPv6 bracket
	/// support) before lookup.
	pub fn resolve(&self, host: &str) -> Option<Arc<ChainConfig>> {
		let host = strip_port(host).to_lowercase();
		self.by_host.get(&host).cloned()
	}

	pub fn effective_ports(&self, chain: &ChainConfig) -> PortSet {
		chain.ports.resolve(chain.use_default_ports, &self.default_ports)
	}

	pub fn default_ports(&self) -> PortSet {
		self.default_ports
	}

	pub fn chains(&self) -> &[Arc<ChainConfig>] {
		&self.chains
	}

	/// Classify a (host, path) pair into a `RouteKind`, trying vhosts
	/// before path prefixes. Returns `None` when the chain has no
	/// applicable service for this host/path combination (-> 404 at the
	/// call site).
	pub fn classify(&self, chain: &ChainConfig, host: &str, path: &str) -> Option<RouteKind> {
		let host = strip_port(host).to_lowercase();
		let base = chain.host.to_lowercase();

		if chain.expose.vhost_enabled {
			let rpc_vhost = format!("{}.{}", chain.expose.rpc_prefix, base);
			if chain.services.rpc && (host == rpc_vhost || chain.aliases.rpc.iter().any(|a| a.to_lowercase() == host)) {
				return Some(RouteKind::RpcVhost);
			}
			let rest_vhost = format!("{}.{}", chain.expose.rest_prefix, base);
			let is_rest_alias = chain.aliases.rest.iter().any(|a| a.to_lowercase() == host)
				|| chain.aliases.api.iter().any(|a| a.to_lowercase() == host);
			if chain.services.rest && (host == rest_vhost || is_rest_alias) {
				return Some(RouteKind::RestVhost);
			}
		}

		if chain.expose.path_enabled {
			if let Some(kind) = classify_path(path, chain) {
				return Some(kind);
			}
		}

		None
	}
}

fn classify_path(path: &str, chain: &ChainConfig) -> Option<RouteKind> {
	if chain.services.rpc && (path == "/rpc" || path.starts_with("/rpc/")) {
		return Some(RouteKind::PathRpc);
	}
	if chain.services.rest && (path == "/rest" || path.starts_with("/rest/")) {
		return Some(RouteKind::PathRest);
	}
	if chain.services.grpc_web && (path == "/grpc-web" || path.starts_with("/grpc-web/")) {
		return Some(RouteKind::PathGrpcWeb);
	}
	if chain.services.grpc && (path == "/grpc" || path.starts_with("/grpc/")) {
		return Some(RouteKind::PathGrpc);
	}
	if chain.services.api_alias && (path == "/api" || path.starts_with("/api/")) {
		return Some(RouteKind::PathApi);
	}
	// root path falls back to REST when REST is enabled.
	if path == "/" && chain.services.rest {
		return Some(RouteKind::PathRest);
	}
	None
}

fn strip_port(host: &str) -> &str {
	if let Some(rest) = host.strip_prefix('[') {
		// IPv6 literal, possibly with a port: [::1]:8080
		if let Some(end) = rest.find(']') {
			return &host[..end + 2];
		}
		return host;
	}
	match host.rfind(':') {
		Some(idx) if host[..idx].chars().all(|c| c != ':') => &host[..idx],
		_ => host,
	}
}

/// True when a `RouteKind` is served over a vhost (no path prefix to strip
/// from the backend path).
pub fn is_vhost(kind: RouteKind) -> bool {
	kind.is_vhost()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Aliases, Expose, Features, Services, WsConfig};

	fn chain(name: &str, host: &str, vhost: bool) -> ChainConfig {
		ChainConfig {
			schema_version: 1,
			chain_name: name.to_string(),
			host: host.to_string(),
			ip: "10.0.0.5".to_string(),
			aliases: Aliases::default(),
			expose: Expose {
				path_enabled: true,
				vhost_enabled: vhost,
				..Expose::default()
			},
			services: Services {
				rpc: true,
				rest: true,
				websocket: true,
				grpc: true,
				grpc_web: true,
				api_alias: true,
			},
			ports: PortSet::default(),
			use_default_ports: true,
			ws: WsConfig::default(),
			features: Features::default(),
			banner_rpc: None,
			banner_rest: None,
			log_file: None,
		}
	}

	#[test]
	fn resolve_strips_port_and_lowercases() {
		let reg = HostRegistry::build(vec![chain("osmosis", "Chain.Example", false)], PortSet::default()).unwrap();
		let found = reg.resolve("CHAIN.example:8080").expect("should resolve");
		assert_eq!(found.chain_name, "osmosis");
	}

	#[test]
	fn resolve_strips_ipv6_bracket_port() {
		let mut c = chain("osmosis", "chain.example", false);
		c.host = "chain.example".to_string();
		let reg = HostRegistry::build(vec![c], PortSet::default()).unwrap();
		// not an IPv6 host, but exercise the bracket-stripping branch on a literal
		assert_eq!(strip_port("[::1]:8080"), "[::1]");
		assert!(reg.resolve("chain.example").is_some());
	}

	#[test]
	fn conflicting_hosts_fail_to_build() {
		let a = chain("a", "shared.example", false);
		let b = chain("b", "shared.example", false);
		let err = HostRegistry::build(vec![a, b], PortSet::default()).unwrap_err();
		assert!(matches!(err, RegistryError::Conflict(..)));
	}

	#[test]
	fn invalid_host_rejected() {
		let c = chain("a", "Not A Host", false);
		let err = HostRegistry::build(vec![c], PortSet::default()).unwrap_err();
		assert!(matches!(err, RegistryError::InvalidHost(_)));
	}

	#[test]
	fn vhost_registers_rpc_and_rest_prefixes() {
		let c = chain("osmosis", "chain.example", true);
		let reg = HostRegistry::build(vec![c], PortSet::default()).unwrap();
		assert!(reg.resolve("rpc.chain.example").is_some());
		assert!(reg.resolve("api.chain.example").is_some());
	}

	#[test]
	fn classify_path_prefixes() {
		let c = chain("osmosis", "chain.example", false);
		assert_eq!(classify_path("/rpc/status", &c), Some(RouteKind::PathRpc));
		assert_eq!(classify_path("/rest/cosmos/bank", &c), Some(RouteKind::PathRest));
		assert_eq!(classify_path("/grpc-web/x", &c), Some(RouteKind::PathGrpcWeb));
		assert_eq!(classify_path("/grpc/x", &c), Some(RouteKind::PathGrpc));
		assert_eq!(classify_path("/api/x", &c), Some(RouteKind::PathApi));
		assert_eq!(classify_path("/", &c), Some(RouteKind::PathRest));
	}

	#[test]
	fn classify_path_returns_none_for_disabled_service() {
		let mut c = chain("osmosis", "chain.example", false);
		c.services.grpc = false;
		assert_eq!(classify_path("/grpc/x", &c), None);
	}

	#[test]
	fn classify_vhost_precedes_path() {
		let c = chain("osmosis", "chain.example", true);
		assert_eq!(
			c_kind(&c, "rpc.chain.example", "/status"),
			Some(RouteKind::RpcVhost)
		);
	}

	fn c_kind(c: &ChainConfig, host: &str, path: &str) -> Option<RouteKind> {
		let reg = HostRegistry::build(vec![c.clone()], PortSet::default()).unwrap();
		let chain = reg.resolve(host).unwrap();
		reg.classify(&chain, host, path)
	}

	#[test]
	fn effective_ports_inherits_zero_fields() {
		let mut c = chain("osmosis", "chain.example", false);
		c.use_default_ports = false;
		c.ports = PortSet { rpc: 26657, ..PortSet::default() };
		let defaults = PortSet { rpc: 1, rest: 1317, grpc: 9090, grpc_web: 9091, api: 1317 };
		let reg = HostRegistry::build(vec![c], defaults).unwrap();
		let chain = reg.resolve("chain.example").unwrap();
		let effective = reg.effective_ports(&chain);
		assert_eq!(effective.rpc, 26657);
		assert_eq!(effective.rest, 1317);
	}
}
