//! Backend URL construction and body-modification decision.
//!
//! Sits between `HostRegistry::classify` and `proxy.rs`: given a chain, a
//! route kind, and the inbound request, produce the upstream URL plus
//! whether the response body needs rewriting before it's forwarded.

use crate::config::ChainConfig;
use crate::registry::{HostRegistry, RouteKind, is_vhost};

pub struct BackendTarget {
	pub url: String,
	pub should_rewrite: bool,
}

/// Build the backend URL for `kind` and decide whether the response body
/// is a rewrite candidate. `query` includes the leading `?` if present.
pub fn route(registry: &HostRegistry, chain: &ChainConfig, kind: RouteKind, path: &str, query: Option<&str>) -> BackendTarget {
	let ports = registry.effective_ports(chain);
	let backend_path = if is_vhost(kind) {
		path.to_string()
	} else {
		strip_prefix(kind, path)
	};

	let port = match kind {
		RouteKind::RpcVhost | RouteKind::PathRpc => ports.rpc,
		RouteKind::RestVhost | RouteKind::PathRest => ports.rest,
		RouteKind::PathGrpc => ports.grpc,
		RouteKind::PathGrpcWeb => ports.grpc_web,
		RouteKind::PathApi => ports.api,
	};

	let mut url = format!("http://{}:{}{}", chain.ip, port, backend_path);
	if let Some(q) = query {
		url.push_str(q);
	}

	let should_rewrite = is_rpc_index(kind, path) && chain.features.inject_rpc_index
		|| is_rest_swagger(kind, path) && chain.features.inject_rest_swagger;

	BackendTarget { url, should_rewrite }
}

fn strip_prefix(kind: RouteKind, path: &str) -> String {
	let prefix = match kind {
		RouteKind::PathRpc => "/rpc",
		RouteKind::PathRest => "/rest",
		RouteKind::PathGrpcWeb => "/grpc-web",
		RouteKind::PathGrpc => "/grpc",
		RouteKind::PathApi => "/api",
		// root-path REST fallback has no prefix to strip.
		RouteKind::RpcVhost | RouteKind::RestVhost => return path.to_string(),
	};
	let rest = path.strip_prefix(prefix).unwrap_or(path);
	if rest.is_empty() { "/".to_string() } else { rest.to_string() }
}

fn is_rpc_index(kind: RouteKind, path: &str) -> bool {
	matches!(kind, RouteKind::RpcVhost) && (path == "/" || path == "/rpc" || path == "/rpc/")
		|| matches!(kind, RouteKind::PathRpc) && (path == "/rpc" || path == "/rpc/")
}

fn is_rest_swagger(kind: RouteKind, path: &str) -> bool {
	matches!(kind, RouteKind::RestVhost) && path == "/swagger/"
		|| matches!(kind, RouteKind::PathRest) && path == "/rest/swagger/"
}

/// Whether the upstream `Content-Type` makes a body an HTML rewrite
/// candidate (starts with `text/html`).
pub fn is_html_content_type(content_type: Option<&str>) -> bool {
	content_type.map(|ct| ct.starts_with("text/html")).unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Aliases, Expose, Features, PortSet, Services, WsConfig};

	fn chain(inject_rpc: bool, inject_rest: bool) -> ChainConfig {
		ChainConfig {
			schema_version: 1,
			chain_name: "osmosis".to_string(),
			host: "chain.example".to_string(),
			ip: "10.0.0.5".to_string(),
			aliases: Aliases::default(),
			expose: Expose::default(),
			services: Services { rpc: true, rest: true, ..Services::default() },
			ports: PortSet::default(),
			use_default_ports: true,
			ws: WsConfig::default(),
			features: Features { inject_rpc_index: inject_rpc, inject_rest_swagger: inject_rest, ..Features::default() },
			banner_rpc: None,
			banner_rest: None,
			log_file: None,
		}
	}

	fn registry(c: ChainConfig) -> HostRegistry {
		let defaults = PortSet { rpc: 26657, rest: 1317, grpc: 9090, grpc_web: 9091, api: 1317 };
		HostRegistry::build(vec![c], defaults).unwrap()
	}

	#[test]
	fn rpc_path_strips_prefix_and_preserves_query() {
		let c = chain(false, false);
		let reg = registry(c.clone());
		let target = route(&reg, &c, RouteKind::PathRpc, "/rpc/status", Some("?height=1"));
		assert_eq!(target.url, "http://10.0.0.5:26657/status?height=1");
	}

	#[test]
	fn vhost_path_is_preserved_verbatim() {
		let c = chain(false, false);
		let reg = registry(c.clone());
		let target = route(&reg, &c, RouteKind::RpcVhost, "/status", None);
		assert_eq!(target.url, "http://10.0.0.5:26657/status");
	}

	#[test]
	fn rpc_index_triggers_rewrite_when_enabled() {
		let c = chain(true, false);
		let reg = registry(c.clone());
		let target = route(&reg, &c, RouteKind::PathRpc, "/rpc/", None);
		assert!(target.should_rewrite);
	}

	#[test]
	fn rpc_index_does_not_trigger_when_disabled() {
		let c = chain(false, false);
		let reg = registry(c.clone());
		let target = route(&reg, &c, RouteKind::PathRpc, "/rpc/", None);
		assert!(!target.should_rewrite);
	}

	#[test]
	fn rest_swagger_triggers_rewrite() {
		let c = chain(false, true);
		let reg = registry(c.clone());
		let target = route(&reg, &c, RouteKind::PathRest, "/rest/swagger/", None);
		assert!(target.should_rewrite);
	}

	#[test]
	fn root_path_strip_yields_slash() {
		assert_eq!(strip_prefix(RouteKind::PathApi, "/api"), "/");
	}

	#[test]
	fn html_content_type_detection() {
		assert!(is_html_content_type(Some("text/html; charset=utf-8")));
		assert!(!is_html_content_type(Some("application/json")));
		assert!(!is_html_content_type(None));
	}
}
