//! Gzip-aware HTML rewriting and banner injection.

use std::io::Read;

use crate::config::AbsoluteLinks;
use crate::registry::RouteKind;

#[derive(thiserror::Error, Debug)]
pub enum RewriteError {
	#[error("gzip decode failed: {0}")]
	Gzip(#[from] std::io::Error),
}

pub fn is_gzip(content_encoding: Option<&str>) -> bool {
	content_encoding.map(|ce| ce.contains("gzip")).unwrap_or(false)
}

pub fn decompress_gzip(body: &[u8]) -> Result<Vec<u8>, RewriteError> {
	let mut decoder = flate2::read::GzDecoder::new(body);
	let mut out = Vec::new();
	decoder.read_to_end(&mut out)?;
	Ok(out)
}

/// Whether `absolute_links` resolves to "always" behavior for this
/// request: auto mode applies it whenever X-Forwarded-Host or Referer
/// contains `.cosmos.directory`.
pub fn absolute_links_active(mode: AbsoluteLinks, forwarded_host: Option<&str>, referer: Option<&str>) -> bool {
	match mode {
		AbsoluteLinks::Always => true,
		AbsoluteLinks::Never => false,
		AbsoluteLinks::Auto => {
			forwarded_host.is_some_and(|h| h.contains(".cosmos.directory"))
				|| referer.is_some_and(|r| r.contains(".cosmos.directory"))
		}
	}
}

pub struct RewriteParams<'a> {
	pub kind: RouteKind,
	pub base_host: &'a str,
	pub backend_ip: &'a str,
	pub absolute_host: Option<&'a str>,
	pub absolute_links: bool,
	pub banner: Option<&'a str>,
}

/// Apply the link-rewrite and banner-injection rules to decompressed HTML.
/// Operates on owned `String` since HTML bodies here are bounded
/// (index/swagger pages), not streamed.
pub fn rewrite_html(html: &str, params: &RewriteParams) -> String {
	let mut out = rewrite_links(html, params);
	if let Some(banner) = params.banner {
		out = inject_banner(&out, banner);
	}
	out
}

fn rewrite_links(html: &str, params: &RewriteParams) -> String {
	let mut out = html.to_string();

	let rpc_target = match params.kind {
		RouteKind::RpcVhost => "/",
		_ => "/rpc/",
	};
	out = replace_host_port(&out, params.backend_ip, 26657, rpc_target);
	out = replace_host_port(&out, params.base_host, 26657, rpc_target);
	if matches!(params.kind, RouteKind::RpcVhost) {
		out = out.replace("\"/rpc/", "\"/").replace("'/rpc/", "'/");
	}

	out = replace_host_port(&out, params.backend_ip, 1317, "/");
	out = replace_host_port(&out, params.base_host, 1317, "/");

	if params.absolute_links {
		if let Some(abs_host) = params.absolute_host {
			out = prefix_rooted_links(&out, abs_host);
		}
	}

	out
}

/// Replace `(https?:)?//host:port/?` occurrences with `replacement`.
fn replace_host_port(html: &str, host: &str, port: u16, replacement: &str) -> String {
	let needle_https = format!("https://{host}:{port}/");
	let needle_http = format!("http://{host}:{port}/");
	let needle_protoless = format!("//{host}:{port}/");
	let needle_https_bare = format!("https://{host}:{port}");
	let needle_http_bare = format!("http://{host}:{port}");
	let needle_protoless_bare = format!("//{host}:{port}");

	html
		.replace(&needle_https, replacement)
		.replace(&needle_http, replacement)
		.replace(&needle_protoless, replacement)
		.replace(&needle_https_bare, replacement)
		.replace(&needle_http_bare, replacement)
		.replace(&needle_protoless_bare, replacement)
}

fn prefix_rooted_links(html: &str, absolute_host: &str) -> String {
	let prefix = format!("https://{absolute_host}");
	let mut out = String::with_capacity(html.len());
	let mut rest = html;
	for attr in ["href=\"/", "src=\"/", "href='/", "src='/"] {
		let mut pieces = Vec::new();
		while let Some(idx) = rest.find(attr) {
			pieces.push(&rest[..idx + attr.len() - 1]);
			pieces.push(prefix.as_str());
			rest = &rest[idx + attr.len() - 1..];
		}
		pieces.push(rest);
		out = pieces.concat();
		rest = &out;
	}
	out
}

fn inject_banner(html: &str, banner: &str) -> String {
	if let Some(idx) = html.find("<body") {
		if let Some(tag_end) = html[idx..].find('>') {
			let insert_at = idx + tag_end + 1;
			let mut out = String::with_capacity(html.len() + banner.len() + 32);
			out.push_str(&html[..insert_at]);
			out.push_str(&format!("\n<div class=\"banner\">\n{banner}\n</div>\n"));
			out.push_str(&html[insert_at..]);
			return out;
		}
	}
	html.to_string()
}

/// Resolve the banner text for a route: inline config wins over the
/// on-disk `<config>/msg/<chain>/(rpc|rest).msg` fallback.
pub fn resolve_banner(inline: Option<&str>, disk_fallback: Option<&str>) -> Option<String> {
	inline
		.map(|s| s.to_string())
		.or_else(|| disk_fallback.map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn gzip_round_trip() {
		let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
		encoder.write_all(b"<html></html>").unwrap();
		let compressed = encoder.finish().unwrap();
		let decompressed = decompress_gzip(&compressed).unwrap();
		assert_eq!(decompressed, b"<html></html>");
	}

	#[test]
	fn is_gzip_detection() {
		assert!(is_gzip(Some("gzip")));
		assert!(is_gzip(Some("gzip, identity")));
		assert!(!is_gzip(Some("br")));
		assert!(!is_gzip(None));
	}

	#[test]
	fn auto_mode_activates_on_cosmos_directory_referer() {
		assert!(absolute_links_active(AbsoluteLinks::Auto, None, Some("https://rpc.cosmos.directory/osmosis")));
		assert!(!absolute_links_active(AbsoluteLinks::Auto, None, Some("https://example.com")));
	}

	#[test]
	fn always_and_never_ignore_headers() {
		assert!(absolute_links_active(AbsoluteLinks::Always, None, None));
		assert!(!absolute_links_active(AbsoluteLinks::Never, Some(".cosmos.directory"), None));
	}

	#[test]
	fn path_mode_rewrites_rpc_backend_links_to_prefix() {
		let html = r#"<a href="http://10.0.0.5:26657/status">x</a>"#;
		let params = RewriteParams {
			kind: RouteKind::PathRpc,
			base_host: "chain.example",
			backend_ip: "10.0.0.5",
			absolute_host: None,
			absolute_links: false,
			banner: None,
		};
		let out = rewrite_html(html, &params);
		assert_eq!(out, r#"<a href="/rpc/status">x</a>"#);
	}

	#[test]
	fn vhost_mode_collapses_residual_rpc_prefix() {
		let html = r#"<a href="/rpc/status">x</a>"#;
		let params = RewriteParams {
			kind: RouteKind::RpcVhost,
			base_host: "chain.example",
			backend_ip: "10.0.0.5",
			absolute_host: None,
			absolute_links: false,
			banner: None,
		};
		let out = rewrite_html(html, &params);
		assert_eq!(out, r#"<a href="/status">x</a>"#);
	}

	#[test]
	fn absolute_links_prefixes_rooted_hrefs() {
		let html = r#"<a href="/status">x</a>"#;
		let params = RewriteParams {
			kind: RouteKind::PathRpc,
			base_host: "chain.example",
			backend_ip: "10.0.0.5",
			absolute_host: Some("proxy.example"),
			absolute_links: true,
			banner: None,
		};
		let out = rewrite_html(html, &params);
		assert_eq!(out, r#"<a href="https://proxy.example/status">x</a>"#);
	}

	#[test]
	fn banner_injected_after_body_tag() {
		let html = "<html><body class=\"x\"><p>hi</p></body></html>";
		let out = inject_banner(html, "welcome");
		assert!(out.contains("<body class=\"x\">\n<div class=\"banner\">\nwelcome\n</div>\n<p>hi</p>"));
	}

	#[test]
	fn resolve_banner_inline_wins() {
		assert_eq!(resolve_banner(Some("inline"), Some("disk")), Some("inline".to_string()));
		assert_eq!(resolve_banner(None, Some("disk")), Some("disk".to_string()));
		assert_eq!(resolve_banner(None, None), None);
	}
}
