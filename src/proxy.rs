//! HTTP proxy: build the upstream request, forward headers with hop-by-hop
//! stripping, stream or rewrite the response.
//!
//! The stripped header list is taken from `HOP_HEADERS` in
//! agentgateway's `crates/agentgateway/src/proxy/httpproxy.rs`; this
//! proxy has no upgrade path of its own here (WebSocket upgrades are
//! handled separately in `ws_bridge.rs`), so it always strips
//! `Upgrade`/`Connection` rather than conditionally restoring them.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use once_cell::sync::Lazy;

use crate::error::ProxyError;
use crate::rewrite::{self, RewriteParams};
use crate::router::{self, BackendTarget};

/// Headers that must never be copied across a proxy hop, mirroring
/// agentgateway's `HOP_HEADERS`.
static HOP_HEADERS: Lazy<[HeaderName; 9]> = Lazy::new(|| {
	[
		HeaderName::from_static("connection"),
		HeaderName::from_static("proxy-connection"),
		HeaderName::from_static("keep-alive"),
		HeaderName::from_static("proxy-authenticate"),
		HeaderName::from_static("proxy-authorization"),
		HeaderName::from_static("te"),
		HeaderName::from_static("trailer"),
		HeaderName::from_static("transfer-encoding"),
		HeaderName::from_static("upgrade"),
	]
});

pub fn build_client() -> reqwest::Client {
	reqwest::Client::builder()
		.timeout(Duration::from_secs(5))
		.pool_max_idle_per_host(100)
		.pool_idle_timeout(Duration::from_secs(90))
		.build()
		.expect("reqwest client builder should never fail with these settings")
}

/// Clone inbound headers for the upstream request, dropping hop-by-hop
/// headers and injecting the forwarding triplet.
pub fn build_upstream_headers(inbound: &HeaderMap, incoming_host: &str, client_ip: &str, request_id: &str) -> HeaderMap {
	let mut headers = inbound.clone();
	for name in HOP_HEADERS.iter() {
		headers.remove(name);
	}
	headers.insert("x-forwarded-host", HeaderValue::from_str(incoming_host).unwrap_or(HeaderValue::from_static("")));
	if !headers.contains_key("x-forwarded-for") {
		headers.insert("x-forwarded-for", HeaderValue::from_str(client_ip).unwrap_or(HeaderValue::from_static("")));
	}
	headers.insert("x-request-id", HeaderValue::from_str(request_id).unwrap_or(HeaderValue::from_static("")));
	headers
}

pub struct ProxyResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

pub struct ProxyRequest<'a> {
	pub target: &'a BackendTarget,
	pub method: reqwest::Method,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// Issue the upstream request and return the raw response, without
/// deciding on rewriting. The caller decides whether to pass the body
/// through `rewrite::rewrite_html` based on `BackendTarget::should_rewrite`
/// and the response `Content-Type`.
pub async fn forward(client: &reqwest::Client, req: ProxyRequest<'_>) -> Result<ProxyResponse, ProxyError> {
	let mut builder = client.request(req.method, &req.target.url);
	builder = builder.headers(req.headers);
	if !req.body.is_empty() {
		builder = builder.body(req.body);
	}

	let resp = builder
		.send()
		.await
		.map_err(|e| ProxyError::UpstreamDial(e.into()))?;

	let status = resp.status();
	let headers = resp.headers().clone();
	let body = resp
		.bytes()
		.await
		.map_err(|e| ProxyError::UpstreamRead(e.into()))?;

	Ok(ProxyResponse { status, headers, body })
}

/// Drop headers that must not survive into the client-facing response:
/// always drop `Content-Length`; additionally drop `Content-Encoding`
/// when the body was modified.
pub fn prepare_response_headers(mut headers: HeaderMap, modified: bool) -> HeaderMap {
	headers.remove("content-length");
	if modified {
		headers.remove("content-encoding");
	}
	headers
}

pub struct HtmlRewriteInput<'a> {
	pub raw_body: &'a [u8],
	pub content_encoding: Option<&'a str>,
	pub params: RewriteParams<'a>,
}

/// Apply the gzip-aware HTML rewrite pipeline to a buffered response
/// body: if modifying, decompress a gzip-encoded body, rewrite the HTML,
/// and write it back out plain.
pub fn apply_html_rewrite(input: HtmlRewriteInput) -> Result<String, ProxyError> {
	let decoded = if rewrite::is_gzip(input.content_encoding) {
		rewrite::decompress_gzip(input.raw_body).map_err(|e| match e {
			rewrite::RewriteError::Gzip(io) => ProxyError::Gzip(io),
		})?
	} else {
		input.raw_body.to_vec()
	};
	let html = String::from_utf8_lossy(&decoded);
	Ok(rewrite::rewrite_html(&html, &input.params))
}

pub use router::route;
