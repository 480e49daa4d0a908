//! axum router wiring: the catch-all HTTP proxy route, the `/websocket`
//! bridge route, and the limiter decision shared by both. Control flow is
//! listener -> routing decision (host/chain/service) -> limiter -> either
//! the WebSocket bridge or the HTTP proxy -> response.

use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};

use crate::admin::IncrementRecorder;
use crate::error::ProxyError;
use crate::limiter::{self, Decision, RateLimitStatus, RequestContext};
use crate::logging::AccessRecord;
use crate::registry::RouteKind;
use crate::router as rt;
use crate::rewrite::RewriteParams;
use crate::state::SharedState;
use crate::{proxy, ws_bridge};

pub fn build_router(state: SharedState) -> Router {
	Router::new().route("/websocket", get(ws_handler)).fallback(any(http_handler)).with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

fn request_context<'a>(
	headers: &'a HeaderMap,
	remote: SocketAddr,
	state: &'a SharedState,
	method: &str,
	path: &str,
	host: &str,
	request_id: &str,
) -> RequestContext<'a> {
	RequestContext {
		remote_addr: remote.ip(),
		headers,
		trust_proxy: state.trust_proxy,
		real_ip_header: state.real_ip_header.as_deref(),
		method: method.to_string(),
		path: path.to_string(),
		host: host.to_string(),
		user_agent: header_str(headers, "user-agent").unwrap_or_default().to_string(),
		request_id: request_id.to_string(),
	}
}

struct Finisher<'a> {
	state: &'a SharedState,
	headers: HeaderMap,
	host: String,
	method: String,
	path: String,
	request_id: String,
	client_ip: String,
	start: Instant,
}

impl<'a> Finisher<'a> {
	/// Emit exactly one access log line and bump the per-IP counter, then
	/// hand back the response untouched.
	fn finish(self, mut response: Response, route: &str, proxied: bool, level: &'static str) -> Response {
		let rate_status = rate_status_of(&response);
		apply_common_headers(&mut response, &self.request_id, rate_status);
		self.state.metrics.increment(crate::admin::RequestEvent::Served {
			route: route.to_string(),
			status: response.status().as_u16().to_string(),
		});

		let _ = self.state.counters.increment(&self.client_ip);
		let src_count = self.state.counters.get(&self.client_ip);
		let status_label = response.headers().get("x-ratelimit-status").and_then(|v| v.to_str().ok()).unwrap_or("ok").to_string();
		let geo_ip: std::net::IpAddr =
			self.client_ip.parse().unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

		let record = AccessRecord {
			ts: String::new(),
			level,
			event: "request",
			request_id: self.request_id.clone(),
			host: self.host.clone(),
			route: route.to_string(),
			proxied,
			request: format!("{} {}", self.method, self.path),
			method: self.method.clone(),
			ip: self.client_ip.clone(),
			src_count,
			latency_ms: self.start.elapsed().as_millis() as u64,
			ua: header_str(&self.headers, "user-agent").unwrap_or_default().to_string(),
			country: crate::geo::display_country(&self.state.geo.country(geo_ip)).to_string(),
			status: status_label,
			up_bytes: None,
			down_bytes: None,
			avg_rate: None,
		};
		tracing::info!(
			target: "access",
			level = record.level,
			event = record.event,
			request_id = %record.request_id,
			host = %record.host,
			route = %record.route,
			proxied = record.proxied,
			request = %record.request,
			method = %record.method,
			ip = %record.ip,
			src_count = record.src_count,
			latency_ms = record.latency_ms,
			ua = %record.ua,
			country = %record.country,
			status = %record.status,
		);
		response
	}
}

fn rate_status_of(response: &Response) -> RateLimitStatus {
	match response.headers().get("x-ratelimit-status").and_then(|v| v.to_str().ok()) {
		Some("limited") => RateLimitStatus::Limited,
		Some("blocked") => RateLimitStatus::Blocked,
		_ => RateLimitStatus::Ok,
	}
}

/// HTTP proxy path: everything except `/websocket`.
async fn http_handler(State(state): State<SharedState>, ConnectInfo(remote): ConnectInfo<SocketAddr>, req: Request) -> Response {
	let start = Instant::now();
	let (parts, body) = req.into_parts();
	let method = parts.method.to_string();
	let uri = parts.uri.clone();
	let headers = parts.headers.clone();
	let request_id = limiter::default_request_id(&headers);
	let path = uri.path().to_string();
	let host_header = header_str(&headers, "host").map(|h| h.to_string());

	// Built before the host is even confirmed known, so every exit path
	// (including the 400 below) logs the same resolved client IP.
	let ctx = request_context(&headers, remote, &state, &method, &path, host_header.as_deref().unwrap_or(""), &request_id);
	let client_ip = limiter::RateLimiter::client_ip(&ctx).to_string();

	let make_finisher = |headers: HeaderMap, host: String| Finisher {
		state: &state,
		headers,
		host,
		method: method.clone(),
		path: path.clone(),
		request_id: request_id.clone(),
		client_ip: client_ip.clone(),
		start,
	};

	let Some(host) = host_header else {
		let resp = ProxyError::UnknownHost(String::new()).into_response();
		return make_finisher(headers, String::new()).finish(resp, "none", false, "WRN");
	};

	let Some(chain) = state.registry.resolve(&host) else {
		let resp = ProxyError::UnknownHost(host.clone()).into_response();
		return make_finisher(headers, host).finish(resp, "none", false, "WRN");
	};

	let Some(kind) = state.registry.classify(&chain, &host, &path) else {
		let resp = ProxyError::NoApplicableService { host: host.clone(), path: path.clone() }.into_response();
		return make_finisher(headers, host).finish(resp, "none", false, "WRN");
	};

	// Buffer the body and run the rate-limit decision concurrently. A
	// body-read failure is treated as the client disconnecting and cancels
	// a blocking-wait decision early; the sender is only dropped after the
	// join so a successful read can never be mistaken for a disconnect.
	let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
	let body_fut = async move {
		match axum::body::to_bytes(body, 64 * 1024 * 1024).await {
			Ok(b) => (Some(b), Some(cancel_tx)),
			Err(_) => {
				let _ = cancel_tx.send(());
				(None, None)
			}
		}
	};
	let cancelled = async move {
		let _ = cancel_rx.await;
	};
	let ((body_result, _cancel_guard), decision) = tokio::join!(body_fut, state.limiter.decide(&ctx, cancelled));

	let body_bytes = match body_result {
		Some(b) => b,
		None => {
			let resp = ProxyError::BodyBuild(anyhow::anyhow!("failed to buffer request body")).into_response();
			return make_finisher(headers, host).finish(resp, kind.as_str(), false, "ERR");
		}
	};

	if let Decision::Deny { retry_after_secs, policy } = decision {
		state.metrics.record_denial();
		let mut resp = StatusCode::TOO_MANY_REQUESTS.into_response();
		resp.headers_mut().insert("retry-after", retry_after_secs.to_string().parse().unwrap());
		resp.headers_mut().insert("x-ratelimit-status", "blocked".parse().unwrap());
		if let Some(policy) = policy {
			resp.headers_mut().insert("x-ratelimit-policy", policy.parse().unwrap());
		}
		return make_finisher(headers, host).finish(resp, kind.as_str(), false, "WRN");
	}
	let Decision::Allow { status: rate_status } = decision else { unreachable!() };

	let target = rt::route(&state.registry, &chain, kind, &path, uri.query().map(|q| format!("?{q}")).as_deref());
	let upstream_headers = proxy::build_upstream_headers(&headers, &host, &client_ip, &request_id);

	let method_for_upstream: reqwest::Method = parts.method.as_str().parse().unwrap_or(reqwest::Method::GET);
	let proxy_req = proxy::ProxyRequest { target: &target, method: method_for_upstream, headers: upstream_headers, body: body_bytes };
	let result = proxy::forward(&state.client, proxy_req).await;

	let (mut response, proxied) = match result {
		Ok(resp) => {
			let status = resp.status;
			(build_forwarded_response(&chain, kind, &host, &headers, &target, resp), status.is_success() || status.is_redirection())
		}
		Err(e) => (e.into_response(), false),
	};
	response.headers_mut().insert("x-ratelimit-status", rate_status.as_str().parse().unwrap());

	make_finisher(headers, host).finish(response, kind.as_str(), proxied, "INF")
}

fn build_forwarded_response(
	chain: &crate::config::ChainConfig,
	kind: RouteKind,
	incoming_host: &str,
	inbound_headers: &HeaderMap,
	target: &rt::BackendTarget,
	upstream: proxy::ProxyResponse,
) -> Response {
	let content_type = upstream.headers.get("content-type").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
	let content_encoding = upstream.headers.get("content-encoding").and_then(|v| v.to_str().ok()).map(|s| s.to_string());

	if target.should_rewrite && rt::is_html_content_type(content_type.as_deref()) {
		let forwarded_host = inbound_headers.get("x-forwarded-host").and_then(|v| v.to_str().ok());
		let referer = inbound_headers.get("referer").and_then(|v| v.to_str().ok());
		let absolute_links = crate::rewrite::absolute_links_active(chain.features.absolute_links, forwarded_host, referer);
		let banner = match kind {
			RouteKind::RpcVhost | RouteKind::PathRpc => chain.banner_rpc.as_deref(),
			_ => chain.banner_rest.as_deref(),
		};
		let params = RewriteParams {
			kind,
			base_host: &chain.host,
			backend_ip: &chain.ip,
			absolute_host: Some(incoming_host),
			absolute_links,
			banner,
		};
		let input = proxy::HtmlRewriteInput { raw_body: &upstream.body, content_encoding: content_encoding.as_deref(), params };
		return match proxy::apply_html_rewrite(input) {
			Ok(html) => {
				let mut headers = proxy::prepare_response_headers(upstream.headers, true);
				headers.remove("content-type");
				headers.insert("content-type", "text/html; charset=utf-8".parse().unwrap());
				let mut resp = (upstream.status, html).into_response();
				*resp.headers_mut() = headers;
				resp
			}
			Err(e) => e.into_response(),
		};
	}

	let headers = proxy::prepare_response_headers(upstream.headers, false);
	let mut resp = (upstream.status, upstream.body).into_response();
	*resp.headers_mut() = headers;
	resp
}

fn apply_common_headers(resp: &mut Response, request_id: &str, status: RateLimitStatus) {
	resp.headers_mut().insert("x-request-id", request_id.parse().unwrap());
	if !resp.headers().contains_key("x-ratelimit-status") {
		resp.headers_mut().insert("x-ratelimit-status", status.as_str().parse().unwrap());
	}
}

/// `/websocket` upgrade path.
async fn ws_handler(
	State(state): State<SharedState>,
	ConnectInfo(remote): ConnectInfo<SocketAddr>,
	ws: WebSocketUpgrade,
	req: Request,
) -> Response {
	let start = Instant::now();
	let headers = req.headers().clone();
	let uri = req.uri().clone();
	let request_id = limiter::default_request_id(&headers);

	let Some(host) = header_str(&headers, "host").map(|h| h.to_string()) else {
		return ProxyError::UnknownHost(String::new()).into_response();
	};
	let Some(chain) = state.registry.resolve(&host) else {
		return ProxyError::UnknownHost(host).into_response();
	};
	if !(chain.services.rpc && chain.services.websocket) {
		return ProxyError::NoApplicableService { host, path: uri.path().to_string() }.into_response();
	}

	let ctx = request_context(&headers, remote, &state, "GET", uri.path(), &host, &request_id);
	let client_ip = limiter::RateLimiter::client_ip(&ctx).to_string();

	// An upgrade request carries no body, so there's nothing to key a
	// disconnect signal off before the upgrade completes; the blocking-wait
	// cancellation path only applies on the HTTP side.
	let decision = state.limiter.decide(&ctx, std::future::pending()).await;
	if let Decision::Deny { retry_after_secs, policy } = decision {
		state.metrics.record_denial();
		tracing::info!(
			target: "access",
			level = "WRN",
			event = "request",
			request_id = %request_id,
			host = %host,
			route = "ws",
			proxied = false,
			request = "GET /websocket",
			method = "GET",
			ip = %client_ip,
			src_count = 0i64,
			latency_ms = start.elapsed().as_millis() as u64,
			ua = header_str(&headers, "user-agent").unwrap_or_default(),
			country = "--",
			status = "blocked",
		);
		let mut resp = StatusCode::TOO_MANY_REQUESTS.into_response();
		resp.headers_mut().insert("retry-after", retry_after_secs.to_string().parse().unwrap());
		resp.headers_mut().insert("x-ratelimit-status", "blocked".parse().unwrap());
		if let Some(policy) = policy {
			resp.headers_mut().insert("x-ratelimit-policy", policy.parse().unwrap());
		}
		return resp;
	}

	let ports = state.registry.effective_ports(&chain);
	let backend_url = format!("ws://{}:{}/websocket", chain.ip, ports.rpc);
	let idle_timeout = chain.ws.effective_idle_timeout();
	let max_lifetime = chain.ws.effective_max_lifetime();

	ws.on_upgrade(move |socket| async move {
		tracing::info!(
			target: "access",
			level = "INF",
			event = "request",
			request_id = %request_id,
			host = %host,
			route = "ws",
			proxied = true,
			request = "GET /websocket",
			method = "GET",
			ip = %client_ip,
			src_count = 0i64,
			latency_ms = start.elapsed().as_millis() as u64,
			ua = "",
			country = "--",
			status = "ok",
		);
		let dial_headers = ws_bridge::DialHeaders {
			client_ip: client_ip.clone(),
			forwarded_host: host.clone(),
			request_id: request_id.clone(),
		};
		match ws_bridge::dial_backend(&backend_url, &dial_headers).await {
			Ok(backend) => {
				let summary = ws_bridge::bridge(socket, backend, idle_timeout, max_lifetime).await;
				tracing::info!(
					target: "access",
					level = "INF",
					event = "ws",
					request_id = %request_id,
					host = %host,
					route = "ws",
					proxied = true,
					request = "GET /websocket",
					method = "GET",
					ip = %client_ip,
					src_count = 0i64,
					latency_ms = summary.duration.as_millis() as u64,
					ua = "",
					country = "--",
					status = summary.cause.as_str(),
					up_bytes = summary.up_bytes,
					down_bytes = summary.down_bytes,
					avg_rate = summary.avg_rate_bytes_per_sec(),
				);
			}
			Err(_) => {
				let mut socket = socket;
				use axum::extract::ws::Message;
				let _ = futures_util::SinkExt::send(&mut socket, Message::Close(Some(ws_bridge::backend_unreachable_close()))).await;
			}
		}
	})
}
