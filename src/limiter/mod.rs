//! Per-IP token-bucket rate limiter with auto-quarantine.
//!
//! Buckets are kept in a `DashMap` sharded by IP: a sharded concurrent map
//! keyed by IP where bucket updates for a given IP are serialized by that
//! bucket's internal state. Each `DashMap` entry is only ever touched
//! while its shard lock is held, so a single `Entry` carries plain,
//! unsynchronized state.

pub mod audit;
pub mod bucket;
pub mod quarantine;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::sleep;

use crate::geo::GeoLookup;
use crate::request_id;

pub use audit::{AuditEvent, AuditRecord, AuditSink};
pub use bucket::{RateSpec, TokenBucket};
pub use quarantine::{AutoRule, Override, OverrideKind, StrikeOutcome, StrikeState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitStatus {
	Ok,
	Limited,
	Blocked,
}

impl RateLimitStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			RateLimitStatus::Ok => "ok",
			RateLimitStatus::Limited => "limited",
			RateLimitStatus::Blocked => "blocked",
		}
	}
}

/// Outcome of one enforcement decision, enough for the caller to finish
/// building the response headers: `X-RateLimit-Status`, `Retry-After`,
/// `X-RateLimit-Policy`.
#[derive(Debug)]
pub enum Decision {
	Allow { status: RateLimitStatus },
	Deny { retry_after_secs: u64, policy: Option<String> },
}

struct Entry {
	bucket: TokenBucket,
	strikes: StrikeState,
	override_: Option<Override>,
}

impl Entry {
	fn new(defaults: RateSpec) -> Self {
		Entry { bucket: TokenBucket::new(defaults), strikes: StrikeState::default(), override_: None }
	}
}

/// Request attributes the limiter needs; the caller extracts these once
/// and passes them down instead of the limiter reaching back into axum
/// extractors.
pub struct RequestContext<'a> {
	pub remote_addr: IpAddr,
	pub headers: &'a axum::http::HeaderMap,
	pub trust_proxy: bool,
	pub real_ip_header: Option<&'a str>,
	pub method: String,
	pub path: String,
	pub host: String,
	pub user_agent: String,
	pub request_id: String,
}

pub struct Config {
	pub defaults: RateSpec,
	pub enforce_defaults: bool,
	pub auto_rule: Option<AutoRule>,
}

pub struct RateLimiter {
	entries: DashMap<IpAddr, Entry>,
	config: Config,
	audit: AuditSink,
	geo: Box<dyn GeoLookup>,
}

impl RateLimiter {
	pub fn new(config: Config, audit: AuditSink, geo: Box<dyn GeoLookup>) -> Self {
		RateLimiter { entries: DashMap::new(), config, audit, geo }
	}

	pub fn set_override(&self, ip: IpAddr, spec: RateSpec) {
		let mut entry = self.entries.entry(ip).or_insert_with(|| Entry::new(self.config.defaults));
		entry.override_ = Some(Override::manual(spec));
		entry.bucket.reconfigure(spec);
	}

	pub fn delete_override(&self, ip: IpAddr) {
		if let Some(mut entry) = self.entries.get_mut(&ip) {
			entry.override_ = None;
			entry.bucket.reconfigure(self.config.defaults);
		}
	}

	pub fn close(&self) {
		self.audit.close();
	}

	/// Resolve the client IP per the priority chain: CF-Connecting-IP,
	/// then the operator-configured real-IP header, then `Forwarded`'s
	/// `for=` param, then the first `X-Forwarded-For` token, falling back
	/// to the remote socket address.
	pub fn client_ip(ctx: &RequestContext) -> IpAddr {
		if ctx.trust_proxy {
			if let Some(ip) = header_first_token(ctx.headers, "cf-connecting-ip") {
				return ip;
			}
			if let Some(name) = ctx.real_ip_header {
				if let Some(ip) = header_first_token(ctx.headers, name) {
					return ip;
				}
			}
			if let Some(ip) = forwarded_for_param(ctx.headers) {
				return ip;
			}
			if let Some(ip) = header_first_token(ctx.headers, "x-forwarded-for") {
				return ip;
			}
		} else if let Some(name) = ctx.real_ip_header {
			// The explicit operator-configured header is honored even
			// without trust_proxy; every other source requires it.
			if let Some(ip) = header_first_token(ctx.headers, name) {
				return ip;
			}
		}
		ctx.remote_addr
	}

	/// Run the full enforcement pipeline for one request: auto-quarantine
	/// bookkeeping, then the allow/wait decision. `cancelled` resolves if
	/// the inbound request is aborted, to bound blocking waits in default
	/// mode.
	pub async fn decide(&self, ctx: &RequestContext<'_>, cancelled: impl std::future::Future<Output = ()>) -> Decision {
		let ip = Self::client_ip(ctx);
		let now = Instant::now();
		let mut entry = self.entries.entry(ip).or_insert_with(|| Entry::new(self.config.defaults));

		if let Some(rule) = &self.config.auto_rule {
			match entry.strikes.record(rule, now) {
				StrikeOutcome::Counted => {}
				StrikeOutcome::Tripped { penalty, expiry } => {
					entry.override_ = Some(Override::auto(penalty, expiry));
					entry.bucket.reconfigure(penalty);
					self.audit.record(self.audit_record(ctx, ip, AuditEvent::AutoOverrideAdd, penalty));
				}
			}
		}

		if let Some(ov) = entry.override_ {
			if ov.expired(now) {
				entry.override_ = None;
				entry.bucket.reconfigure(self.config.defaults);
				self.audit.record(self.audit_record(ctx, ip, AuditEvent::AutoOverrideExpire, self.config.defaults));
			}
		}

		let strict = entry.override_.is_some();
		let spec = entry.bucket.spec();

		if strict {
			return self.decide_strict(ctx, ip, &mut entry.bucket, spec);
		}

		if self.config.enforce_defaults {
			if entry.bucket.try_allow() {
				Decision::Allow { status: RateLimitStatus::Ok }
			} else {
				self.audit.record(self.audit_record(ctx, ip, AuditEvent::TooManyRequests, spec));
				Decision::Deny { retry_after_secs: 1, policy: None }
			}
		} else {
			drop(entry);
			self.decide_default_wait(ctx, ip, spec, cancelled).await
		}
	}

	fn decide_strict(&self, ctx: &RequestContext, ip: IpAddr, bucket: &mut TokenBucket, spec: RateSpec) -> Decision {
		if bucket.try_allow() {
			Decision::Allow { status: RateLimitStatus::Limited }
		} else {
			self.audit.record(self.audit_record(ctx, ip, AuditEvent::TooManyRequests, spec));
			let policy = audit::policy_header(&ip.to_string(), spec);
			Decision::Deny { retry_after_secs: 1, policy: Some(policy) }
		}
	}

	async fn decide_default_wait(
		&self,
		ctx: &RequestContext<'_>,
		ip: IpAddr,
		spec: RateSpec,
		cancelled: impl std::future::Future<Output = ()>,
	) -> Decision {
		let wait = {
			let mut entry = self.entries.entry(ip).or_insert_with(|| Entry::new(self.config.defaults));
			if entry.bucket.try_allow() {
				return Decision::Allow { status: RateLimitStatus::Ok };
			}
			entry.bucket.wait_duration()
		};

		tokio::select! {
			_ = sleep(wait) => {
				let mut entry = self.entries.entry(ip).or_insert_with(|| Entry::new(self.config.defaults));
				if entry.bucket.try_allow() {
					Decision::Allow { status: RateLimitStatus::Ok }
				} else {
					self.audit.record(self.audit_record(ctx, ip, AuditEvent::TooManyRequests, spec));
					Decision::Deny { retry_after_secs: 1, policy: None }
				}
			}
			_ = cancelled => {
				self.audit.record(self.audit_record(ctx, ip, AuditEvent::WaitCanceled, spec));
				Decision::Deny { retry_after_secs: 1, policy: None }
			}
		}
	}

	fn audit_record(&self, ctx: &RequestContext, ip: IpAddr, event: AuditEvent, spec: RateSpec) -> AuditRecord {
		AuditRecord {
			event,
			ip: ip.to_string(),
			country: self.geo.country(ip),
			asn: self.geo.asn(ip),
			method: ctx.method.clone(),
			path: ctx.path.clone(),
			host: ctx.host.clone(),
			user_agent: ctx.user_agent.clone(),
			rps: spec.rps,
			burst: spec.clamped_burst(),
			request_id: ctx.request_id.clone(),
		}
	}
}

fn header_first_token(headers: &axum::http::HeaderMap, name: &str) -> Option<IpAddr> {
	let value = headers.get(name)?.to_str().ok()?;
	let first = value.split(',').next()?.trim();
	strip_brackets_and_port(first).parse().ok()
}

fn forwarded_for_param(headers: &axum::http::HeaderMap) -> Option<IpAddr> {
	let value = headers.get("forwarded")?.to_str().ok()?;
	for part in value.split(';') {
		let part = part.trim();
		if let Some(rest) = part.strip_prefix("for=") {
			let token = rest.trim_matches('"');
			return strip_brackets_and_port(token).parse().ok();
		}
	}
	None
}

fn strip_brackets_and_port(token: &str) -> &str {
	let token = token.trim();
	if let Some(rest) = token.strip_prefix('[') {
		if let Some(end) = rest.find(']') {
			return &rest[..end];
		}
	}
	match token.rsplit_once(':') {
		Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.is_empty() => host,
		_ => token,
	}
}

pub fn default_request_id(headers: &axum::http::HeaderMap) -> String {
	let inbound = headers.get("x-request-id").and_then(|v| v.to_str().ok());
	request_id::accept_or_generate(inbound)
}
