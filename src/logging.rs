//! Structured dual-sink logging: an access log record per request, and
//! a main log that carries both ambient diagnostics and rotation status
//! lines.
//!
//! General diagnostics go through the ordinary `tracing` macros
//! (`debug!`/`warn!`/`error!`), initialized the way `src/mtrcs.rs`/
//! `src/proxyprotocol.rs` do it with `tracing_subscriber::fmt()` and an
//! `EnvFilter`. The per-request access record and the rotation status
//! line both need an exact one-line key=value shape the default
//! formatter doesn't produce, so each is emitted as a `tracing` event
//! under its own target (`"access"`, `"rotation"`) and rendered by a
//! small `tracing_subscriber::Layer` that writes the line to stdout
//! (colored) and/or the main log file (plain), following the
//! `module=access`/`module=rotation` tagging convention. Both layers
//! share one `Sinks` so access records and rotation status lines land in
//! the same main log file.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Clone, Debug, Default)]
pub struct AccessRecord {
	pub ts: String,
	pub level: &'static str,
	pub event: &'static str,
	pub request_id: String,
	pub host: String,
	pub route: String,
	pub proxied: bool,
	pub request: String,
	pub method: String,
	pub ip: String,
	pub src_count: i64,
	pub latency_ms: u64,
	pub ua: String,
	pub country: String,
	pub status: String,
	pub up_bytes: Option<u64>,
	pub down_bytes: Option<u64>,
	pub avg_rate: Option<f64>,
}

impl AccessRecord {
	/// Render the one-line key=value record, ending with the fixed
	/// `module=access` tag. `up_bytes`/`down_bytes`/`avg_rate` only appear
	/// for websocket session-close events.
	pub fn format_plain(&self) -> String {
		let mut line = format!(
			"ts={} level={} event={} request_id={} host={} route={} proxied={} request={} method={} ip={} src_count={} latency_ms={} ua={} country={} status={}",
			self.ts,
			self.level,
			self.event,
			quote(&self.request_id),
			quote(&self.host),
			quote(&self.route),
			self.proxied,
			quote(&self.request),
			quote(&self.method),
			quote(&self.ip),
			self.src_count,
			self.latency_ms,
			quote(&self.ua),
			quote(&self.country),
			quote(&self.status),
		);
		if let (Some(up), Some(down), Some(rate)) = (self.up_bytes, self.down_bytes, self.avg_rate) {
			line.push_str(&format!(" up_bytes={up} down_bytes={down} avg_rate={rate:.2}"));
		}
		line.push_str(" module=access");
		line
	}

	/// Same content with the `level=` token wrapped in an ANSI color for
	/// the stdout sink.
	pub fn format_colored(&self) -> String {
		let color = match self.level {
			"ERR" => "\x1b[31m",
			"WRN" => "\x1b[33m",
			_ => "\x1b[32m",
		};
		let plain = self.format_plain();
		plain.replacen(&format!("level={}", self.level), &format!("level={color}{}\x1b[0m", self.level), 1)
	}
}

fn level_static(value: &str) -> &'static str {
	match value {
		"ERR" => "ERR",
		"WRN" => "WRN",
		_ => "INF",
	}
}

fn event_static(value: &str) -> &'static str {
	match value {
		"ws" => "ws",
		_ => "request",
	}
}

fn quote(value: &str) -> String {
	if value.contains(' ') || value.is_empty() {
		format!("\"{value}\"")
	} else {
		value.to_string()
	}
}

fn level_from_metadata(level: &Level) -> &'static str {
	match *level {
		Level::ERROR => "ERR",
		Level::WARN => "WRN",
		_ => "INF",
	}
}

pub struct Sinks {
	pub stdout: bool,
	pub file: Option<Mutex<File>>,
}

impl Sinks {
	/// `foreground` selects dual-sink vs file-only: write to both
	/// stdout-with-color and file-plain when the server is in foreground
	/// mode, file-only otherwise.
	pub fn open(main_log_path: &Path, foreground: bool) -> std::io::Result<Self> {
		if let Some(parent) = main_log_path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let file = std::fs::OpenOptions::new().create(true).append(true).open(main_log_path)?;
		Ok(Sinks { stdout: foreground, file: Some(Mutex::new(file)) })
	}

	fn write_line(&self, colored: &str, plain: &str) {
		if self.stdout {
			println!("{colored}");
		}
		if let Some(file) = &self.file {
			let mut file = file.lock().expect("log file mutex poisoned");
			let _ = writeln!(file, "{plain}");
		}
	}
}

/// A `tracing_subscriber::Layer` that intercepts events under
/// `target: "access"` and renders them through `Sinks`, leaving every
/// other event for the default fmt layer to handle.
pub struct AccessLayer {
	sinks: Arc<Sinks>,
}

impl AccessLayer {
	pub fn new(sinks: Arc<Sinks>) -> Self {
		AccessLayer { sinks }
	}
}

impl<S> Layer<S> for AccessLayer
where
	S: Subscriber + for<'a> LookupSpan<'a>,
{
	fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
		if event.metadata().target() != "access" {
			return;
		}
		let mut visitor = AccessVisitor::default();
		event.record(&mut visitor);
		let record = visitor.into_record();
		self.sinks.write_line(&record.format_colored(), &record.format_plain());
	}
}

#[derive(Default)]
struct AccessVisitor {
	record: AccessRecord,
}

impl AccessVisitor {
	fn into_record(mut self) -> AccessRecord {
		if self.record.ts.is_empty() {
			self.record.ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
		}
		self.record
	}
}

impl Visit for AccessVisitor {
	fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
		self.record_str(field, &format!("{value:?}"));
	}

	fn record_str(&mut self, field: &Field, value: &str) {
		match field.name() {
			"level" => self.record.level = level_static(value),
			"event" => self.record.event = event_static(value),
			"request_id" => self.record.request_id = value.to_string(),
			"host" => self.record.host = value.to_string(),
			"route" => self.record.route = value.to_string(),
			"request" => self.record.request = value.to_string(),
			"method" => self.record.method = value.to_string(),
			"ip" => self.record.ip = value.to_string(),
			"ua" => self.record.ua = value.to_string(),
			"country" => self.record.country = value.to_string(),
			"status" => self.record.status = value.to_string(),
			_ => {}
		}
	}

	fn record_bool(&mut self, field: &Field, value: bool) {
		if field.name() == "proxied" {
			self.record.proxied = value;
		}
	}

	fn record_i64(&mut self, field: &Field, value: i64) {
		if field.name() == "src_count" {
			self.record.src_count = value;
		}
	}

	fn record_u64(&mut self, field: &Field, value: u64) {
		match field.name() {
			"latency_ms" => self.record.latency_ms = value,
			"src_count" => self.record.src_count = value as i64,
			"up_bytes" => self.record.up_bytes = Some(value),
			"down_bytes" => self.record.down_bytes = Some(value),
			_ => {}
		}
	}

	fn record_f64(&mut self, field: &Field, value: f64) {
		if field.name() == "avg_rate" {
			self.record.avg_rate = Some(value);
		}
	}
}

/// The rotation status line: `BACKUP STARTED` / `BACKUP COMPLETE` /
/// `BACKUP FAILED`, rendered the same key=value way as `AccessRecord` but
/// with fields that only appear when the outcome has them.
#[derive(Clone, Debug, Default)]
pub struct RotationRecord {
	pub ts: String,
	pub level: &'static str,
	pub event: String,
	pub filesize: Option<u64>,
	pub archivesize: Option<u64>,
	pub location: String,
	pub filename: String,
	pub compression: String,
	pub reason: String,
}

impl RotationRecord {
	pub fn format_plain(&self) -> String {
		let mut line = format!("ts={} level={} event={}", self.ts, self.level, quote(&self.event));
		if let Some(filesize) = self.filesize {
			line.push_str(&format!(" filesize={filesize}"));
		}
		if let Some(archivesize) = self.archivesize {
			line.push_str(&format!(" archivesize={archivesize}"));
		}
		if !self.location.is_empty() {
			line.push_str(&format!(" location={}", quote(&self.location)));
		}
		if !self.filename.is_empty() {
			line.push_str(&format!(" filename={}", quote(&self.filename)));
		}
		if !self.compression.is_empty() {
			line.push_str(&format!(" compression={}", self.compression));
		}
		if !self.reason.is_empty() {
			line.push_str(&format!(" reason={}", quote(&self.reason)));
		}
		line.push_str(" module=rotation");
		line
	}

	pub fn format_colored(&self) -> String {
		let color = match self.level {
			"ERR" => "\x1b[31m",
			"WRN" => "\x1b[33m",
			_ => "\x1b[32m",
		};
		let plain = self.format_plain();
		plain.replacen(&format!("level={}", self.level), &format!("level={color}{}\x1b[0m", self.level), 1)
	}
}

/// A `tracing_subscriber::Layer` that intercepts events under
/// `target: "rotation"`. The line's severity comes from the macro used at
/// the call site (`info!` vs `warn!`) rather than an explicit field, so a
/// forgotten field can't silently downgrade a failure to `INF`.
pub struct RotationLayer {
	sinks: Arc<Sinks>,
}

impl RotationLayer {
	pub fn new(sinks: Arc<Sinks>) -> Self {
		RotationLayer { sinks }
	}
}

impl<S> Layer<S> for RotationLayer
where
	S: Subscriber + for<'a> LookupSpan<'a>,
{
	fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
		if event.metadata().target() != "rotation" {
			return;
		}
		let mut visitor = RotationVisitor {
			record: RotationRecord { level: level_from_metadata(event.metadata().level()), ..Default::default() },
		};
		event.record(&mut visitor);
		let mut record = visitor.record;
		if record.ts.is_empty() {
			record.ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
		}
		self.sinks.write_line(&record.format_colored(), &record.format_plain());
	}
}

struct RotationVisitor {
	record: RotationRecord,
}

impl Visit for RotationVisitor {
	fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
		self.record_str(field, &format!("{value:?}"));
	}

	fn record_str(&mut self, field: &Field, value: &str) {
		match field.name() {
			"event" => self.record.event = value.to_string(),
			"location" => self.record.location = value.to_string(),
			"filename" => self.record.filename = value.to_string(),
			"compression" => self.record.compression = value.to_string(),
			"reason" => self.record.reason = value.to_string(),
			_ => {}
		}
	}

	fn record_u64(&mut self, field: &Field, value: u64) {
		match field.name() {
			"filesize" => self.record.filesize = Some(value),
			"archivesize" => self.record.archivesize = Some(value),
			_ => {}
		}
	}
}

/// Install the global subscriber: an `EnvFilter`-driven fmt layer for
/// ambient diagnostics (grounded in `src/mtrcs.rs`'s
/// `tracing_subscriber::fmt()` setup) plus `AccessLayer`/`RotationLayer`
/// for the access and rotation record streams, both backed by the same
/// `Sinks` so they share the main log file.
pub fn init(main_log_path: &Path, foreground: bool) -> std::io::Result<()> {
	let sinks = Arc::new(Sinks::open(main_log_path, foreground)?);
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_ansi(foreground)
		.with_writer(std::io::stderr)
		.with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
			metadata.target() != "access" && metadata.target() != "rotation"
		}));
	tracing_subscriber::registry()
		.with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with(fmt_layer)
		.with(AccessLayer::new(sinks.clone()))
		.with(RotationLayer::new(sinks))
		.init();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record() -> AccessRecord {
		AccessRecord {
			ts: "2026-08-01T00:00:00.000Z".to_string(),
			level: "INF",
			event: "request",
			request_id: "req-abc".to_string(),
			host: "chain.example".to_string(),
			route: "rpc".to_string(),
			proxied: true,
			request: "GET /rpc/status".to_string(),
			method: "GET".to_string(),
			ip: "1.2.3.4".to_string(),
			src_count: 12,
			latency_ms: 5,
			ua: "curl/8".to_string(),
			country: "--".to_string(),
			status: "ok".to_string(),
			up_bytes: None,
			down_bytes: None,
			avg_rate: None,
		}
	}

	#[test]
	fn plain_format_contains_all_required_fields() {
		let line = record().format_plain();
		for key in [
			"ts=", "level=INF", "event=request", "request_id=", "host=", "route=", "proxied=true", "request=", "method=",
			"ip=", "src_count=12", "latency_ms=5", "ua=", "country=", "status=", "module=access",
		] {
			assert!(line.contains(key), "missing {key} in {line}");
		}
	}

	#[test]
	fn plain_format_omits_ws_fields_when_absent() {
		let line = record().format_plain();
		assert!(!line.contains("up_bytes="));
		assert!(!line.contains("avg_rate="));
	}

	#[test]
	fn plain_format_includes_ws_fields_when_present() {
		let mut r = record();
		r.event = "ws";
		r.up_bytes = Some(100);
		r.down_bytes = Some(200);
		r.avg_rate = Some(12.5);
		let line = r.format_plain();
		assert!(line.contains("event=ws"));
		assert!(line.contains("up_bytes=100"));
		assert!(line.contains("down_bytes=200"));
		assert!(line.contains("avg_rate=12.50"));
	}

	#[test]
	fn colored_format_wraps_level_only() {
		let line = record().format_colored();
		assert!(line.contains("\x1b[32mINF\x1b[0m"));
		assert!(line.contains("module=access"));
	}

	#[test]
	fn error_level_colored_red() {
		let mut r = record();
		r.level = "ERR";
		assert!(r.format_colored().contains("\x1b[31mERR\x1b[0m"));
	}

	fn rotation_record() -> RotationRecord {
		RotationRecord { ts: "2026-08-01T00:00:00.000Z".to_string(), level: "INF", event: "BACKUP STARTED".to_string(), ..Default::default() }
	}

	#[test]
	fn rotation_started_line_has_no_size_fields() {
		let line = rotation_record().format_plain();
		assert!(line.contains("event=\"BACKUP STARTED\""));
		assert!(!line.contains("filesize="));
		assert!(line.ends_with("module=rotation"));
	}

	#[test]
	fn rotation_complete_line_includes_sizes_and_compression() {
		let mut r = rotation_record();
		r.event = "BACKUP COMPLETE".to_string();
		r.filesize = Some(1024);
		r.archivesize = Some(256);
		r.location = "/var/log/vprox/archive/main.log.20260801_000000.tar.gz".to_string();
		r.filename = "main.log.20260801_000000.tar.gz".to_string();
		r.compression = "TAR.GZ".to_string();
		let line = r.format_plain();
		assert!(line.contains("filesize=1024"));
		assert!(line.contains("archivesize=256"));
		assert!(line.contains("compression=TAR.GZ"));
	}

	#[test]
	fn rotation_failed_line_uses_warn_level_and_reason() {
		let mut r = rotation_record();
		r.level = "WRN";
		r.event = "BACKUP FAILED".to_string();
		r.reason = "disk full".to_string();
		let line = r.format_colored();
		assert!(line.contains("\x1b[33mWRN\x1b[0m"));
		assert!(line.contains("reason="));
	}
}
