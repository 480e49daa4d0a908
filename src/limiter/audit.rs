//! Append-only JSONL audit sink for rate limiter events. Writes are
//! serialized by an internal lock; log rotation safely truncates in place
//! because the sink only ever appends.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Value, json};

use crate::limiter::bucket::RateSpec;

/// Events worth recording. `Allow` is never persisted by default (allow
/// sampling is off) but is accepted here so callers don't need a separate
/// branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditEvent {
	TooManyRequests,
	AutoOverrideAdd,
	AutoOverrideExpire,
	WaitCanceled,
	Allow,
}

impl AuditEvent {
	fn as_str(self) -> &'static str {
		match self {
			AuditEvent::TooManyRequests => "429",
			AuditEvent::AutoOverrideAdd => "auto-override-add",
			AuditEvent::AutoOverrideExpire => "auto-override-expire",
			AuditEvent::WaitCanceled => "wait-canceled",
			AuditEvent::Allow => "allow",
		}
	}

	/// Whether this event survives the "important only" filter.
	fn is_important(self) -> bool {
		!matches!(self, AuditEvent::Allow)
	}
}

#[derive(Clone, Debug)]
pub struct AuditRecord {
	pub event: AuditEvent,
	pub ip: String,
	pub country: String,
	pub asn: String,
	pub method: String,
	pub path: String,
	pub host: String,
	pub user_agent: String,
	pub rps: f64,
	pub burst: u32,
	pub request_id: String,
}

impl AuditRecord {
	fn to_json(&self) -> Value {
		let reason = self.event.as_str();
		json!({
			"ts": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
			"ip": self.ip,
			"country": self.country,
			"asn": self.asn,
			"method": self.method,
			"path": self.path,
			"host": self.host,
			"user_agent": self.user_agent,
			"ua": self.user_agent,
			"event": reason,
			"reason": reason,
			"rps": self.rps,
			"burst": self.burst,
			"request_id": self.request_id,
		})
	}
}

pub struct AuditSink {
	file: Mutex<File>,
	important_only: bool,
}

impl AuditSink {
	pub fn open(path: &Path) -> std::io::Result<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(AuditSink { file: Mutex::new(file), important_only: true })
	}

	/// Append `record` if it passes the importance filter, and mirror
	/// important events as a single structured line to the main logger.
	pub fn record(&self, record: AuditRecord) {
		if self.important_only && !record.event.is_important() {
			return;
		}
		if record.event.is_important() {
			tracing::warn!(
				event = record.event.as_str(),
				ip = %record.ip,
				rps = record.rps,
				burst = record.burst,
				request_id = %record.request_id,
				"rate limiter event"
			);
		}
		let line = record.to_json().to_string();
		let mut file = self.file.lock().expect("audit sink lock poisoned");
		let _ = writeln!(file, "{line}");
	}

	pub fn close(&self) {
		if let Ok(mut file) = self.file.lock() {
			let _ = file.flush();
		}
	}
}

pub fn policy_header(ip: &str, spec: RateSpec) -> String {
	format!("ip={ip}; rps={}; burst={}", spec.rps, spec.clamped_burst())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile_like::TempPath;

	mod tempfile_like {
		use std::path::PathBuf;

		pub struct TempPath(pub PathBuf);
		impl TempPath {
			pub fn new(name: &str) -> Self {
				let mut p = std::env::temp_dir();
				p.push(format!("vprox-audit-test-{name}-{}", std::process::id()));
				TempPath(p)
			}
		}
		impl Drop for TempPath {
			fn drop(&mut self) {
				let _ = std::fs::remove_file(&self.0);
			}
		}
	}

	fn record(event: AuditEvent) -> AuditRecord {
		AuditRecord {
			event,
			ip: "1.2.3.4".to_string(),
			country: String::new(),
			asn: String::new(),
			method: "GET".to_string(),
			path: "/rpc/status".to_string(),
			host: "chain.example".to_string(),
			user_agent: "curl/8".to_string(),
			rps: 1.0,
			burst: 1,
			request_id: "req-abc".to_string(),
		}
	}

	#[test]
	fn important_events_are_written() {
		let path = TempPath::new("important");
		let sink = AuditSink::open(&path.0).unwrap();
		sink.record(record(AuditEvent::TooManyRequests));
		sink.close();
		let contents = std::fs::read_to_string(&path.0).unwrap();
		assert_eq!(contents.lines().count(), 1);
		let parsed: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
		assert_eq!(parsed["event"], "429");
		assert_eq!(parsed["reason"], "429");
		assert_eq!(parsed["ua"], "curl/8");
		assert_eq!(parsed["user_agent"], "curl/8");
	}

	#[test]
	fn allow_events_are_filtered_by_default() {
		let path = TempPath::new("filtered");
		let sink = AuditSink::open(&path.0).unwrap();
		sink.record(record(AuditEvent::Allow));
		sink.close();
		let contents = std::fs::read_to_string(&path.0).unwrap_or_default();
		assert!(contents.is_empty());
	}

	#[test]
	fn policy_header_format() {
		let header = policy_header("1.2.3.4", RateSpec { rps: 1.0, burst: 1 });
		assert_eq!(header, "ip=1.2.3.4; rps=1; burst=1");
	}
}
