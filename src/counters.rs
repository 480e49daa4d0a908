//! Access counter persistence.
//!
//! The map is protected by a single mutex; persistence happens while
//! holding it. The write-temp-then-rename pattern is shared with
//! `rotation.rs`'s last-run-timestamp persistence.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

pub struct AccessCounters {
	path: PathBuf,
	counts: Mutex<HashMap<String, i64>>,
}

impl AccessCounters {
	/// Load `<data>/access-counts.json` on startup, skipping entries with
	/// empty IPs or negative values.
	pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
		let path = path.into();
		let counts = match std::fs::read_to_string(&path) {
			Ok(contents) => parse_counts(&contents),
			Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
			Err(e) => return Err(e),
		};
		Ok(AccessCounters { path, counts: Mutex::new(counts) })
	}

	/// Increment `src_count[ip]` and persist the whole map atomically.
	pub fn increment(&self, ip: &str) -> io::Result<()> {
		if ip.is_empty() {
			return Ok(());
		}
		let mut counts = self.counts.lock().expect("counters mutex poisoned");
		*counts.entry(ip.to_string()).or_insert(0) += 1;
		persist(&self.path, &counts)
	}

	pub fn get(&self, ip: &str) -> i64 {
		self.counts.lock().expect("counters mutex poisoned").get(ip).copied().unwrap_or(0)
	}

	/// Clear the map and persist an empty object. Only reachable via
	/// explicit operator action, never from the shutdown path.
	pub fn reset(&self) -> io::Result<()> {
		let mut counts = self.counts.lock().expect("counters mutex poisoned");
		counts.clear();
		persist(&self.path, &counts)
	}
}

fn parse_counts(contents: &str) -> HashMap<String, i64> {
	let Ok(Value::Object(map)) = serde_json::from_str::<Value>(contents) else {
		return HashMap::new();
	};
	map.into_iter()
		.filter_map(|(ip, value)| {
			if ip.is_empty() {
				return None;
			}
			let count = value.as_i64()?;
			if count < 0 { None } else { Some((ip, count)) }
		})
		.collect()
}

fn persist(path: &Path, counts: &HashMap<String, i64>) -> io::Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let tmp_path = path.with_extension("json.tmp");
	let body = serde_json::to_string(counts)?;
	std::fs::write(&tmp_path, body)?;
	std::fs::rename(&tmp_path, path)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_path(name: &str) -> PathBuf {
		std::env::temp_dir().join(format!("vprox-counters-test-{name}-{}.json", std::process::id()))
	}

	#[test]
	fn increments_and_persists() {
		let path = temp_path("increment");
		let _ = std::fs::remove_file(&path);
		let counters = AccessCounters::load(&path).unwrap();
		counters.increment("1.2.3.4").unwrap();
		counters.increment("1.2.3.4").unwrap();
		assert_eq!(counters.get("1.2.3.4"), 2);

		let reloaded = AccessCounters::load(&path).unwrap();
		assert_eq!(reloaded.get("1.2.3.4"), 2);
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn empty_ip_is_ignored() {
		let path = temp_path("empty-ip");
		let _ = std::fs::remove_file(&path);
		let counters = AccessCounters::load(&path).unwrap();
		counters.increment("").unwrap();
		assert_eq!(counters.get(""), 0);
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn load_skips_invalid_entries() {
		let path = temp_path("invalid-entries");
		std::fs::write(&path, r#"{"": 5, "1.2.3.4": -1, "5.6.7.8": 3}"#).unwrap();
		let counters = AccessCounters::load(&path).unwrap();
		assert_eq!(counters.get("1.2.3.4"), 0);
		assert_eq!(counters.get("5.6.7.8"), 3);
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn reset_clears_and_persists_empty_object() {
		let path = temp_path("reset");
		let _ = std::fs::remove_file(&path);
		let counters = AccessCounters::load(&path).unwrap();
		counters.increment("1.2.3.4").unwrap();
		counters.reset().unwrap();
		assert_eq!(counters.get("1.2.3.4"), 0);
		let contents = std::fs::read_to_string(&path).unwrap();
		assert_eq!(contents, "{}");
		std::fs::remove_file(&path).ok();
	}
}
