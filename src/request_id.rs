//! Request correlation IDs: accept a well-formed inbound `X-Request-ID`
//! or mint a fresh one.

use once_cell::sync::Lazy;
use regex::Regex;

static VALID_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-_.:/]+$").unwrap());

/// Accept an inbound `X-Request-ID` if it is non-empty, at most 128 bytes,
/// and matches the allowed character class; otherwise generate a fresh one.
pub fn accept_or_generate(inbound: Option<&str>) -> String {
	if let Some(id) = inbound {
		if !id.is_empty() && id.len() <= 128 && VALID_ID_RE.is_match(id) {
			return id.to_string();
		}
	}
	generate()
}

fn generate() -> String {
	let bits: u128 = rand::random();
	// 96 random bits, hex-encoded (24 hex chars).
	format!("req-{:024x}", bits & 0xffff_ffff_ffff_ffff_ffff_ffff)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_valid_inbound_id() {
		assert_eq!(accept_or_generate(Some("abc-123_def.ghi:jkl/mno")), "abc-123_def.ghi:jkl/mno");
	}

	#[test]
	fn rejects_invalid_characters() {
		let id = accept_or_generate(Some("has spaces"));
		assert!(id.starts_with("req-"));
	}

	#[test]
	fn rejects_overlong_id() {
		let long = "a".repeat(200);
		let id = accept_or_generate(Some(&long));
		assert!(id.starts_with("req-"));
	}

	#[test]
	fn generates_when_absent() {
		let id = accept_or_generate(None);
		assert!(id.starts_with("req-"));
		assert_eq!(id.len(), "req-".len() + 24);
	}
}
