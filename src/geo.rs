//! Geo-IP lookup interface: `country(ip)` and `asn(ip)` tolerate empty
//! results. The core never implements the lookup itself; it depends on
//! this trait so an external collaborator can plug in a real database.

use std::net::IpAddr;

pub trait GeoLookup: Send + Sync {
	fn country(&self, ip: IpAddr) -> String;
	fn asn(&self, ip: IpAddr) -> String;
}

/// A lookup that always returns empty results, used when no geo database
/// is configured. `access_log` renders an empty country as `"--"`.
#[derive(Default, Clone, Copy)]
pub struct NoopGeo;

impl GeoLookup for NoopGeo {
	fn country(&self, _ip: IpAddr) -> String {
		String::new()
	}
	fn asn(&self, _ip: IpAddr) -> String {
		String::new()
	}
}

pub fn display_country(country: &str) -> &str {
	if country.is_empty() { "--" } else { country }
}

/// Delegates to a shared `Arc<dyn GeoLookup>`, letting the limiter hold its
/// own `Box<dyn GeoLookup>` while `AppState` keeps the canonical `Arc` for
/// access-log rendering.
pub struct SharedGeo(pub std::sync::Arc<dyn GeoLookup>);

impl GeoLookup for SharedGeo {
	fn country(&self, ip: IpAddr) -> String {
		self.0.country(ip)
	}
	fn asn(&self, ip: IpAddr) -> String {
		self.0.asn(ip)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn noop_geo_returns_empty() {
		let geo = NoopGeo;
		let ip: IpAddr = "127.0.0.1".parse().unwrap();
		assert_eq!(geo.country(ip), "");
		assert_eq!(geo.asn(ip), "");
	}

	#[test]
	fn display_country_defaults_to_dashes() {
		assert_eq!(display_country(""), "--");
		assert_eq!(display_country("US"), "US");
	}
}
