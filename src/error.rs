use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced while routing or proxying a single request.
///
/// Every variant maps to exactly one HTTP status; the top-level handler
/// converts the error into a response and still emits one access log
/// line, following the `ProxyError` -> `as_response()` pattern in
/// agentgateway's `crates/agentgateway/src/proxy/httpproxy.rs`.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("unknown host: {0}")]
	UnknownHost(String),

	#[error("no applicable service for {host} at {path}")]
	NoApplicableService { host: String, path: String },

	#[error("upstream dial failed: {0}")]
	UpstreamDial(#[source] anyhow::Error),

	#[error("upstream read failed: {0}")]
	UpstreamRead(#[source] anyhow::Error),

	#[error("failed to build upstream body: {0}")]
	BodyBuild(#[source] anyhow::Error),

	#[error("gzip error while rewriting body: {0}")]
	Gzip(#[source] std::io::Error),

	#[error("rate limited")]
	RateLimited { retry_after_secs: u64 },
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::UnknownHost(_) => StatusCode::BAD_REQUEST,
			ProxyError::NoApplicableService { .. } => StatusCode::NOT_FOUND,
			ProxyError::UpstreamDial(_) | ProxyError::UpstreamRead(_) => StatusCode::BAD_GATEWAY,
			ProxyError::BodyBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Gzip(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
		}
	}
}

impl IntoResponse for ProxyError {
	fn into_response(self) -> Response {
		let status = self.status();
		let body = self.to_string();
		let mut resp = (status, body).into_response();
		if let ProxyError::RateLimited { retry_after_secs } = &self {
			resp
				.headers_mut()
				.insert("Retry-After", retry_after_secs.to_string().parse().unwrap());
		}
		resp
	}
}
