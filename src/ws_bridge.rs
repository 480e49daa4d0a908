//! WebSocket bridge: dual-direction frame pump with idle-deadline
//! extension and optional hard lifetime.
//!
//! Each direction is modeled as its own future returning once the peer it
//! reads from errors or closes; the bridge races both plus an optional
//! lifetime timer and the first to finish decides the close cause. The
//! client-side upgrade itself is accepted unconditionally before this
//! runs, mirroring the `OnUpgrade`-driven handoff in
//! `crates/agentgateway/src/proxy/httpproxy.rs`'s `handle_upgrade`.

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame as BackendCloseFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCause {
	IdleTimeout,
	Closed,
	HardTimeout,
	Error,
}

impl CloseCause {
	pub fn as_str(self) -> &'static str {
		match self {
			CloseCause::IdleTimeout => "idle_timeout",
			CloseCause::Closed => "closed",
			CloseCause::HardTimeout => "hard_timeout",
			CloseCause::Error => "error",
		}
	}
}

pub struct BridgeSummary {
	pub up_bytes: u64,
	pub down_bytes: u64,
	pub duration: Duration,
	pub cause: CloseCause,
}

impl BridgeSummary {
	pub fn avg_rate_bytes_per_sec(&self) -> f64 {
		let secs = self.duration.as_secs_f64();
		if secs <= 0.0 {
			0.0
		} else {
			(self.up_bytes + self.down_bytes) as f64 / secs
		}
	}
}

pub struct DialHeaders {
	pub client_ip: String,
	pub forwarded_host: String,
	pub request_id: String,
}

/// Dial the backend at `backend_url` (a `ws://` URL). On failure the
/// caller is expected to close the client side with 1013 "backend
/// unreachable".
pub async fn dial_backend(
	backend_url: &str,
	headers: &DialHeaders,
) -> Result<
	tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
	tokio_tungstenite::tungstenite::Error,
> {
	use tokio_tungstenite::tungstenite::client::IntoClientRequest;

	let mut request = backend_url.into_client_request()?;
	let map = request.headers_mut();
	map.insert("x-forwarded-for", headers.client_ip.parse().unwrap());
	map.insert("x-forwarded-host", headers.forwarded_host.parse().unwrap());
	map.insert("x-request-id", headers.request_id.parse().unwrap());

	let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
	Ok(stream)
}

pub fn backend_unreachable_close() -> CloseFrame {
	CloseFrame { code: 1013, reason: "backend unreachable".into() }
}

fn hard_lifetime_close() -> BackendCloseFrame<'static> {
	BackendCloseFrame { code: CloseCode::Normal, reason: "max lifetime reached".into() }
}

fn client_hard_lifetime_close() -> CloseFrame {
	CloseFrame { code: 1000, reason: "max lifetime reached".into() }
}

/// Run the bidirectional pump until one side errs, closes, or the
/// lifetime timer fires. Consumes both sockets; the caller is responsible
/// for having already performed the upgrade handshake and the backend
/// dial.
pub async fn bridge(
	client: WebSocket,
	backend: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
	idle_timeout: Duration,
	max_lifetime: Option<Duration>,
) -> BridgeSummary {
	let start = Instant::now();
	let (mut client_tx, mut client_rx) = client.split();
	let (mut backend_tx, mut backend_rx) = backend.split();

	let up_bytes = std::sync::atomic::AtomicU64::new(0);
	let down_bytes = std::sync::atomic::AtomicU64::new(0);

	let client_to_backend = async {
		loop {
			let msg = match tokio::time::timeout(idle_timeout, client_rx.next()).await {
				Ok(Some(Ok(msg))) => msg,
				Ok(Some(Err(_))) => return CloseCause::Error,
				Ok(None) => return CloseCause::Closed,
				Err(_) => return CloseCause::IdleTimeout,
			};
			let len = client_message_len(&msg);
			up_bytes.fetch_add(len as u64, std::sync::atomic::Ordering::Relaxed);
			let Some(out) = to_backend_message(msg) else {
				return CloseCause::Closed;
			};
			if backend_tx.send(out).await.is_err() {
				return CloseCause::Error;
			}
		}
	};

	let backend_to_client = async {
		loop {
			let msg = match tokio::time::timeout(idle_timeout, backend_rx.next()).await {
				Ok(Some(Ok(msg))) => msg,
				Ok(Some(Err(_))) => return CloseCause::Error,
				Ok(None) => return CloseCause::Closed,
				Err(_) => return CloseCause::IdleTimeout,
			};
			let len = backend_message_len(&msg);
			down_bytes.fetch_add(len as u64, std::sync::atomic::Ordering::Relaxed);
			let Some(out) = to_client_message(msg) else {
				return CloseCause::Closed;
			};
			if client_tx.send(out).await.is_err() {
				return CloseCause::Error;
			}
		}
	};

	let cause = if let Some(lifetime) = max_lifetime {
		tokio::select! {
			cause = client_to_backend => cause,
			cause = backend_to_client => cause,
			_ = tokio::time::sleep(lifetime) => {
				let _ = backend_tx.send(BackendMessage::Close(Some(hard_lifetime_close()))).await;
				let _ = client_tx.send(ClientMessage::Close(Some(client_hard_lifetime_close()))).await;
				CloseCause::HardTimeout
			}
		}
	} else {
		tokio::select! {
			cause = client_to_backend => cause,
			cause = backend_to_client => cause,
		}
	};

	BridgeSummary {
		up_bytes: up_bytes.load(std::sync::atomic::Ordering::Relaxed),
		down_bytes: down_bytes.load(std::sync::atomic::Ordering::Relaxed),
		duration: start.elapsed(),
		cause,
	}
}

fn client_message_len(msg: &ClientMessage) -> usize {
	match msg {
		ClientMessage::Text(t) => t.len(),
		ClientMessage::Binary(b) => b.len(),
		ClientMessage::Ping(p) | ClientMessage::Pong(p) => p.len(),
		ClientMessage::Close(_) => 0,
	}
}

fn backend_message_len(msg: &BackendMessage) -> usize {
	match msg {
		BackendMessage::Text(t) => t.len(),
		BackendMessage::Binary(b) => b.len(),
		BackendMessage::Ping(p) | BackendMessage::Pong(p) => p.len(),
		BackendMessage::Close(_) | BackendMessage::Frame(_) => 0,
	}
}

fn to_backend_message(msg: ClientMessage) -> Option<BackendMessage> {
	Some(match msg {
		ClientMessage::Text(t) => BackendMessage::Text(t.as_str().into()),
		ClientMessage::Binary(b) => BackendMessage::Binary(b.to_vec()),
		ClientMessage::Ping(p) => BackendMessage::Ping(p.to_vec()),
		ClientMessage::Pong(p) => BackendMessage::Pong(p.to_vec()),
		ClientMessage::Close(_) => return None,
	})
}

fn to_client_message(msg: BackendMessage) -> Option<ClientMessage> {
	Some(match msg {
		BackendMessage::Text(t) => ClientMessage::Text(t.as_str().into()),
		BackendMessage::Binary(b) => ClientMessage::Binary(b.into()),
		BackendMessage::Ping(p) => ClientMessage::Ping(p.into()),
		BackendMessage::Pong(p) => ClientMessage::Pong(p.into()),
		BackendMessage::Close(_) | BackendMessage::Frame(_) => return None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn close_cause_labels_match_wire_strings() {
		assert_eq!(CloseCause::IdleTimeout.as_str(), "idle_timeout");
		assert_eq!(CloseCause::Closed.as_str(), "closed");
		assert_eq!(CloseCause::HardTimeout.as_str(), "hard_timeout");
		assert_eq!(CloseCause::Error.as_str(), "error");
	}

	#[test]
	fn avg_rate_handles_zero_duration() {
		let summary = BridgeSummary { up_bytes: 10, down_bytes: 10, duration: Duration::ZERO, cause: CloseCause::Closed };
		assert_eq!(summary.avg_rate_bytes_per_sec(), 0.0);
	}

	#[test]
	fn avg_rate_computes_bytes_per_sec() {
		let summary = BridgeSummary {
			up_bytes: 100,
			down_bytes: 100,
			duration: Duration::from_secs(2),
			cause: CloseCause::Closed,
		};
		assert_eq!(summary.avg_rate_bytes_per_sec(), 100.0);
	}

	#[test]
	fn backend_unreachable_close_uses_1013() {
		assert_eq!(backend_unreachable_close().code, 1013);
	}
}
