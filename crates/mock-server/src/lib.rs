//! Test fixture target server.
//!
//! Stands in for the application behind the proxy: a couple of plain
//! routes, a deliberately slow mutating endpoint that reports context
//! entries through `x-callback-url`, a concurrency gauge for observing
//! serialization from the outside, and a WebSocket echo.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

#[derive(Clone)]
struct AppState {
	/// Requests currently inside the `/slow` handler, and the highest that
	/// gauge has ever been.
	in_flight: Arc<AtomicUsize>,
	max_in_flight: Arc<AtomicUsize>,
	client: reqwest::Client,
}

#[derive(Debug, Serialize)]
pub struct ConcurrencySnapshot {
	pub current: usize,
	pub max: usize,
}

pub struct Server {
	address: SocketAddr,
	shutdown: tokio::sync::oneshot::Sender<()>,
	handle: tokio::task::JoinHandle<()>,
}

impl Server {
	pub async fn run() -> Self {
		Self::run_with_port(0).await
	}

	pub async fn run_with_port(port: u16) -> Self {
		let listener = TcpListener::bind(("127.0.0.1", port))
			.await
			.expect("failed to bind");
		let address = listener.local_addr().expect("failed to get local addr");
		let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

		let state = AppState {
			in_flight: Arc::new(AtomicUsize::new(0)),
			max_in_flight: Arc::new(AtomicUsize::new(0)),
			client: reqwest::Client::new(),
		};
		let app = Router::new()
			.route("/hello", get(hello_handler))
			.route("/slow", post(slow_handler))
			.route("/concurrency", get(concurrency_handler))
			.route(
				"/echo-headers",
				get(echo_headers_handler).post(echo_headers_handler),
			)
			.route("/ws", get(ws_handler))
			.with_state(state);
		let server = async move {
			axum::serve(listener, app)
				.with_graceful_shutdown(async move {
					let _ = shutdown_rx.await;
				})
				.await
				.expect("server error");
		};

		let handle = tokio::spawn(server);

		Server {
			address,
			shutdown: shutdown_tx,
			handle,
		}
	}

	pub fn address(&self) -> SocketAddr {
		self.address
	}

	pub async fn shutdown(self) {
		let _ = self.shutdown.send(());
		let _ = self.handle.await;
	}

	pub async fn wait_for_shutdown(self) {
		let _ = self.handle.await;
	}
}

async fn hello_handler() -> &'static str {
	"Hello from test-server"
}

/// Holds the request long enough for concurrent callers to overlap, and
/// reports three context entries through the callback channel when one is
/// offered.
async fn slow_handler(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: String,
) -> impl IntoResponse {
	let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
	state.max_in_flight.fetch_max(now, Ordering::SeqCst);

	if let Some(callback) = headers
		.get("x-callback-url")
		.and_then(|value| value.to_str().ok())
	{
		for i in 1..=3 {
			let result = state
				.client
				.post(callback)
				.header("content-type", "text/plain")
				.body(format!("context #{i}"))
				.send()
				.await;
			if let Err(err) = result {
				warn!("context report failed: {err}");
			}
		}
	}
	tokio::time::sleep(Duration::from_millis(500)).await;
	tracing::debug!(%body, "slow endpoint done");

	state.in_flight.fetch_sub(1, Ordering::SeqCst);
	(
		StatusCode::CREATED,
		Json(json!({"message": "Slow endpoint done"})),
	)
}

async fn concurrency_handler(State(state): State<AppState>) -> Json<ConcurrencySnapshot> {
	Json(ConcurrencySnapshot {
		current: state.in_flight.load(Ordering::SeqCst),
		max: state.max_in_flight.load(Ordering::SeqCst),
	})
}

async fn echo_headers_handler(headers: HeaderMap) -> Json<HashMap<String, String>> {
	let headers: HashMap<String, String> = headers
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
		.collect();
	Json(headers)
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
	ws.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
	while let Some(Ok(message)) = socket.recv().await {
		if socket.send(message).await.is_err() {
			break;
		}
	}
}
