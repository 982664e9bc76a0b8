//! Process-level shutdown: a single await point that resolves when the
//! operator asks the proxy to stop.

/// Completes on SIGINT or SIGTERM (Ctrl+C on non-unix platforms).
pub async fn shutdown_requested() {
	imp::wait().await
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tracing::info;

	pub(super) async fn wait() {
		let mut interrupt =
			signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
		let mut terminate =
			signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
		tokio::select! {
			_ = interrupt.recv() => info!("received SIGINT, shutting down"),
			_ = terminate.recv() => info!("received SIGTERM, shutting down"),
		}
	}
}

#[cfg(not(unix))]
mod imp {
	use tracing::info;

	pub(super) async fn wait() {
		let _ = tokio::signal::ctrl_c().await;
		info!("received Ctrl+C, shutting down");
	}
}
