//! Wiring: bind the listener, start the accept loop and the optional target
//! process, and tie everything to the shutdown signal.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::proxy::Pipeline;
use crate::queue::RequestQueue;
use crate::store::Store;
use crate::target::TargetProcess;

pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.proxy_port))
		.await
		.with_context(|| format!("binding proxy port {}", config.proxy_port))?;
	let address = listener.local_addr().context("reading bound address")?;

	let target = match &config.command {
		Some(command) => Some(TargetProcess::spawn(
			command,
			&config.env,
			config.target_port,
		)?),
		None => None,
	};

	let store = Arc::new(Store::default());
	let queue = Arc::new(RequestQueue::new());
	let pipeline = Pipeline::new(store, queue, address.port(), config.target_port);
	let accept = tokio::spawn(accept_loop(listener, pipeline));

	info!(%address, target_port = config.target_port, "proxy started");
	Ok(Bound {
		address,
		accept,
		target,
	})
}

async fn accept_loop(listener: TcpListener, pipeline: Pipeline) {
	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(err) => {
				warn!("accept failed: {err}");
				continue;
			},
		};
		let pipeline = pipeline.clone();
		tokio::spawn(async move {
			if let Err(err) = pipeline.serve_connection(stream).await {
				debug!(%peer, "connection ended with error: {err}");
			}
		});
	}
}

pub struct Bound {
	address: SocketAddr,
	accept: JoinHandle<()>,
	target: Option<TargetProcess>,
}

impl Bound {
	/// The actually bound address (the configured port may have been 0 in
	/// tests).
	pub fn address(&self) -> SocketAddr {
		self.address
	}

	/// Block until SIGINT/SIGTERM, then stop accepting connections and tear
	/// down the target process.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		chopd_core::signal::shutdown_requested().await;
		self.accept.abort();
		if let Some(target) = self.target {
			target.shutdown().await;
		}
		Ok(())
	}
}
