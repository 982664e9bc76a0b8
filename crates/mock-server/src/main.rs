use mock_server::Server;

#[tokio::main]
async fn main() {
	let port = std::env::var("PORT")
		.ok()
		.and_then(|raw| raw.parse().ok())
		.unwrap_or(3000);
	let server = Server::run_with_port(port).await;
	println!("mock server listening on {}", server.address());
	server.wait_for_shutdown().await;
}
