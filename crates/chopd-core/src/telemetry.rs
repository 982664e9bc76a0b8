use tracing_subscriber::EnvFilter;

/// Install the global subscriber for the binary. Logs go to stderr so the
/// proxied application's own stdout stays clean.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}

pub mod testing {
	use std::sync::Once;

	use tracing_subscriber::EnvFilter;

	static INIT: Once = Once::new();

	/// Test-friendly subscriber setup; safe to call from every test.
	pub fn setup_test_logging() {
		INIT.call_once(|| {
			let _ = tracing_subscriber::fmt()
				.with_env_filter(
					EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
				)
				.with_test_writer()
				.try_init();
		});
	}
}
