//! Subscriber bootstrap shared by the server and client binaries.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber on stderr. `RUST_LOG` wins over `default_directive`.
/// Calling it twice is harmless: the second install is ignored.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
