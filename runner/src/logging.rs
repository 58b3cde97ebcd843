use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// install the global subscriber, `RUST_LOG` overrides the default level
pub fn init(default_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}
