use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber. The level is read from `RUST_LOG`, defaulting to `info`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();
}
