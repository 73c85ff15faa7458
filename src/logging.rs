use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Log to stderr at info, or at the levels `RUST_LOG` asks for
pub fn register_logger() {
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();
}
