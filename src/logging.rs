use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

/// Initializes a process-wide `tracing` subscriber for binaries that embed this crate. Defaults to
/// INFO level but respects `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_target(true)
        .with_level(true);

    Registry::default().with(fmt_layer).with(filter).init();
}
