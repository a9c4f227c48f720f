use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber for host applications and admin
/// tooling. Honors `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
