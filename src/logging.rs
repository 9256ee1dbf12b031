use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,grabtube=debug";

/// Installs the stderr subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("logging initialized");
    }
}
