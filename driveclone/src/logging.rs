use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

/// Installs the stderr subscriber. The filter comes from `DRIVECLONE_LOG`,
/// then `RUST_LOG`, then `info`.
pub fn init() {
    let filter = filter_directives(
        std::env::var("DRIVECLONE_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter_layer = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter_layer)
        .try_init();
}

fn filter_directives(own: Option<String>, rust_log: Option<String>) -> String {
    own.into_iter()
        .chain(rust_log)
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}
