use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Installs the global `tracing` subscriber. Verbosity is controlled by
/// `RUST_LOG` (standard `tracing_subscriber::EnvFilter` syntax), defaulting to
/// `info` for this crate's targets and `warn` for dependencies.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,tower_http=warn"));

    let json = ["1", "true"].contains(
        &std::env::var("LOG_JSON")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
    );

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
