use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins; otherwise the crate logs
/// at `info`, or `debug` with `verbose`. Output goes to stderr so streamed
/// answers on stdout stay clean.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "chatrelay=debug,tower_http=debug"
    } else {
        "chatrelay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
