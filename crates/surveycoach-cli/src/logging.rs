//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `warn`, or `debug` for our crates
/// with `--verbose`. Logs go to stderr so stdout stays the answer stream.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "warn,surveycoach_core=debug,surveycoach_runtime=debug,surveycoach_cli=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
