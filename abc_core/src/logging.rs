//! Tracing setup shared by the `abc-case` binary and the test suites.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber at `info`
///
/// `RUST_LOG` takes precedence when set. Events go to stderr; stdout carries
/// only command results.
pub fn init() {
    init_with_level("info")
}

/// Install the global subscriber, falling back to `default_level` when
/// `RUST_LOG` is unset or does not parse
pub fn init_with_level(default_level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(default_level),
    };

    let events = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry().with(filter).with(events).init();
}

/// Route `debug` events into libtest's captured output
///
/// Safe to call from every test; only the first call installs anything.
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
