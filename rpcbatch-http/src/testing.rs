//! Test support for the HTTP transport.  The integration tests include this file with `#[path]`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Shows the transport's request logging along with the scheduler's lifecycle events
const DEFAULT_LOG_FILTER: &str = "rpcbatch_http=trace,rpcbatch_jsonrpc=debug,warn";

/// Install a `tracing` subscriber that writes to the test harness, once per test binary.
pub fn init_test_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}
