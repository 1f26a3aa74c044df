//! Test support shared by unit tests and, through `#[path]`, the integration tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Crates whose logs tests want to see at full detail, unless `RUST_LOG` says otherwise
const DEFAULT_LOG_FILTER: &str = "rpcbatch_jsonrpc=trace,info";

/// Send `tracing` output to the test harness's captured output.
///
/// Safe to call from every test; only the first call installs the subscriber.
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
