mod cluster;
mod flaky;

pub use cluster::{TestCluster, new_label};
pub use flaky::FlakyReplica;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber once per test binary. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
