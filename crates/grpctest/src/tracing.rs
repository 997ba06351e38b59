use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Route `tracing` output through the libtest writer so it is captured per test.
/// Filtered by `RUST_LOG`; silent when unset.
///
/// Safe to call from every test; later calls are ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
