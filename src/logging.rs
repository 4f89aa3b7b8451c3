//! Logging bootstrap (ambient stack, §6): two environment knobs only —
//! `DCC_DEBUG` raises verbosity, `DCC_TEST_RUNNER` routes output to stderr.
//! Nothing else is read from the environment.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Idempotent: safe to call from every entry point (library init, the
/// probe binary, tests) without double-installing the subscriber.
pub fn init_tracing() {
    INIT.call_once(|| {
        let default_level = if std::env::var("DCC_DEBUG").is_ok() {
            "debug"
        } else {
            "info"
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if std::env::var("DCC_TEST_RUNNER").is_ok() {
            builder.with_writer(std::io::stderr).init();
        } else {
            builder.init();
        }
    });
}
