//! Runtime fixtures.

use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

use arbor_runtime::{ModuleTable, Runtime, RuntimeConfig};

/// Base directory every fixture runtime is rooted at.
pub const TEST_BASE_DIR: &str = "/app";

/// Mount timeout used by fixture runtimes.
pub const TEST_MOUNT_TIMEOUT: Duration = Duration::from_millis(500);

/// Debounce used by fixture runtimes.
pub const TEST_DEBOUNCE: Duration = Duration::from_millis(50);

/// Absolute path of a file under the fixture plugin directory.
///
/// `plugin("db")` is `/app/plugins/db`, `plugin("db/users")` is
/// `/app/plugins/db/users`.
#[must_use]
pub fn plugin(relative: &str) -> PathBuf {
    PathBuf::from(TEST_BASE_DIR).join("plugins").join(relative)
}

/// Fixture configuration mounting `entries`.
#[must_use]
pub fn test_config<I, S>(entries: I) -> RuntimeConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    RuntimeConfig::new(TEST_BASE_DIR)
        .with_entries(entries)
        .with_mount_timeout(TEST_MOUNT_TIMEOUT)
        .with_reload_debounce(TEST_DEBOUNCE)
}

/// A runtime over an empty module table, plus the table to fill.
#[must_use]
pub fn test_runtime<I, S>(entries: I) -> (Runtime, ModuleTable)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let modules = ModuleTable::new();
    let runtime = Runtime::new(test_config(entries), Arc::new(modules.clone()));
    (runtime, modules)
}

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
