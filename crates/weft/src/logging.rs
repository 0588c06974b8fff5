//! Logging initialization.

use flexi_logger::Logger;
use std::sync::Once;

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Initializes the `log` facade from the `RUST_LOG` environment variable.
///
/// Safe to call more than once; only the first call has any effect.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env() {
            let _ = logger.start();
        }
    });
}
