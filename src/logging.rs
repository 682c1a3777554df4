//! Diagnostic tracing setup for the `ralph` binary.
//!
//! Library code only emits `tracing` events. Persisted artifacts (audit log,
//! checkpoints, signal and proposal logs) are written regardless of `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "warn,ralph_orchestrator=info,ralph=info";

/// Initialize the global subscriber. Output goes to stderr in compact form.
///
/// `verbose` raises the crate's level to `debug`.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("warn,ralph_orchestrator=debug,ralph=debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    });

    // A second init (e.g. from tests) is harmless
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
