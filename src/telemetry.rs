//! Logging setup.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Default filter when `RESIDUE_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "residue_events=info";

/// Install the global subscriber. Idempotent.
///
/// `RESIDUE_LOG` takes the usual `EnvFilter` syntax, e.g.
/// `RESIDUE_LOG=residue_events::orchestrator=debug,residue_events::usage=warn`.
/// Output goes to stderr so command output on stdout stays machine readable.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env("RESIDUE_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        // Another subscriber (e.g. a test harness) may already be installed.
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init();
    });
}
