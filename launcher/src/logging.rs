//! Diagnostic tracing for the launcher itself.
//!
//! Output goes to the wrapper's own stderr. It is never routed through the
//! child's bound channels, so a child whose fd 2 is bound elsewhere does not
//! see launcher diagnostics mixed into its stream.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise only warnings are shown (timeouts,
/// truncated captures, teardown problems), or launcher debug events when
/// `verbose` is set, which includes the descriptor plan of every launch.
///
/// ```bash
/// RUST_LOG=launcher::io::spawner=debug launcher run manifest.json
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,launcher=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
