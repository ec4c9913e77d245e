//! Diagnostic tracing for the orchestrator.
//!
//! Tracing goes to stderr. Agent output is not routed through here; it lives
//! in each agent's log buffer and in `foreman status`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, by `-v` count. Dependencies stay at
/// `warn` so git and hosting chatter only shows up through our own events.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,foreman=info",
        _ => "warn,foreman=debug",
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `verbosity`.
///
/// ```bash
/// foreman -v deploy 42                # lifecycle events
/// RUST_LOG=foreman::reconcile=debug foreman deploy 42
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_only_raises_our_own_modules() {
        assert_eq!(default_filter(0), "warn");
        assert_eq!(default_filter(1), "warn,foreman=info");
        assert_eq!(default_filter(5), "warn,foreman=debug");
        for verbosity in 0..3 {
            assert!(EnvFilter::try_new(default_filter(verbosity)).is_ok());
        }
    }
}
