//! Tracing configuration and initialization.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

fn should_use_color<T: IsTerminal>(stream: &T) -> bool {
    let force = std::env::var_os("FORCE_COLOR").is_some_and(|v| !v.is_empty());
    let suppress = std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty());
    force || (stream.is_terminal() && !suppress)
}

/// Initialize the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(should_use_color(&std::io::stdout()))
        .with_target(false)
        .init();
}
